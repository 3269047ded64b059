//! flash-run - Main Entry Point

use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use flash_run::{
    config::Args,
    openocd::{OpenocdBackend, OpenocdSettings},
    run_cli, Config, LoadPlan,
};

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.settings.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };
    config.merge_args(&args);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::from(e.exit_code());
    }

    if args.show_config {
        return match config.to_toml() {
            Ok(toml) => {
                println!("{}", toml);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(e.exit_code())
            }
        };
    }

    let Some((image, session_config)) = args.load_paths() else {
        eprintln!("Error: an image and a session configuration are required");
        return ExitCode::from(2);
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Error: failed to initialize logging: {}", e);
        return ExitCode::from(2);
    }

    info!("Starting flash-run v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command line args: {:?}", args);

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let backend = OpenocdBackend::new(OpenocdSettings::from(&config));
    let plan = LoadPlan::from_config(image, session_config, &config);

    let code = runtime.block_on(run_cli(
        backend,
        plan,
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    ));
    ExitCode::from(code)
}

/// Initialize logging system
fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &config.logging.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;

        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", config.logging.level);
    Ok(())
}
