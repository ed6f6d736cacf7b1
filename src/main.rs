use clap::Parser;
use std::process::ExitCode;

use guarantee_collector_lib::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match CliArgs::parse().into_config().and_then(|config| {
        config.validate()?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    match guarantee_collector_lib::run(config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}
