mod cli;
mod commands;

use std::process::ExitCode;

use infrastructure::config::LogFormat;
use infrastructure::logging::init_logging;

fn main() -> ExitCode {
    let cli = cli::parse();

    let level = cli.log_level.unwrap_or_default();
    let format = cli.log_format.unwrap_or(LogFormat::Text);
    if let Err(e) = init_logging(level, format) {
        eprintln!("error: cannot initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match commands::run(cli) {
        Ok(outcome) => outcome.into(),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
