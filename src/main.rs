// Entrypoint for the compression run.
// - Keeps `main` small: set up logging and configuration, obtain an
//   authorized client, then hand it to the migration loop.
// - Storage errors end the run with a logged message and exit status 1;
//   anything else propagates out of `main`.

use drivepack::api::DriveClient;
use drivepack::auth::{self, OAuthProvider};
use drivepack::config::Config;
use drivepack::migrate::{self, MigrationError};
use std::io::Write;
use std::process::ExitCode;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} - {}",
                record.level(),
                buf.timestamp_millis(),
                record.args()
            )
        })
        .init();
}

fn main() -> anyhow::Result<ExitCode> {
    init_logging();

    let config = Config::from_env()?;
    let provider = OAuthProvider::new(config.token_file.clone(), config.client_secret_file.clone());
    let token = auth::authorize(&provider)?;
    let drive = DriveClient::new(&token.token, config.http_timeout)?;

    match migrate::run(&drive, &config.migration) {
        Ok(report) => {
            if !report.migrated.is_empty() || !report.failed.is_empty() {
                log::info!(
                    "Done: {} compressed, {} failed",
                    report.migrated.len(),
                    report.failed.len()
                );
            }
            if report.failed.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Err(MigrationError::Storage(e)) => {
            log::error!("An error occurred: {}", e);
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
