//! `cadence-rti [config.json]`
//!
//! Runs an RTI until every federate has connected and resigned.

use std::process::ExitCode;

use cadence_runtime::{init_tracing, RtiConfig, RtiServer};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match std::env::args().nth(1) {
        Some(path) => match RtiConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cadence-rti: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => RtiConfig::default(),
    };

    if let Err(e) = init_tracing(&config.log) {
        eprintln!("cadence-rti: {}", e);
        return ExitCode::FAILURE;
    }

    let server = match RtiServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start RTI");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "RTI failed");
            ExitCode::FAILURE
        }
    }
}
