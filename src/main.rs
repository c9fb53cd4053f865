use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use ca_bootstrap::config::Settings;
use ca_bootstrap::ssl::{FileCertProvider, HttpCaClient, RcgenCsrBuilder};
use ca_bootstrap::{Driver, EnsureOutcome};
use ca_bootstrap::telemetry::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&settings.logging) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(certname = %settings.certname, ca_base_url = %settings.ca_base_url, "starting SSL bootstrap");

    let ca_client = match HttpCaClient::new(settings.ca_base_url.clone(), Duration::from_secs(settings.ca_timeout_secs)) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to construct CA client");
            return ExitCode::FAILURE;
        }
    };
    let cert_provider = Arc::new(FileCertProvider::new(settings.ssldir.clone(), settings.certname.clone()));
    let csr_builder = Arc::new(RcgenCsrBuilder::new());

    let driver = Driver::new(settings, ca_client, cert_provider, csr_builder);

    match driver.ensure_client_certificate().await {
        Ok(EnsureOutcome::Context(_)) => {
            info!("SSL bootstrap complete");
            ExitCode::SUCCESS
        }
        Ok(EnsureOutcome::ExitRequested) => ExitCode::from(1),
        Err(fatal) => {
            error!(error = %fatal, "SSL bootstrap failed");
            ExitCode::FAILURE
        }
    }
}
