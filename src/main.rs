//! data-retrieval - probe a data source from the command line.
//!
//! Connects inside a scoped acquisition, reports the health check, optionally
//! runs one fetch and prints the result as JSON on stdout. Logs go to stderr.

use data_retrieval::config::{Config, SourceConfig};
use data_retrieval::db::{AsyncSqlProvider, ReadOnlySql};
use data_retrieval::models::{QueryResult, RestRequest, SqlRequest};
use data_retrieval::provider::AsyncProvider;
use data_retrieval::rest::AsyncRestProvider;
use data_retrieval::transport::AsyncTransport;
use data_retrieval::DataResult;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Connect, check health, fetch once if asked, and always release, also
/// when interrupted by a signal.
async fn probe<T: AsyncTransport>(
    mut provider: AsyncProvider<T>,
    request: Option<T::Request>,
) -> DataResult<Option<QueryResult>> {
    let mut guard = provider.async_connection().await?;

    let work = async {
        if guard.health_check().await {
            info!(provider = %guard.id(), "Health check passed");
        } else {
            warn!(provider = %guard.id(), "Health check failed");
        }
        match &request {
            Some(request) => guard.fetch(request).await.map(Some),
            None => Ok(None),
        }
    };
    let result = tokio::select! {
        result = work => result,
        _ = wait_for_signal() => {
            warn!("Interrupted, releasing connection");
            Ok(None)
        }
    };

    guard.release().await;
    result
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let source = config.source_config()?;
    info!(
        source = %source.describe(),
        "Starting data-retrieval v{}",
        env!("CARGO_PKG_VERSION")
    );

    let outcome = match source {
        SourceConfig::Database(db) => {
            let database_type = db.database_type;
            let mut provider =
                AsyncSqlProvider::from_config(db).with_retry_policy(config.retry_policy());
            if let Some(limit) = config.operation_timeout() {
                provider = provider.with_operation_timeout(limit);
            }
            if config.read_only {
                provider = provider.with_validator(ReadOnlySql::new(database_type));
            }
            probe(provider, config.fetch.as_deref().map(SqlRequest::new)).await
        }
        SourceConfig::Rest(rest) => {
            let mut provider =
                AsyncRestProvider::from_config(rest).with_retry_policy(config.retry_policy());
            if let Some(limit) = config.operation_timeout() {
                provider = provider.with_operation_timeout(limit);
            }
            let body = config.body_json()?;
            let request = config.fetch.as_deref().map(|endpoint| RestRequest {
                body: body.clone(),
                ..RestRequest::new(config.method, endpoint)
            });
            probe(provider, request).await
        }
    };

    match outcome {
        Ok(Some(result)) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "Probe failed");
            Err(e.into())
        }
    }
}
