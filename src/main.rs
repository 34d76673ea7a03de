//! `wellstream` binary: an ETP store endpoint consuming channel data.
//!
//! Every accepted session binds a channel consumer whose appends feed a
//! process-wide liveness registry. A growing-object monitor clears the
//! growing flag of quiet objects and logs each change.

mod cli;

use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wellstream::{
    EtpConfig,
    SessionBuilder,
    liveness::{GrowingObjectMonitor, GrowingObjectStore, LivenessRegistry, PersistError},
    server::EtpServer,
    streaming::{ChannelConsumer, ChannelDataBatch, ChannelDataSink, SinkError},
};

use crate::cli::{Cli, Command, ServeArgs};

/// Persistence collaborator that only logs flag changes.
struct LoggingStore;

#[async_trait]
impl GrowingObjectStore for LoggingStore {
    async fn persist_growing_flag(&self, uri: &str, growing: bool) -> Result<(), PersistError> {
        info!(%uri, growing, "growing flag changed");
        Ok(())
    }
}

/// Sink that logs each accepted batch.
struct LoggingSink;

#[async_trait]
impl ChannelDataSink for LoggingSink {
    async fn deliver(&self, batch: ChannelDataBatch) -> Result<(), SinkError> {
        debug!(kind = ?batch.kind, items = batch.items.len(), "received channel data");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::CheckConfig { path } => {
            let config = EtpConfig::load(&path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => EtpConfig::load(path)?,
        None => EtpConfig::default(),
    };

    #[cfg(feature = "metrics")]
    if let Some(addr) = args.metrics {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "serving metrics");
    }

    let registry = LivenessRegistry::new();
    let shutdown = CancellationToken::new();
    let monitor =
        GrowingObjectMonitor::from_config(registry.clone(), Arc::new(LoggingStore), &config)
            .spawn(shutdown.clone());

    let session_config = config.clone();
    let mut server = EtpServer::new(move || {
        let consumer = ChannelConsumer::new(&session_config, Arc::new(LoggingSink))
            .with_liveness(registry.clone());
        SessionBuilder::new(session_config.clone())
            .application(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
            .handler(Arc::new(consumer))
    });
    if args.no_preamble {
        server = server.without_preamble();
    }
    server.bind(args.bind)?.run().await?;

    monitor.shutdown().await;
    Ok(())
}
