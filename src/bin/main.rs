//! apiwatch binary - collects API telemetry, detects anomalies, tracks issues.

#![deny(missing_docs)]

use apiwatch::{
    init_logging::init_logging,
    store::{MemoryAlertStore, MemoryIssueStore, MemoryLogStore, MemoryRateEventStore},
    Collector, CollectorConfig, Stores,
};
use conf::Conf;
use hyper::service::service_fn;
use hyper_util::{rt::TokioIo, server::conn::auto};
use std::{env, fs, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Top-level configuration for apiwatch.
#[derive(Conf, Debug)]
#[conf(serde, test)]
pub struct Config {
    /// Path to a TOML config file (optional).
    /// This is parsed before other args, so config file values can be overridden by CLI args.
    #[allow(dead_code)] // Parsed early via find_parameter, kept here for --help
    #[conf(long)]
    config_file: Option<PathBuf>,
    /// If true, just validate config and don't start
    #[conf(long)]
    dry_run: bool,
    /// Socket to listen for HTTP requests
    #[conf(long, env, default_value = "0.0.0.0:8000")]
    http_listen_addr: SocketAddr,
    #[conf(flatten, serde(flatten))]
    collector: CollectorConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // Check for --config-file before the main parse, so we can load it and pass to conf
    let config_file_path = conf::find_parameter("config-file", env::args_os());

    let config = if let Some(config_path) = config_file_path {
        let path_display = config_path.to_string_lossy();
        let file_contents = fs::read_to_string(&config_path)
            .map_err(|err| format!("Could not open config file '{path_display}': {err}"))?;
        let doc: toml::Value = toml::from_str(&file_contents)
            .map_err(|err| format!("Config file '{path_display}' is not valid TOML: {err}"))?;
        info!("Loaded config file: {path_display}");
        Config::conf_builder().doc(path_display, doc).parse()
    } else {
        Config::parse()
    };

    info!("Config = {config:#?}");

    if config.dry_run {
        return Ok(());
    }

    let token = CancellationToken::new();

    let stores = Stores {
        logs: Arc::new(MemoryLogStore::new()),
        issues: Arc::new(MemoryIssueStore::new()),
        alerts: Arc::new(MemoryAlertStore::new()),
        rate_events: Arc::new(MemoryRateEventStore::new()),
    };
    let collector = Arc::new(Collector::new(config.collector, stores, token.clone()));

    let listener = TcpListener::bind(config.http_listen_addr).await?;
    info!("Listening for http on {}", config.http_listen_addr);

    // Listen for ctrl-c
    let thread_token = token.clone();
    tokio::task::spawn(async move {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler failed");
        warn!("ctrl-c: Stop requested");
        thread_token.cancel();
    });

    let _http_task = start_http_task(listener, collector.clone());

    // Block until shutdown is requested, then let the evaluation worker
    // drain what it already accepted.
    token.cancelled().await;
    collector.shutdown().await;

    Ok(())
}

fn start_http_task(
    listener: TcpListener,
    collector: Arc<Collector>,
) -> tokio::task::JoinHandle<()> {
    // Loop waiting for http incoming connections, and pass them to the collector
    tokio::task::spawn(async move {
        loop {
            let Ok((stream, remote_addr)) = listener
                .accept()
                .await
                .inspect_err(|err| error!("Error accepting connection: {err}"))
            else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            info!("New connection from: {}", remote_addr);

            // Spawn a new task to handle each connection
            let thread_collector = collector.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                // Serve the connection using auto protocol detection (HTTP/1 or HTTP/2)
                if let Err(err) = auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                    .serve_connection(
                        io,
                        service_fn(|req| {
                            let thread_collector = thread_collector.clone();
                            async move { thread_collector.handle_http_request(req).await }
                        }),
                    )
                    .await
                {
                    error!("Error serving connection: {err}");
                }
            });
        }
    })
}
