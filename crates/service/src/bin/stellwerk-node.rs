//! stellwerk-node: runs a small cluster of service peers on the in-memory
//! fabric.
//!
//! Every peer negotiates the master job on the broadcast `cluster` channel.
//! The elected master produces work items on the `work` queue; all peers
//! consume them.
//!
//! # Usage
//!
//! ```bash
//! # Three peers for a minute, statistics of the first peer on :8080
//! stellwerk-node --peers 3 --duration-secs 60 --statistics-port 8080
//!
//! # Base config from TOML, JSON logs
//! STELLWERK_CONFIG=node.toml stellwerk-node --json-logs
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use stellwerk_command::{CommandError, CommandPolicy, MasterJobPolicy, RequestContext};
use stellwerk_comms::{ChannelMode, MemoryFabric};
use stellwerk_core::config::load_dotenv;
use stellwerk_core::{
    Dispatcher, MessageFilter, ProcessOptions, ServiceMessage, ServiceMessageHeader,
    TransmissionPayload,
};
use stellwerk_service::{init_tracing, spawn_statistics_server, Microservice, ServiceConfig};
use stellwerk_tasks::{Frequency, Schedule, TaskError};

const CLUSTER_CHANNEL: &str = "cluster";
const WORK_CHANNEL: &str = "work";

/// Run service peers that elect a master and share a work queue.
#[derive(Parser, Debug)]
#[command(name = "stellwerk-node", version, about)]
struct Cli {
    /// Number of peers to run.
    #[arg(long, env = "STELLWERK_NODE_PEERS", default_value_t = 3)]
    peers: usize,

    /// Stop after this many seconds (0 = until ctrl-c).
    #[arg(long, env = "STELLWERK_NODE_DURATION_SECS", default_value_t = 0)]
    duration_secs: u64,

    /// HTTP port for the first peer's `/statistics` endpoint (0 = disabled).
    #[arg(long, env = "STELLWERK_NODE_STATISTICS_PORT", default_value_t = 0)]
    statistics_port: u16,

    /// Base TOML config applied to every peer.
    #[arg(long, env = "STELLWERK_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "STELLWERK_JSON_LOGS", default_value_t = false)]
    json_logs: bool,

    /// Seconds between work items produced by the master.
    #[arg(long, env = "STELLWERK_NODE_PRODUCE_SECS", default_value_t = 1)]
    produce_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkItem {
    sequence: u64,
    producer: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    tracing::info!(?cli, "starting stellwerk-node");

    let base = match &cli.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::from_env()?,
    };

    let fabric = MemoryFabric::new();
    fabric.declare(CLUSTER_CHANNEL, ChannelMode::Broadcast);
    fabric.declare(WORK_CHANNEL, ChannelMode::Queue);

    let mut peers = Vec::with_capacity(cli.peers);
    for index in 0..cli.peers.max(1) {
        let peer = build_peer(&base, &fabric, index, Duration::from_secs(cli.produce_secs.max(1)))?;
        peer.start()?;
        peers.push(peer);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = (cli.statistics_port > 0).then(|| {
        spawn_statistics_server(cli.statistics_port, Arc::clone(&peers[0]), shutdown_rx)
    });

    let duration = cli.duration_secs;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown signal received"),
        _ = async {
            if duration == 0 {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_secs(duration)).await;
        } => tracing::info!(duration, "run duration elapsed"),
    }

    for peer in &peers {
        report(peer);
    }
    for peer in &peers {
        peer.stop().await;
    }
    shutdown_tx.send(true).ok();
    if let Some(server) = server {
        server.await.ok();
    }
    tracing::info!("stellwerk-node exited cleanly");
    Ok(())
}

fn build_peer(
    base: &ServiceConfig,
    fabric: &MemoryFabric,
    index: usize,
    produce_every: Duration,
) -> anyhow::Result<Arc<Microservice>> {
    let service_id = format!("{}-{}", base.service.name, index + 1);
    let mut config = base.clone();
    config.service.service_id = Some(service_id.clone());
    config
        .commands
        .entry("coordinator".to_string())
        .or_insert_with(|| CommandPolicy {
            master_job: MasterJobPolicy {
                enabled: true,
                negotiation_channel: Some(CLUSTER_CHANNEL.to_string()),
                negotiating_poll_min_secs: 1,
                negotiating_poll_max_secs: 3,
                active_poll_min_secs: 2,
                active_poll_max_secs: 4,
                ..Default::default()
            },
            ..Default::default()
        });

    let service = Arc::new(Microservice::new(config)?);

    let coordinator = service.create_command("coordinator")?;
    let dispatcher = service.dispatcher();
    let identity = service.identity().clone();
    let sequence = Arc::new(AtomicU64::new(0));
    coordinator.register_master_job(Schedule::new(
        "produce-work",
        Frequency::Every(produce_every),
        move |_| {
            let item = WorkItem {
                sequence: sequence.fetch_add(1, Ordering::Relaxed),
                producer: identity.service_id.clone(),
            };
            let header = ServiceMessageHeader::new(WORK_CHANNEL, "item", None);
            let result = ServiceMessage::new(header, &identity, &item).map(|message| {
                dispatcher.dispatch(
                    TransmissionPayload::new(message).with_options(ProcessOptions::EXTERNAL_ONLY),
                )
            });
            async move { result.map_err(|e| TaskError::failed(e.to_string())) }
        },
    ))?;

    let worker = service.create_command("worker")?;
    let consumer = service_id.clone();
    worker.register(
        MessageFilter::new(WORK_CHANNEL, Some("item"), None)?,
        move |ctx: RequestContext| {
            let consumer = consumer.clone();
            async move {
                let item: WorkItem = ctx.decode()?;
                tracing::info!(
                    consumer = %consumer,
                    producer = %item.producer,
                    sequence = item.sequence,
                    "work item processed"
                );
                Ok::<_, CommandError>(Vec::new())
            }
        },
    );

    service.register_listener(Arc::new(fabric.listener(
        format!("{service_id}-cluster"),
        CLUSTER_CHANNEL,
        2,
    )?));
    service.register_listener(Arc::new(fabric.listener(
        format!("{service_id}-work"),
        WORK_CHANNEL,
        1,
    )?));
    service.register_sender(Arc::new(
        fabric.sender(format!("{service_id}-out"), [CLUSTER_CHANNEL, WORK_CHANNEL]),
    ));
    Ok(service)
}

fn report(peer: &Microservice) {
    let master = peer
        .command("coordinator")
        .and_then(|c| c.statistics().master_job);
    let processed = peer
        .command("worker")
        .map(|c| c.statistics().processed)
        .unwrap_or_default();
    match master {
        Some(m) => tracing::info!(
            peer = %peer.identity().service_id,
            state = ?m.state,
            master = m.current_master.as_deref().unwrap_or("-"),
            standbys = m.standbys.len(),
            processed,
            "peer summary"
        ),
        None => tracing::info!(peer = %peer.identity().service_id, processed, "peer summary"),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
