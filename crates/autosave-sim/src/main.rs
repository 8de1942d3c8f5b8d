//! autosave-sim: Runs several autosave coordinators against one simulated
//! awareness network and reports how they behaved.
//!
//! Peers edit at random, gossip is delivered in rounds, and the save callback
//! fails at a configurable rate, so the debounce, back-off and convergence
//! behaviour can be watched in the logs.

use anyhow::{Context, Result};
use autosave_core::{
    Author, AutosaveConfig, AutosaveCoordinator, AutosaveEvent, Awareness, AwarenessHub,
    MemoryDocument, PeerId, SaveError, SaveReceipt, SaveStatus, Subscription,
};
use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const NAMES: [&str; 6] = ["Alice", "Bob", "Carol", "Dave", "Erin", "Frank"];

#[derive(Parser, Debug)]
#[command(name = "autosave-sim")]
#[command(about = "Simulate leaderless autosave between collaborating peers")]
struct Args {
    /// Number of peers editing the document
    #[arg(short, long, default_value_t = 3)]
    peers: usize,

    /// How long peers keep editing, in milliseconds
    #[arg(short, long, default_value_t = 10_000)]
    duration_ms: u64,

    /// Probability that a save callback rejects
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Delay between awareness gossip rounds, in milliseconds
    #[arg(long, default_value_t = 50)]
    gossip_interval_ms: u64,

    /// Probability that a peer edits on each 100ms tick
    #[arg(long, default_value_t = 0.2)]
    edit_rate: f64,

    /// How long each save takes, in milliseconds
    #[arg(long, default_value_t = 200)]
    save_latency_ms: u64,

    /// Coordinator configuration as JSON (defaults if not provided)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the quiet period from the configuration
    #[arg(long)]
    quiet_period_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// Counters shared by every peer's save callback.
#[derive(Default)]
struct SaveStats {
    attempts: AtomicUsize,
    failures: AtomicUsize,
    versions: AtomicUsize,
}

/// One simulated editing session.
struct SimPeer {
    name: &'static str,
    doc: MemoryDocument,
    coordinator: AutosaveCoordinator,
    edits: usize,
    _events: Subscription,
}

impl SimPeer {
    fn join(
        hub: &Arc<AwarenessHub>,
        index: usize,
        config: &AutosaveConfig,
        stats: &Arc<SaveStats>,
        failure_rate: f64,
        save_latency: Duration,
    ) -> Result<Self> {
        let peer_id = PeerId::from(index as u64 + 1);
        let name = NAMES[index % NAMES.len()];
        let doc = MemoryDocument::new(peer_id);
        let awareness = hub.join(peer_id);
        awareness.set_local_state_field(&config.author_field, json!({ "name": name }));

        let stats = Arc::clone(stats);
        let saver = move |authors: Vec<Author>| {
            stats.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = rand::rng().random_bool(failure_rate);
            if fail {
                stats.failures.fetch_add(1, Ordering::SeqCst);
            }
            let stats = Arc::clone(&stats);
            async move {
                sleep(save_latency).await;
                if fail {
                    return Err(SaveError::Rejected("simulated storage failure".into()));
                }
                let names: Vec<_> = authors.iter().map(|a| a.name.as_str()).collect();
                debug!("Stored document for {}", names.join(", "));
                let version = stats.versions.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(SaveReceipt::version(format!("1.{}", version)))
            }
        };

        let coordinator =
            AutosaveCoordinator::start(&doc, awareness, Arc::new(saver), config.clone())
                .with_context(|| format!("Failed to start coordinator for {}", name))?;

        let events = coordinator.subscribe(move |event| match event {
            AutosaveEvent::StatusChanged { status } => {
                info!("[{}] status {}", name, status);
            }
            AutosaveEvent::SaveSucceeded { authors } => {
                info!("[{}] saved on behalf of {} author(s)", name, authors.len());
            }
            AutosaveEvent::SaveFailed { error } => {
                warn!("[{}] save failed: {}", name, error);
            }
            AutosaveEvent::VersionCreated {
                version, saved_by, ..
            } => {
                debug!("[{}] version {} created by {}", name, version, saved_by);
            }
        });

        Ok(Self {
            name,
            doc,
            coordinator,
            edits: 0,
            _events: events,
        })
    }

    fn edit(&mut self) {
        self.edits += 1;
        self.doc.edit();
    }
}

fn load_config(args: &Args) -> Result<AutosaveConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid config {:?}", path))?
        }
        None => AutosaveConfig::default(),
    };
    if let Some(quiet_period_ms) = args.quiet_period_ms {
        config.quiet_period_ms = quiet_period_ms;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,autosave_core=debug"
    } else {
        "info,autosave_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    anyhow::ensure!(args.peers > 0, "At least one peer is required");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.failure_rate) && (0.0..=1.0).contains(&args.edit_rate),
        "Rates must be between 0 and 1"
    );

    let config = load_config(&args)?;
    info!(
        "Simulating {} peer(s) for {}ms (quiet period {}ms, failure rate {})",
        args.peers, args.duration_ms, config.quiet_period_ms, args.failure_rate
    );

    let hub = AwarenessHub::new();
    hub.hold();

    let stats = Arc::new(SaveStats::default());
    let save_latency = Duration::from_millis(args.save_latency_ms);
    let mut peers = (0..args.peers)
        .map(|index| SimPeer::join(&hub, index, &config, &stats, args.failure_rate, save_latency))
        .collect::<Result<Vec<_>>>()?;
    hub.flush();

    let mut edit_tick = interval(Duration::from_millis(100));
    edit_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut gossip_tick = interval(Duration::from_millis(args.gossip_interval_ms.max(1)));
    gossip_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = sleep(Duration::from_millis(args.duration_ms));
    tokio::pin!(deadline);
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = edit_tick.tick() => {
                for peer in peers.iter_mut() {
                    if rand::rng().random_bool(args.edit_rate) {
                        peer.edit();
                    }
                }
            }

            _ = gossip_tick.tick() => {
                hub.flush();
            }

            _ = &mut deadline => {
                info!("Editing stopped after {:?}", started.elapsed());
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Let pending saves and gossip settle.
    let settle = config.quiet_period() * 3 + save_latency * 2 + config.claim_delay().unwrap_or_default();
    let settle_deadline = Instant::now() + settle;
    while Instant::now() < settle_deadline {
        gossip_tick.tick().await;
        hub.flush();
    }
    hub.release();

    for peer in &peers {
        let state = peer.coordinator.state();
        info!(
            "{} ({}): {} edit(s), status {}, dirty {}",
            peer.name,
            peer.coordinator.peer_id(),
            peer.edits,
            peer.coordinator.status(),
            state.dirty
        );
    }

    let attempts = stats.attempts.load(Ordering::SeqCst);
    let failures = stats.failures.load(Ordering::SeqCst);
    let edits: usize = peers.iter().map(|peer| peer.edits).sum();
    info!(
        "{} edit(s), {} save attempt(s), {} failed",
        edits, attempts, failures
    );

    let unsaved = peers
        .iter()
        .filter(|peer| peer.coordinator.status() != SaveStatus::Saved)
        .count();
    if unsaved > 0 {
        // Failed saves are not retried until someone edits again.
        warn!("{} peer(s) did not reach SAVED", unsaved);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_period_override() {
        let args = Args::parse_from(["autosave-sim", "--quiet-period-ms", "250"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.quiet_period_ms, 250);
        assert_eq!(config.state_field, "autosave");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args::parse_from(["autosave-sim", "--config", "/nonexistent/autosave.json"]);
        let err = load_config(&args).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
