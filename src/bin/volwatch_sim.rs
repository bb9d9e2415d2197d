//! Claim reconciliation simulator
//!
//! Registers volumes claimed by running allocations in an in-memory store,
//! takes leadership, terminates every allocation and waits for all claims
//! to be freed, then reports RPC and write counters.

use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volwatch::common::parse_duration;
use volwatch::mock::{self, CountingWriter, MockDetacher};
use volwatch::state::{AllocClientStatus, Claim, ClaimMode, Node};
use volwatch::{ClaimDetacher, Config, Coordinator, StateStore};

#[derive(Parser)]
#[command(name = "volwatch-sim")]
#[command(about = "Drive the volume claim reaper against simulated terminations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation
    Run {
        /// Number of volumes
        #[arg(long, default_value = "20")]
        volumes: usize,

        /// Read claims per volume
        #[arg(long, default_value = "3")]
        allocs_per_volume: usize,

        /// Number of client nodes
        #[arg(long, default_value = "4")]
        nodes: usize,

        /// Probability in [0, 1] that a detach RPC fails
        #[arg(long, default_value = "0.0")]
        failure_rate: f64,

        /// Override the watcher rescan interval, which paces detach retries
        #[arg(long)]
        rescan_interval: Option<String>,

        /// Give up after this long (e.g. 30s, 2m)
        #[arg(long, default_value = "60s")]
        timeout: String,

        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Detacher that fails a fraction of calls before delegating to the mock.
struct FlakyDetacher {
    inner: Arc<MockDetacher>,
    failure_rate: f64,
    failures: AtomicUsize,
}

impl FlakyDetacher {
    fn roll(&self) -> bool {
        let failed = rand::thread_rng().gen_bool(self.failure_rate);
        if failed {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        failed
    }
}

#[async_trait::async_trait]
impl ClaimDetacher for FlakyDetacher {
    async fn detach_at_node(&self, node_id: &str, volume_id: &str, allocation_id: &str) -> volwatch::Result<()> {
        if self.roll() {
            return Err(volwatch::Error::NodeDetach {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                reason: "simulated timeout".into(),
            });
        }
        self.inner.detach_at_node(node_id, volume_id, allocation_id).await
    }

    async fn detach_at_controller(&self, external_volume_id: &str, external_node_id: &str) -> volwatch::Result<()> {
        if self.roll() {
            return Err(volwatch::Error::ControllerDetach {
                volume_id: external_volume_id.to_string(),
                reason: "simulated timeout".into(),
            });
        }
        self.inner
            .detach_at_controller(external_volume_id, external_node_id)
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            volumes,
            allocs_per_volume,
            nodes,
            failure_rate,
            rescan_interval,
            timeout,
            config,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(interval) = rescan_interval {
                config.watcher.rescan_interval = interval;
                config.watcher.validate()?;
            }
            init_tracing(&config.log_level);

            if !(0.0..=1.0).contains(&failure_rate) {
                anyhow::bail!("--failure-rate must be within [0, 1], got {}", failure_rate);
            }
            let timeout = parse_duration(&timeout)?;
            run(config, volumes, allocs_per_volume, nodes.max(1), failure_rate, timeout).await?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(
    config: Config,
    volume_count: usize,
    allocs_per_volume: usize,
    node_count: usize,
    failure_rate: f64,
    timeout: Duration,
) -> anyhow::Result<()> {
    const PLUGIN_ID: &str = "sim-plugin";

    let store = Arc::new(StateStore::new());

    let nodes: Vec<Node> = (0..node_count).map(|_| mock::node(PLUGIN_ID)).collect();
    for node in &nodes {
        store.upsert_node(node.clone());
    }

    let mut allocs = Vec::with_capacity(volume_count * allocs_per_volume);
    let mut volumes = Vec::with_capacity(volume_count);
    for v in 0..volume_count {
        let job = mock::job();
        store.upsert_job(job.clone());

        let vol = mock::volume(PLUGIN_ID);
        store.volume_register(vec![vol.clone()])?;

        let placed: Vec<_> = (0..allocs_per_volume)
            .map(|a| mock::alloc(&job, &nodes[(v + a) % nodes.len()]))
            .collect();
        store.upsert_allocs(placed.clone());
        for alloc in &placed {
            store.volume_claim(
                &vol.namespace,
                &vol.id,
                Claim::new(alloc.id.clone(), alloc.node_id.clone(), ClaimMode::Read),
            )?;
        }
        allocs.extend(placed.into_iter().map(|a| (vol.clone(), a)));
        volumes.push(vol);
    }
    tracing::info!(volumes = volume_count, claims = allocs.len(), "cluster state seeded");

    let writer = Arc::new(CountingWriter::new(store.clone()));
    let mock_detacher = Arc::new(MockDetacher::default());
    let detacher = Arc::new(FlakyDetacher {
        inner: mock_detacher.clone(),
        failure_rate,
        failures: AtomicUsize::new(0),
    });
    let coordinator = Arc::new(Coordinator::new(
        config,
        store.clone(),
        writer.clone(),
        detacher.clone(),
    )?);

    let (leadership_tx, leadership_rx) = watch::channel(false);
    let shutdown = CancellationToken::new();
    let serve = {
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            coordinator
                .serve(leadership_rx, Duration::from_secs(1), shutdown)
                .await
        })
    };
    leadership_tx.send(true)?;

    // every allocation completes; its client then releases the claim
    let started = Instant::now();
    let mut finished = Vec::with_capacity(allocs.len());
    for (_, alloc) in &allocs {
        let mut alloc = alloc.clone();
        alloc.client_status = AllocClientStatus::Complete;
        finished.push(alloc);
    }
    store.upsert_allocs(finished);
    for (vol, alloc) in &allocs {
        let release = Claim::new(alloc.id.clone(), alloc.node_id.clone(), ClaimMode::Release);
        store.volume_claim(&vol.namespace, &vol.id, release)?;
    }

    let drained = mock::eventually(timeout, || {
        let store = store.clone();
        async move { store.volumes_with_claims().is_empty() }
    })
    .await;
    let elapsed = started.elapsed();

    shutdown.cancel();
    serve.await?;

    println!("Simulation report:");
    println!("  Volumes: {}", volumes.len());
    println!("  Claims released: {}", allocs.len());
    println!("  Node detach RPCs: {}", mock_detacher.node_detaches());
    println!("  Controller detach RPCs: {}", mock_detacher.controller_detaches());
    println!("  Injected failures: {}", detacher.failures.load(Ordering::SeqCst));
    println!("  Claim writes: {}", writer.batches());
    println!("  Claims written: {}", writer.claims());
    println!("  Elapsed: {:?}", elapsed);

    if !drained {
        let stuck = store.volumes_with_claims().len();
        anyhow::bail!("{} volumes still hold claims after {:?}", stuck, timeout);
    }
    Ok(())
}
