// Drives an in-process cluster through the lifecycle of a handful of names:
// creation, demand-driven reconfiguration, a primary crash and removal.
use anyhow::{anyhow, bail, Context, Result};
use futures::future::join_all;
use gnsd::consensus::NodeId;
use gnsd::controller::RemoveOutcome;
use gnsd::network::{DemandReport, Liveness};
use gnsd::{Config, LocalCluster};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const NODES: u32 = 10;
const NAMES: [&str; 4] = ["alpha.example", "beta.example", "gamma.example", "delta.example"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let seed = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u64>())
        .transpose()
        .context("seed must be an integer")?
        .unwrap_or(7);

    println!("Starting {}-node cluster simulation (seed {})", NODES, seed);
    let cluster = LocalCluster::new(sim_config()).await?;
    cluster.start().await?;

    let mut report = Report::new();
    report.phase("create", create_names(&cluster)).await;
    report
        .phase("reconfigure", reconfigure(&cluster, StdRng::seed_from_u64(seed)))
        .await;
    report.phase("primary crash", crash_primary(&cluster)).await;
    report.phase("remove", remove_names(&cluster)).await;

    cluster.shutdown().await?;
    report.print();

    if report.failed() > 0 {
        bail!("{} phase(s) failed", report.failed());
    }
    Ok(())
}

fn sim_config() -> Config {
    let mut config = Config::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, NODES);
    config.heartbeat_interval_ms = 100;
    config.load_report_interval_ms = 500;
    config.controller.rc_timeout_ms = 100;
    // Rounds are triggered by hand.
    config.controller.analysis_interval_ms = 3_600_000;
    config.controller.analysis_initial_delay_ms = 3_600_000;
    config.controller.group_change_pause_ms = 0;
    config
}

async fn create_names(cluster: &LocalCluster) -> Result<String> {
    let entry = cluster.coordinator(NodeId(1))?.clone();
    let adds = NAMES.iter().map(|name| {
        let entry = entry.clone();
        async move {
            let primaries = entry.primaries_for(name);
            let leader = entry
                .leader_for(&primaries)
                .ok_or_else(|| anyhow!("no reachable primary for {}", name))?;
            let outcome = cluster.coordinator(leader)?.add_record(name).await?;
            Ok::<_, anyhow::Error>(outcome)
        }
    });

    let mut started = 0;
    for outcome in join_all(adds).await {
        let outcome = outcome?;
        wait_running(cluster, &outcome.name, &outcome.primaries).await?;
        started += outcome.actives.len();
    }
    Ok(format!("{} names running on {} actives", NAMES.len(), started))
}

async fn reconfigure(cluster: &LocalCluster, mut rng: StdRng) -> Result<String> {
    let entry = cluster.coordinator(NodeId(1))?.clone();
    for name in NAMES {
        let lookups = rng.gen_range(0..2_000);
        let updates = rng.gen_range(0..200);
        let reporter = NodeId(rng.gen_range(1..=NODES));
        for primary in entry.primaries_for(name) {
            cluster
                .coordinator(primary)?
                .record_demand(&DemandReport {
                    name: name.to_string(),
                    reporter,
                    lookups,
                    updates,
                })
                .await?;
        }
    }

    let mut proposed = 0;
    for node_id in cluster.node_ids() {
        if let Some(node) = cluster.node(node_id) {
            proposed += node.scheduler().run_round().await?.proposed;
        }
    }

    let mut sizes = Vec::new();
    for name in NAMES {
        let primaries = entry.primaries_for(name);
        wait_running(cluster, name, &primaries).await?;
        let leader = first(&primaries)?;
        let record = cluster
            .record_on(leader, name)
            .await?
            .ok_or_else(|| anyhow!("{} vanished", name))?;
        sizes.push(format!("{}={}", name, record.active_set().len()));
    }
    Ok(format!("{} proposals, set sizes {}", proposed, sizes.join(" ")))
}

async fn crash_primary(cluster: &LocalCluster) -> Result<String> {
    let entry = cluster.coordinator(NodeId(1))?.clone();
    let primaries = entry.primaries_for(NAMES[0]);
    let victim = first(&primaries)?;
    cluster.crash(victim).await?;

    // Survivors must notice before they can lead.
    let survivors: BTreeSet<NodeId> = primaries.iter().copied().filter(|id| *id != victim).collect();
    let watcher = first(&survivors)?;
    poll(Duration::from_secs(10), || async {
        Ok(cluster
            .node(watcher)
            .map(|node| !node.detector().is_reachable(victim))
            .unwrap_or(false))
    })
    .await
    .context("crash was never detected")?;

    let summary = cluster
        .node(watcher)
        .ok_or_else(|| anyhow!("unknown node {}", watcher))?
        .scheduler()
        .run_round()
        .await?;
    wait_running(cluster, NAMES[0], &survivors).await?;
    Ok(format!(
        "node {} crashed, node {} led {} proposals",
        victim, watcher, summary.proposed
    ))
}

async fn remove_names(cluster: &LocalCluster) -> Result<String> {
    let coordinators = cluster.coordinators();
    let entry = coordinators
        .values()
        .next()
        .ok_or_else(|| anyhow!("no live coordinator"))?
        .clone();

    let mut removed = 0;
    for name in NAMES {
        let primaries = entry.primaries_for(name);
        let leader = entry
            .leader_for(&primaries)
            .ok_or_else(|| anyhow!("no reachable primary for {}", name))?;
        let receiver = cluster.coordinator(leader)?.request_removal(name).await?;
        match tokio::time::timeout(Duration::from_secs(10), receiver).await {
            Ok(Ok(RemoveOutcome::Removed)) => removed += 1,
            Ok(Ok(outcome)) => bail!("removal of {} ended with {:?}", name, outcome),
            Ok(Err(_)) => bail!("removal of {} was abandoned", name),
            Err(_) => bail!("removal of {} timed out", name),
        }
    }
    Ok(format!("{} names removed", removed))
}

fn first(set: &BTreeSet<NodeId>) -> Result<NodeId> {
    set.iter().next().copied().ok_or_else(|| anyhow!("empty node set"))
}

async fn wait_running(cluster: &LocalCluster, name: &str, on: &BTreeSet<NodeId>) -> Result<()> {
    poll(Duration::from_secs(10), || async {
        for node_id in on {
            if cluster.is_crashed(*node_id) {
                continue;
            }
            match cluster.record_on(*node_id, name).await? {
                Some(record) if record.is_active_running() && !record.is_old_active_running() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    })
    .await
    .with_context(|| format!("{} never settled", name))
}

async fn poll<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = gnsd::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

struct PhaseResult {
    name: &'static str,
    duration: Duration,
    outcome: Result<String>,
}

struct Report {
    phases: Vec<PhaseResult>,
    start_time: Instant,
}

impl Report {
    fn new() -> Self {
        Self {
            phases: Vec::new(),
            start_time: Instant::now(),
        }
    }

    async fn phase(&mut self, name: &'static str, run: impl Future<Output = Result<String>>) {
        tracing::info!("Phase {} starting", name);
        let started = Instant::now();
        let outcome = run.await;
        if let Err(e) = &outcome {
            tracing::warn!("Phase {} failed: {:#}", name, e);
        }
        self.phases.push(PhaseResult {
            name,
            duration: started.elapsed(),
            outcome,
        });
    }

    fn failed(&self) -> usize {
        self.phases.iter().filter(|phase| phase.outcome.is_err()).count()
    }

    fn print(&self) {
        println!("\nCluster simulation report");
        println!("{}", "=".repeat(60));
        for phase in &self.phases {
            match &phase.outcome {
                Ok(detail) => println!("PASS {:<16} {:>8.2?}  {}", phase.name, phase.duration, detail),
                Err(e) => println!("FAIL {:<16} {:>8.2?}  {:#}", phase.name, phase.duration, e),
            }
        }
        println!("{}", "=".repeat(60));
        println!(
            "{} phases, {} failed, total {:.2?}",
            self.phases.len(),
            self.failed(),
            self.start_time.elapsed()
        );
    }
}
