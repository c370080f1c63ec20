use chrono::Utc;
use consensus::{CommittedDecision, ConsensusManager, NodeId};
use controller::{ReconfigurationCoordinator, ReconfigurationScheduler};
use network::{FailureDetector, LoadReport, MessageHandler, NetworkManager, NetworkMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::MemoryRecordStore;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{GnsError, Result};

/// One name server of the deployment: its record store, its reconfiguration
/// coordinator and scheduler, and its failure detector.
pub struct Node {
    node_id: NodeId,
    config: Config,
    store: Arc<MemoryRecordStore>,
    coordinator: Arc<ReconfigurationCoordinator>,
    scheduler: Arc<ReconfigurationScheduler>,
    detector: Arc<FailureDetector>,
    messaging: Arc<MessageHandler>,
    decisions: Arc<RwLock<Option<mpsc::UnboundedReceiver<CommittedDecision>>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Node {
    pub async fn new(
        config: &Config,
        node_id: NodeId,
        consensus: &Arc<ConsensusManager>,
        network: &Arc<NetworkManager>,
    ) -> Result<Self> {
        info!("Initializing node {}", node_id);

        let storage_config = config.storage_config(node_id);
        let store = Arc::new(match &storage_config.storage_path {
            Some(dir) => MemoryRecordStore::open(dir).await?,
            None => MemoryRecordStore::new(),
        });

        let (consensus_handle, decisions) =
            consensus.register(config.consensus_config(node_id)).await;

        let network_config = config.network_config(node_id);
        let messaging = Arc::new(network.register(network_config.clone()).await);
        let detector = Arc::new(FailureDetector::new(network_config));

        let coordinator = Arc::new(ReconfigurationCoordinator::new(
            config.controller_config(node_id),
            store.clone(),
            Arc::new(consensus_handle),
            messaging.clone(),
            detector.clone(),
        )?);
        let scheduler = Arc::new(ReconfigurationScheduler::new(coordinator.clone()));

        Ok(Self {
            node_id,
            config: config.clone(),
            store,
            coordinator,
            scheduler,
            detector,
            messaging,
            decisions: Arc::new(RwLock::new(Some(decisions))),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn coordinator(&self) -> &Arc<ReconfigurationCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<ReconfigurationScheduler> {
        &self.scheduler
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn store(&self) -> &Arc<MemoryRecordStore> {
        &self.store
    }

    /// Spawns the node's services and resumes any reconfiguration left
    /// unfinished in the loaded records. Returns once everything is running.
    pub async fn start(&self) -> Result<()> {
        info!("Starting services of node {}", self.node_id);

        let decisions = self
            .decisions
            .write()
            .await
            .take()
            .ok_or_else(|| GnsError::Node(format!("Node {} already started", self.node_id)))?;
        let mut inbox = self.messaging.take_inbox().await?;

        let decision_task = tokio::spawn(self.coordinator.clone().run(decisions));

        let dispatch_task = {
            let coordinator = self.coordinator.clone();
            let detector = self.detector.clone();
            let messaging = self.messaging.clone();
            tokio::spawn(async move {
                while let Some(envelope) = inbox.recv().await {
                    detector.observe(envelope.from, None);
                    match envelope.message {
                        NetworkMessage::Ping(ping) => {
                            detector.handle_ping(messaging.as_ref(), ping).await
                        }
                        NetworkMessage::Pong(pong) => detector.handle_pong(pong),
                        _ => coordinator.handle_message(envelope).await,
                    }
                }
            })
        };

        let failure_task = tokio::spawn(self.coordinator.clone().watch_failures());

        let detector_task = tokio::spawn(self.detector.clone().run(self.messaging.clone()));

        let scheduler_task = {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        let load_task = {
            let coordinator = self.coordinator.clone();
            let messaging = self.messaging.clone();
            let period = Duration::from_millis(self.config.load_report_interval_ms);
            tokio::spawn(async move { Self::report_load(coordinator, messaging, period).await })
        };

        let snapshot_task = {
            let store = self.store.clone();
            let persistent = self.config.storage_path.is_some();
            let period = Duration::from_millis(self.config.snapshot_interval_ms);
            tokio::spawn(async move {
                if persistent {
                    Self::snapshot_records(store, period).await
                } else {
                    futures::future::pending::<()>().await
                }
            })
        };

        let mut tasks = vec![
            decision_task.abort_handle(),
            dispatch_task.abort_handle(),
            failure_task.abort_handle(),
            detector_task.abort_handle(),
            scheduler_task.abort_handle(),
            load_task.abort_handle(),
            snapshot_task.abort_handle(),
        ];

        let node_id = self.node_id;
        let supervisor = tokio::spawn(async move {
            tokio::select! {
                result = decision_task => error!("Decision loop of node {} stopped: {:?}", node_id, result),
                result = dispatch_task => error!("Message dispatch of node {} stopped: {:?}", node_id, result),
                result = failure_task => error!("Failure watcher of node {} stopped: {:?}", node_id, result),
                result = detector_task => error!("Failure detector of node {} stopped: {:?}", node_id, result),
                result = scheduler_task => error!("Scheduler of node {} stopped: {:?}", node_id, result),
                result = load_task => error!("Load reporter of node {} stopped: {:?}", node_id, result),
                result = snapshot_task => error!("Snapshot loop of node {} stopped: {:?}", node_id, result),
            }
        });
        tasks.push(supervisor.abort_handle());
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        match self.coordinator.resume_in_flight().await {
            Ok(0) => {}
            Ok(resumed) => info!("Node {} resumed {} unfinished records", self.node_id, resumed),
            Err(e) => error!("Node {} could not scan records to resume: {}", self.node_id, e),
        }

        Ok(())
    }

    /// Stops every service and in-flight driver, then writes a final snapshot.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping node {}", self.node_id);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.coordinator.shutdown();

        self.store.save_snapshot().await?;
        Ok(())
    }

    async fn report_load(
        coordinator: Arc<ReconfigurationCoordinator>,
        messaging: Arc<MessageHandler>,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let report = LoadReport {
                from: coordinator.node_id(),
                requests_per_sec: coordinator.actives().serving_count().await as f64,
                timestamp: Utc::now(),
            };
            coordinator.record_load(&report);
            if let Err(e) = messaging
                .broadcast_message(NetworkMessage::NameServerLoad(report))
                .await
            {
                warn!("Failed to broadcast load of node {}: {}", coordinator.node_id(), e);
            }
        }
    }

    async fn snapshot_records(store: Arc<MemoryRecordStore>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match store.save_snapshot().await {
                Ok(()) => debug!("Record snapshot written"),
                Err(e) => error!("Failed to write record snapshot: {}", e),
            }
        }
    }
}
