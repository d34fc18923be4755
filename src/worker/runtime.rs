//! Worker runtime: the host loop that wires everything together.
//!
//! One control task owns the in-memory held-lease map. Discovery and
//! heartbeat ticks are handled inside that task, and processor tasks reach
//! it only through message passing (checkpoint requests over an `mpsc`
//! channel, shutdown notifications over a per-lease `watch`), so no lock
//! ever guards the map and no two in-process tasks can write the same lease
//! row concurrently. Cap refresh and the retirement sweep touch only the
//! store and run as separate background tasks, publishing the current cap
//! into the control task over a `watch` channel.
//!
//! Shutdown stops acquisitions, cooperatively halts each processor with
//! `ShutdownReason::Requested` (which never writes `SHARD_END`; the shard
//! is still live), and optionally releases held leases so peers pick them up
//! without waiting out the failover timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cap::{CapDecision, CapResolver};
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::error::{CoordinatorError, Result};
use crate::lease::{LeaseManager, LocalLeaseState};
use crate::lifecycle::ShardLifecycleTracker;
use crate::probe::{FleetProbe, TopologyProbe};
use crate::retry::with_startup_policy;
use crate::store::{LeaseRow, LeaseStore};
use crate::types::{Checkpoint, InitialPosition, ShardId};
use crate::worker::processor::{
    CheckpointCommand, Checkpointer, ProcessorFactory, RecordSource, ShardProcessor,
    ShutdownReason,
};
use crate::worker::tasks::{jittered, TaskRegistry};

/// How long a processor gets to acknowledge a cooperative stop before its
/// task is aborted.
const PROCESSOR_STOP_GRACE: Duration = Duration::from_secs(5);

/// Backoff between polls when a shard has no records or its source errored.
const IDLE_POLL_BACKOFF: Duration = Duration::from_millis(200);

struct HeldLease {
    stop_tx: watch::Sender<Option<ShutdownReason>>,
    task: JoinHandle<()>,
}

/// Mirror of the control loop's per-lease states, readable from outside
/// without touching the map the control task owns.
type LeaseStates = Arc<std::sync::Mutex<HashMap<ShardId, LocalLeaseState>>>;

/// Observer and shutdown handle for a running worker.
#[derive(Clone)]
pub struct RuntimeHandle {
    shutdown_tx: broadcast::Sender<()>,
    ready: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    states: LeaseStates,
}

impl RuntimeHandle {
    /// Begin a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// True once the initial cap has been adopted and loops are running.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// False once the worker has hit a fatal error or begun shutting down.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Snapshot of this worker's in-process lease states. Shards absent
    /// from the map are [`LocalLeaseState::Unowned`].
    pub fn lease_states(&self) -> HashMap<ShardId, LocalLeaseState> {
        self.states.lock().expect("lease state mirror poisoned").clone()
    }
}

/// The per-process coordinator host.
pub struct WorkerRuntime {
    config: Arc<WorkerConfig>,
    manager: Arc<LeaseManager>,
    resolver: Arc<CapResolver>,
    lifecycle: Arc<ShardLifecycleTracker>,
    factory: Arc<dyn ProcessorFactory>,
    source: Arc<dyn RecordSource>,
    ready: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    states: LeaseStates,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerRuntime {
    /// Build a runtime on the system clock.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn TopologyProbe>,
        fleet: Arc<dyn FleetProbe>,
        factory: Arc<dyn ProcessorFactory>,
        source: Arc<dyn RecordSource>,
    ) -> Result<Self> {
        Self::with_clock(
            config,
            store,
            topology,
            fleet,
            factory,
            source,
            Arc::new(SystemClock),
        )
    }

    /// Build a runtime on an explicit clock (tests).
    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        config: WorkerConfig,
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn TopologyProbe>,
        fleet: Arc<dyn FleetProbe>,
        factory: Arc<dyn ProcessorFactory>,
        source: Arc<dyn RecordSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate().map_err(|errors| {
            CoordinatorError::Config(format!("invalid worker config: {}", errors.join("; ")))
        })?;
        let config = Arc::new(config);

        let manager = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let resolver = Arc::new(CapResolver::new(
            Arc::clone(&store),
            Arc::clone(&topology),
            Arc::clone(&fleet),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let lifecycle = Arc::new(ShardLifecycleTracker::new(
            store,
            topology,
            clock,
            Arc::clone(&config),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            manager,
            resolver,
            lifecycle,
            factory,
            source,
            ready: Arc::new(AtomicBool::new(false)),
            healthy: Arc::new(AtomicBool::new(true)),
            states: Arc::new(std::sync::Mutex::new(HashMap::new())),
            shutdown_tx,
        })
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            ready: Arc::clone(&self.ready),
            healthy: Arc::clone(&self.healthy),
            states: Arc::clone(&self.states),
        }
    }

    fn set_state(&self, shard: &ShardId, state: LocalLeaseState) {
        let mut states = self.states.lock().expect("lease state mirror poisoned");
        match state {
            // Absence is the unowned state; terminal rows live on only in
            // the store.
            LocalLeaseState::Unowned | LocalLeaseState::Terminal => {
                states.remove(shard);
            }
            other => {
                states.insert(shard.clone(), other);
            }
        }
    }

    /// Run until shutdown is requested or a fatal error occurs.
    pub async fn run(self) -> Result<()> {
        info!(
            worker = %self.config.worker_id,
            app = %self.config.app_name,
            "starting worker runtime"
        );

        // Until a cap is adopted no lease may be taken, so ride out a slow
        // store here rather than giving up.
        let initial_cap = with_startup_policy(
            || self.resolver.resolve(),
            |e: &CoordinatorError| e.is_retriable(),
        )
        .await?;
        if let Err(e) = self.resolver.publish_worker_row(initial_cap).await {
            warn!(error = %e, "failed to publish worker snapshot row");
        }
        info!(max_leases = initial_cap.max_leases, "adopted initial cap");

        let (cap_tx, cap_rx) = watch::channel(initial_cap);
        let mut registry = TaskRegistry::new();
        self.spawn_cap_refresh(&mut registry, cap_tx);
        self.spawn_retirement_sweep(&mut registry);
        info!(
            background_tasks = registry.running_count(),
            "background loops started"
        );

        self.ready.store(true, Ordering::SeqCst);
        let result = self.control_loop(cap_rx).await;

        self.ready.store(false, Ordering::SeqCst);
        registry.shutdown(Duration::from_secs(5)).await;

        if result.is_err() {
            self.healthy.store(false, Ordering::SeqCst);
        }
        info!(worker = %self.config.worker_id, "worker runtime stopped");
        result
    }

    fn spawn_cap_refresh(&self, registry: &mut TaskRegistry, cap_tx: watch::Sender<CapDecision>) {
        let resolver = Arc::clone(&self.resolver);
        registry.spawn_periodic(
            "cap_refresh",
            self.config.cap_refresh_interval,
            0.1,
            move || {
                let resolver = Arc::clone(&resolver);
                let cap_tx = cap_tx.clone();
                async move {
                    match resolver.resolve().await {
                        Ok(decision) => {
                            if *cap_tx.borrow() != decision {
                                info!(max_leases = decision.max_leases, "cap changed");
                            }
                            let _ = cap_tx.send(decision);
                            if let Err(e) = resolver.publish_worker_row(decision).await {
                                debug!(error = %e, "worker snapshot refresh failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "cap refresh failed, keeping current cap"),
                    }
                }
            },
        );
    }

    fn spawn_retirement_sweep(&self, registry: &mut TaskRegistry) {
        let lifecycle = Arc::clone(&self.lifecycle);
        registry.spawn_periodic(
            "retirement_sweep",
            self.config.retirement_sweep_interval,
            0.1,
            move || {
                let lifecycle = Arc::clone(&lifecycle);
                async move {
                    match lifecycle.retire_sweep().await {
                        Ok(0) => {}
                        Ok(retired) => info!(retired, "retired drained lease rows"),
                        Err(e) => warn!(error = %e, "retirement sweep failed"),
                    }
                }
            },
        );
    }

    /// The single task that owns the held-lease map.
    async fn control_loop(&self, cap_rx: watch::Receiver<CapDecision>) -> Result<()> {
        let (cp_tx, mut cp_rx) = mpsc::channel::<CheckpointCommand>(256);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut held: HashMap<ShardId, HeldLease> = HashMap::new();

        let mut next_discovery = tokio::time::Instant::now();
        let mut next_heartbeat = tokio::time::Instant::now() + self.config.heartbeat_interval;

        let exit = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_discovery) => {
                    next_discovery = tokio::time::Instant::now()
                        + jittered(self.config.discovery_interval, 0.2);
                    if let Err(e) = self.discovery_tick(&cap_rx, &mut held, &cp_tx).await {
                        if e.is_fatal() {
                            error!(error = %e, "fatal error in discovery tick");
                            break Err(e);
                        }
                        warn!(error = %e, "discovery tick dropped");
                    }
                }
                _ = tokio::time::sleep_until(next_heartbeat) => {
                    next_heartbeat = tokio::time::Instant::now() + self.config.heartbeat_interval;
                    self.heartbeat_tick(&mut held).await;
                }
                Some(command) = cp_rx.recv() => {
                    self.handle_checkpoint(command, &mut held).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        // Stop accepting work and halt every processor cooperatively. The
        // checkpoint channel keeps being serviced while processors wind
        // down so a final in-flight checkpoint still lands. Never write
        // SHARD_END here: these shards are live.
        let to_release: Vec<ShardId> = held.keys().cloned().collect();
        for (shard, lease) in held.iter() {
            self.set_state(shard, LocalLeaseState::Releasing);
            let _ = lease.stop_tx.send(Some(ShutdownReason::Requested));
        }

        let drain_deadline = tokio::time::Instant::now() + PROCESSOR_STOP_GRACE;
        while !held.is_empty() && tokio::time::Instant::now() < drain_deadline {
            tokio::select! {
                Some(command) = cp_rx.recv() => {
                    self.handle_checkpoint(command, &mut held).await;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    held.retain(|_, lease| !lease.task.is_finished());
                }
            }
        }
        for (shard, lease) in held.drain() {
            warn!(%shard, "processor ignored stop signal, aborting");
            lease.task.abort();
        }

        if self.config.release_on_shutdown {
            for shard in &to_release {
                if let Err(e) = self.manager.release(shard).await {
                    warn!(%shard, error = %e, "failed to release lease on shutdown");
                }
            }
        }
        for shard in &to_release {
            self.set_state(shard, LocalLeaseState::Unowned);
        }

        exit
    }

    async fn discovery_tick(
        &self,
        cap_rx: &watch::Receiver<CapDecision>,
        held: &mut HashMap<ShardId, HeldLease>,
        cp_tx: &mpsc::Sender<CheckpointCommand>,
    ) -> Result<()> {
        // Reap pumps that exited on their own (processor error); their
        // leases go back to the pool rather than being heartbeated forever.
        let finished: Vec<ShardId> = held
            .iter()
            .filter(|(_, lease)| lease.task.is_finished())
            .map(|(shard, _)| shard.clone())
            .collect();
        for shard in finished {
            if let Some(lease) = held.remove(&shard) {
                let _ = lease.task.await;
                warn!(%shard, "processor exited, releasing lease");
                if let Err(e) = self.manager.release(&shard).await {
                    warn!(%shard, error = %e, "release after processor exit failed");
                }
                self.set_state(&shard, LocalLeaseState::Unowned);
            }
        }

        if let Err(e) = self.lifecycle.sync().await {
            if e.is_fatal() {
                return Err(e);
            }
            // Discovery proceeds on the last known lease set.
            warn!(error = %e, "shard sync skipped");
        }

        let cap = *cap_rx.borrow();
        let held_ids: HashSet<ShardId> = held.keys().cloned().collect();
        let outcome = self.manager.rebalance_tick(&cap, &held_ids).await?;

        for shard in &outcome.lost {
            warn!(%shard, "lease lost, stopping processor");
            self.stop_and_clear(held, shard, ShutdownReason::Stolen).await;
        }
        for shard in &outcome.released {
            self.stop_and_clear(held, shard, ShutdownReason::Requested).await;
        }
        for row in outcome.acquired {
            self.start_processor(row, held, cp_tx);
        }
        Ok(())
    }

    async fn heartbeat_tick(&self, held: &mut HashMap<ShardId, HeldLease>) {
        let shards: Vec<ShardId> = held.keys().cloned().collect();
        for shard in shards {
            match self.manager.renew(&shard).await {
                Ok(_) => {}
                Err(e) if e.is_lease_lost() => {
                    warn!(%shard, "heartbeat lost the lease");
                    self.stop_and_clear(held, &shard, ShutdownReason::Stolen).await;
                }
                Err(e) => {
                    // Transient; if it persists the lease expires and fails
                    // over on its own.
                    warn!(%shard, error = %e, "heartbeat failed, will retry");
                }
            }
        }
    }

    async fn handle_checkpoint(
        &self,
        command: CheckpointCommand,
        held: &mut HashMap<ShardId, HeldLease>,
    ) {
        match command {
            CheckpointCommand::Write {
                shard,
                cursor,
                reply,
            } => {
                let result = if held.contains_key(&shard) {
                    self.manager.checkpoint(&shard, &cursor).await.map(|_| ())
                } else {
                    Err(CoordinatorError::LeaseLost(shard.clone()))
                };
                let lost = result.as_ref().is_err_and(|e| e.is_lease_lost());
                // Reply before stopping: the pump is blocked on this answer.
                let _ = reply.send(result);
                if lost {
                    self.stop_and_clear(held, &shard, ShutdownReason::Stolen).await;
                }
            }
            CheckpointCommand::WriteShardEnd { shard, reply } => {
                let result = if held.contains_key(&shard) {
                    self.manager.mark_shard_end(&shard).await.map(|_| ())
                } else {
                    Err(CoordinatorError::LeaseLost(shard.clone()))
                };
                if result.is_ok() {
                    // The pump initiated this and is already finishing; just
                    // forget the lease, the row is terminal.
                    held.remove(&shard);
                    self.set_state(&shard, LocalLeaseState::Terminal);
                }
                let _ = reply.send(result);
            }
        }
    }

    fn start_processor(
        &self,
        row: LeaseRow,
        held: &mut HashMap<ShardId, HeldLease>,
        cp_tx: &mpsc::Sender<CheckpointCommand>,
    ) {
        let shard = row.shard_id.clone();
        let (stop_tx, stop_rx) = watch::channel(None);
        let checkpointer = Checkpointer::new(shard.clone(), cp_tx.clone());
        let processor = self.factory.create_processor();
        let source = Arc::clone(&self.source);
        let position = self.config.initial_position;

        debug!(%shard, checkpoint = %row.checkpoint, "starting processor");
        let task = tokio::spawn(pump(
            shard.clone(),
            processor,
            source,
            checkpointer,
            stop_rx,
            row.checkpoint,
            position,
        ));
        self.set_state(&shard, LocalLeaseState::Held);
        held.insert(shard, HeldLease { stop_tx, task });
    }

    async fn stop_and_clear(
        &self,
        held: &mut HashMap<ShardId, HeldLease>,
        shard: &ShardId,
        reason: ShutdownReason,
    ) {
        self.set_state(shard, LocalLeaseState::Releasing);
        stop_processor(held, shard, reason).await;
        self.set_state(shard, LocalLeaseState::Unowned);
    }
}

async fn stop_processor(
    held: &mut HashMap<ShardId, HeldLease>,
    shard: &ShardId,
    reason: ShutdownReason,
) {
    if let Some(lease) = held.remove(shard) {
        let _ = lease.stop_tx.send(Some(reason));
        await_task(shard.clone(), lease.task).await;
    }
}

async fn await_task(shard: ShardId, task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(PROCESSOR_STOP_GRACE, task).await.is_err() {
        warn!(%shard, "processor ignored stop signal, aborting");
        abort.abort();
    }
}

/// Per-lease record pump: drives the processor until the shard drains, the
/// lease is lost, or a stop is requested.
async fn pump(
    shard: ShardId,
    mut processor: Box<dyn ShardProcessor>,
    source: Arc<dyn RecordSource>,
    checkpointer: Checkpointer,
    mut stop_rx: watch::Receiver<Option<ShutdownReason>>,
    initial: Checkpoint,
    position: InitialPosition,
) {
    processor.on_initialize(&shard, &initial).await;
    let mut cursor = initial;

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                let reason = match changed {
                    Ok(()) => (*stop_rx.borrow()).unwrap_or(ShutdownReason::Requested),
                    // Control loop gone; treat as a requested stop.
                    Err(_) => ShutdownReason::Requested,
                };
                processor.on_shutdown(reason, &checkpointer).await;
                return;
            }
            batch = source.read_batch(&shard, &cursor, position) => {
                match batch {
                    Ok(batch) => {
                        let had_records = !batch.records.is_empty();
                        let next_cursor = batch.next_cursor.clone();
                        let end_of_shard = batch.end_of_shard;

                        if had_records {
                            if let Err(e) = processor.on_records(batch, &checkpointer).await {
                                let reason = if e.is_lease_lost() {
                                    ShutdownReason::Stolen
                                } else {
                                    warn!(%shard, error = %e, "processor failed");
                                    ShutdownReason::Requested
                                };
                                processor.on_shutdown(reason, &checkpointer).await;
                                return;
                            }
                        }
                        if let Some(next) = next_cursor {
                            cursor = Checkpoint::At(next);
                        }
                        if end_of_shard {
                            // Drain complete; the processor must write
                            // SHARD_END from this callback.
                            processor.on_shutdown(ShutdownReason::ShardEnd, &checkpointer).await;
                            return;
                        }
                        if !had_records && !idle_wait(&mut stop_rx, &mut processor, &checkpointer).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(%shard, error = %e, "record source failed, backing off");
                        if !idle_wait(&mut stop_rx, &mut processor, &checkpointer).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Sleep through an idle poll, still honoring stop requests. Returns false
/// when the pump should exit.
async fn idle_wait(
    stop_rx: &mut watch::Receiver<Option<ShutdownReason>>,
    processor: &mut Box<dyn ShardProcessor>,
    checkpointer: &Checkpointer,
) -> bool {
    tokio::select! {
        changed = stop_rx.changed() => {
            let reason = match changed {
                Ok(()) => (*stop_rx.borrow()).unwrap_or(ShutdownReason::Requested),
                Err(_) => ShutdownReason::Requested,
            };
            processor.on_shutdown(reason, checkpointer).await;
            false
        }
        _ = tokio::time::sleep(IDLE_POLL_BACKOFF) => true,
    }
}
