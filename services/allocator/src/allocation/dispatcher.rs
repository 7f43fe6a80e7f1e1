//! Asynchronous matching.
//!
//! `schedule` hands an allocation to one of N workers over a bounded
//! mailbox and returns immediately. Each worker processes its mailbox one
//! allocation at a time: filter, reserve, then record the outcome. An
//! allocation id is in at most one mailbox or worker at a time.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metalloc_id::AllocationId;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{AllocationError, AllocationMachine, CandidateFilter, ReservationCoordinator};
use crate::model::Allocation;

// =============================================================================
// Routing
// =============================================================================

/// Picks the worker an allocation is sent to.
pub trait Route: Send + Sync + 'static {
    /// Returns an index below `workers`.
    fn select(&self, allocation: &Allocation, workers: usize) -> usize;
}

/// Routes by a hash of the allocation UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashRoute;

impl Route for HashRoute {
    fn select(&self, allocation: &Allocation, workers: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        allocation.uuid.hash(&mut hasher);
        (hasher.finish() % workers.max(1) as u64) as usize
    }
}

/// Cycles through the workers.
#[derive(Debug, Default)]
pub struct RoundRobinRoute {
    next: AtomicUsize,
}

impl Route for RoundRobinRoute {
    fn select(&self, _allocation: &Allocation, workers: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % workers.max(1)
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// The match-and-reserve sequence for a single allocation.
pub struct Matcher {
    filter: CandidateFilter,
    coordinator: ReservationCoordinator,
    machine: Arc<AllocationMachine>,
}

impl Matcher {
    pub fn new(
        filter: CandidateFilter,
        coordinator: ReservationCoordinator,
        machine: Arc<AllocationMachine>,
    ) -> Self {
        Self {
            filter,
            coordinator,
            machine,
        }
    }

    pub fn machine(&self) -> &AllocationMachine {
        &self.machine
    }

    /// Filters, reserves and records success.
    ///
    /// An error means the allocation should be failed with the error's
    /// message.
    #[instrument(skip_all, fields(allocation = %allocation.uuid))]
    pub async fn run(&self, allocation: &Allocation) -> Result<(), AllocationError> {
        let candidates = self.filter.filter(allocation).await?;
        let node = self.coordinator.reserve(&candidates, allocation.uuid).await?;
        self.machine.on_match_success(allocation, &node).await?;
        Ok(())
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Dispatcher sizing and policy.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub mailbox: usize,
    pub match_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            mailbox: 256,
            match_timeout: Duration::from_secs(60),
        }
    }
}

/// `last_error` of allocations still queued when the dispatcher stops.
pub const SHUTDOWN_REASON: &str = "matching abandoned: service shutting down";

/// Why an allocation could not be scheduled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("allocation {0} is already being matched")]
    AlreadyScheduled(Uuid),

    #[error("dispatcher mailbox full")]
    MailboxFull,

    #[error("dispatcher stopped")]
    Stopped,
}

#[derive(Debug)]
struct MatchJob {
    allocation: Allocation,
}

type InFlight = Arc<Mutex<HashSet<AllocationId>>>;

fn in_flight_remove(in_flight: &InFlight, id: AllocationId) {
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

/// Worker pool running matches off the request path.
pub struct Dispatcher {
    mailboxes: Vec<mpsc::Sender<MatchJob>>,
    route: Arc<dyn Route>,
    in_flight: InFlight,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns the workers. Must be called within a tokio runtime.
    pub fn start(config: DispatcherConfig, matcher: Arc<Matcher>, route: Arc<dyn Route>) -> Self {
        let workers = config.workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight: InFlight = Arc::default();

        let mut mailboxes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(config.mailbox.max(1));
            let worker = Worker {
                index,
                rx,
                runner: JobRunner {
                    matcher: matcher.clone(),
                    in_flight: in_flight.clone(),
                    match_timeout: config.match_timeout,
                },
            };
            handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
            mailboxes.push(tx);
        }

        info!(
            workers,
            mailbox = config.mailbox,
            match_timeout_secs = config.match_timeout.as_secs_f64(),
            "Dispatcher started"
        );

        Self {
            mailboxes,
            route,
            in_flight,
            shutdown_tx,
            handles: Mutex::new(handles),
        }
    }

    /// Queues matching for an allocation without waiting for it.
    pub fn schedule(&self, allocation: Allocation) -> Result<(), DispatchError> {
        if *self.shutdown_tx.borrow() {
            return Err(DispatchError::Stopped);
        }

        let id = allocation.id;
        let uuid = allocation.uuid;
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
        {
            return Err(DispatchError::AlreadyScheduled(uuid));
        }

        let index = self
            .route
            .select(&allocation, self.mailboxes.len())
            .min(self.mailboxes.len() - 1);
        let sent = self.mailboxes[index].try_send(MatchJob { allocation });

        match sent {
            Ok(()) => {
                debug!(allocation = %uuid, worker = index, "Scheduled matching");
                Ok(())
            }
            Err(e) => {
                in_flight_remove(&self.in_flight, id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => DispatchError::MailboxFull,
                    mpsc::error::TrySendError::Closed(_) => DispatchError::Stopped,
                })
            }
        }
    }

    /// Number of allocations queued or being matched.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the workers and waits for them to exit.
    ///
    /// Matches already running finish; queued allocations are failed with
    /// [`SHUTDOWN_REASON`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher worker did not exit cleanly");
            }
        }
        info!("Dispatcher stopped");
    }
}

struct Worker {
    index: usize,
    rx: mpsc::Receiver<MatchJob>,
    runner: JobRunner,
}

impl Worker {
    #[instrument(skip_all, fields(worker = self.index))]
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("Dispatcher worker started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                job = self.rx.recv() => match job {
                    Some(job) => self.runner.process(job).await,
                    None => return,
                },
            }
        }

        self.rx.close();
        let mut abandoned = 0usize;
        while let Some(job) = self.rx.recv().await {
            self.runner.abandon(job).await;
            abandoned += 1;
        }
        debug!(abandoned, "Dispatcher worker shutting down");
    }
}

struct JobRunner {
    matcher: Arc<Matcher>,
    in_flight: InFlight,
    match_timeout: Duration,
}

impl JobRunner {
    async fn process(&self, job: MatchJob) {
        let allocation = job.allocation;
        let matcher = self.matcher.clone();
        let task = tokio::spawn({
            let allocation = allocation.clone();
            async move { matcher.run(&allocation).await }
        });

        // On timeout the spawned task keeps running; if it reserves a node
        // later it finds the record failed and releases the node.
        let failure = match tokio::time::timeout(self.match_timeout, task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(join_err)) => Some(format!("matching failed unexpectedly: {join_err}")),
            Err(_) => Some(format!(
                "matching timed out after {:.1}s",
                self.match_timeout.as_secs_f64()
            )),
        };

        if let Some(reason) = failure {
            if let Err(e) = self
                .matcher
                .machine()
                .on_match_failure(&allocation, &reason)
                .await
            {
                error!(
                    allocation = %allocation.uuid,
                    error = %e,
                    "Failed to record matching failure"
                );
            }
        }

        in_flight_remove(&self.in_flight, allocation.id);
    }

    /// Fails a queued job that will never be matched.
    async fn abandon(&self, job: MatchJob) {
        let allocation = job.allocation;
        if let Err(e) = self
            .matcher
            .machine()
            .on_match_failure(&allocation, SHUTDOWN_REASON)
            .await
        {
            error!(
                allocation = %allocation.uuid,
                error = %e,
                "Failed to record abandoned matching"
            );
        }
        in_flight_remove(&self.in_flight, allocation.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use metalloc_events::AllocationState;

    fn allocation() -> Allocation {
        Allocation {
            id: AllocationId::new(1),
            uuid: Uuid::new_v4(),
            name: None,
            state: AllocationState::Allocating,
            node_id: None,
            resource_class: "baremetal".into(),
            traits: vec![],
            candidate_nodes: vec![],
            extra: Default::default(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_hash_route_is_stable_and_in_range() {
        let route = HashRoute;
        let a = allocation();
        let first = route.select(&a, 7);
        assert!(first < 7);
        assert_eq!(route.select(&a, 7), first);
        assert_eq!(route.select(&a, 1), 0);
    }

    #[test]
    fn test_round_robin_cycles() {
        let route = RoundRobinRoute::default();
        let a = allocation();
        let picks: Vec<_> = (0..6).map(|_| route.select(&a, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.match_timeout, Duration::from_secs(60));
    }
}
