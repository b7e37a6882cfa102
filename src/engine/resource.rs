// ABOUTME: Resource admission control for running nodes
// ABOUTME: Grants tag permits atomically in FIFO order and enforces a run-wide action cap

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Admission controller closed")]
    Closed,

    #[error("Resource pool '{tag}' must have a capacity of at least 1")]
    InvalidPoolSize { tag: String },
}

/// What a node asks for before it may start.
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    pub tags: BTreeSet<String>,
    /// Only action nodes count against the run-wide cap.
    pub takes_run_slot: bool,
    /// Set for requests made while an enclosing node already holds permits.
    /// They are granted as soon as capacity allows instead of queueing
    /// behind waiters that may themselves be waiting on the enclosing node.
    pub bypass_queue: bool,
}

#[derive(Debug, Clone)]
struct Pool {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug, Default)]
struct AdmissionState {
    pools: HashMap<String, Pool>,
    waiters: BTreeMap<u64, BTreeSet<String>>,
    next_ticket: u64,
}

impl AdmissionState {
    fn pool(&mut self, tag: &str, default_size: usize, configured: &HashMap<String, usize>) -> &mut Pool {
        self.pools.entry(tag.to_string()).or_insert_with(|| Pool {
            capacity: configured.get(tag).copied().unwrap_or(default_size),
            in_use: 0,
        })
    }

    fn enqueue(&mut self, tags: &BTreeSet<String>) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.insert(ticket, tags.clone());
        ticket
    }

    /// Whether an earlier queued waiter wants any of these tags.
    fn has_earlier_waiter(&self, ticket: u64, tags: &BTreeSet<String>) -> bool {
        self.waiters
            .range(..ticket)
            .any(|(_, wanted)| !wanted.is_disjoint(tags))
    }
}

/// Maps resource tags to counting permit pools plus a run-wide cap on
/// concurrently running actions.
///
/// A request's tags are granted together or not at all. Queued requests are
/// served in arrival order per tag, so every waiter is eventually admitted.
#[derive(Debug)]
pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    notify: Notify,
    run_slots: Arc<Semaphore>,
    max_concurrent: usize,
    default_pool_size: usize,
    configured: HashMap<String, usize>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(AdmissionState::default()),
            notify: Notify::new(),
            run_slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_pool_size: 1,
            configured: HashMap::new(),
        }
    }

    pub fn with_default_pool_size(mut self, size: usize) -> Result<Self, AdmissionError> {
        if size == 0 {
            return Err(AdmissionError::InvalidPoolSize {
                tag: "<default>".to_string(),
            });
        }
        self.default_pool_size = size;
        Ok(self)
    }

    pub fn with_pool(mut self, tag: impl Into<String>, size: usize) -> Result<Self, AdmissionError> {
        let tag = tag.into();
        if size == 0 {
            return Err(AdmissionError::InvalidPoolSize { tag });
        }
        self.configured.insert(tag, size);
        Ok(self)
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until every requested permit can be granted at once.
    ///
    /// Dropping the returned future abandons the wait without holding
    /// anything. Dropping the permit releases everything it holds.
    pub async fn acquire(
        self: &Arc<Self>,
        request: &AdmissionRequest,
    ) -> Result<ScopedPermit, AdmissionError> {
        let tags = if request.tags.is_empty() {
            None
        } else {
            Some(self.acquire_tags(&request.tags, request.bypass_queue).await)
        };

        // Tags first: an action holding a slot never waits on a tag.
        let slot = if request.takes_run_slot {
            let permit = Arc::clone(&self.run_slots)
                .acquire_owned()
                .await
                .map_err(|_| AdmissionError::Closed)?;
            Some(permit)
        } else {
            None
        };

        Ok(ScopedPermit { tags, slot })
    }

    async fn acquire_tags(self: &Arc<Self>, tags: &BTreeSet<String>, bypass_queue: bool) -> TagLease {
        let mut ticket = TicketGuard {
            controller: Arc::clone(self),
            ticket: if bypass_queue {
                None
            } else {
                Some(self.lock().enqueue(tags))
            },
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a release between the
            // check and the await still wakes us.
            notified.as_mut().enable();

            if self.try_grant(tags, ticket.ticket) {
                if ticket.ticket.take().is_some() {
                    // Waiters queued behind this ticket may now fit.
                    self.notify.notify_waiters();
                }
                trace!("Granted resources {:?}", tags);
                return TagLease {
                    controller: Arc::clone(self),
                    tags: tags.clone(),
                };
            }

            notified.await;
        }
    }

    fn try_grant(&self, tags: &BTreeSet<String>, ticket: Option<u64>) -> bool {
        let mut state = self.lock();

        if let Some(ticket) = ticket {
            if state.has_earlier_waiter(ticket, tags) {
                return false;
            }
        }

        let available = tags.iter().all(|tag| {
            let pool = state.pool(tag, self.default_pool_size, &self.configured);
            pool.in_use < pool.capacity
        });
        if !available {
            return false;
        }

        for tag in tags {
            state.pool(tag, self.default_pool_size, &self.configured).in_use += 1;
        }
        if let Some(ticket) = ticket {
            state.waiters.remove(&ticket);
        }
        true
    }

    fn release_tags(&self, tags: &BTreeSet<String>) {
        {
            let mut state = self.lock();
            for tag in tags {
                if let Some(pool) = state.pools.get_mut(tag) {
                    pool.in_use = pool.in_use.saturating_sub(1);
                }
            }
        }
        debug!("Released resources {:?}", tags);
        self.notify.notify_waiters();
    }

    fn abandon(&self, ticket: u64) {
        self.lock().waiters.remove(&ticket);
        // Later waiters may have been queued behind this one.
        self.notify.notify_waiters();
    }

    /// Permits of a tag currently held.
    pub fn in_use(&self, tag: &str) -> usize {
        self.lock().pools.get(tag).map(|p| p.in_use).unwrap_or(0)
    }

    pub fn capacity(&self, tag: &str) -> usize {
        self.lock()
            .pools
            .get(tag)
            .map(|p| p.capacity)
            .or_else(|| self.configured.get(tag).copied())
            .unwrap_or(self.default_pool_size)
    }

    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn stats(&self) -> ResourceStats {
        let available = self.run_slots.available_permits();
        ResourceStats {
            max_concurrent: self.max_concurrent,
            available_slots: available,
            active_actions: self.max_concurrent.saturating_sub(available),
        }
    }
}

/// Removes an unserved ticket if the waiting future is dropped.
struct TicketGuard {
    controller: Arc<AdmissionController>,
    ticket: Option<u64>,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.controller.abandon(ticket);
        }
    }
}

struct TagLease {
    controller: Arc<AdmissionController>,
    tags: BTreeSet<String>,
}

impl Drop for TagLease {
    fn drop(&mut self) {
        self.controller.release_tags(&self.tags);
    }
}

/// Everything granted to one node. Released on drop, whether the node
/// succeeded, failed or was cancelled.
pub struct ScopedPermit {
    tags: Option<TagLease>,
    slot: Option<OwnedSemaphorePermit>,
}

impl ScopedPermit {
    /// Give back the run-wide slot early while keeping every tag.
    pub fn release_run_slot(&mut self) {
        self.slot.take();
    }

    pub fn holds_run_slot(&self) -> bool {
        self.slot.is_some()
    }
}

impl std::fmt::Debug for ScopedPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedPermit")
            .field("tags", &self.tags.as_ref().map(|l| &l.tags))
            .field("slot", &self.slot.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceStats {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub active_actions: usize,
}

impl ResourceStats {
    pub fn utilization_percentage(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            (self.active_actions as f64 / self.max_concurrent as f64) * 100.0
        }
    }
}
