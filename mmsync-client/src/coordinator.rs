//! Coalescing of identical in-flight requests.
//!
//! A key maps to at most one outstanding operation. Later callers for the
//! same key get a clone of the shared result and raise the operation's
//! priority instead of issuing a second request.

use crate::scheduler::{PriorityScheduler, Ticket};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use mmsync_core::{Priority, SyncError, SyncResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Result handle every caller of one in-flight key awaits.
pub type SharedResult<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

struct InFlight<T: Clone> {
    id: u64,
    ticket: Arc<Ticket>,
    result: SharedResult<T>,
}

/// Session marker handed to an operation when it is issued.
///
/// Operations check it before writing shared state; after a
/// [`RequestCoordinator::reset`] it reports stale.
#[derive(Debug, Clone)]
pub struct EpochToken {
    epoch: Arc<AtomicU64>,
    issued: u64,
}

impl EpochToken {
    pub fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.issued
    }
}

type FlightMap<T> = HashMap<String, InFlight<T>>;

pub struct RequestCoordinator<T: Clone + Send + Sync + 'static> {
    in_flight: Arc<Mutex<FlightMap<T>>>,
    scheduler: Option<Arc<PriorityScheduler>>,
    epoch: Arc<AtomicU64>,
    next_id: AtomicU64,
}

fn lock<T: Clone>(map: &Mutex<FlightMap<T>>) -> MutexGuard<'_, FlightMap<T>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + Sync + 'static> RequestCoordinator<T> {
    pub fn new(scheduler: Arc<PriorityScheduler>) -> Self {
        Self::build(Some(scheduler))
    }

    /// A coordinator whose operations start without waiting for a
    /// scheduler slot. For operations that only compose scheduled ones.
    pub fn unscheduled() -> Self {
        Self::build(None)
    }

    fn build(scheduler: Option<Arc<PriorityScheduler>>) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            epoch: Arc::new(AtomicU64::new(0)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the operation in flight for `key`, raising its priority.
    pub fn join(&self, key: &str, priority: Priority) -> Option<SharedResult<T>> {
        let flights = lock(&self.in_flight);
        flights.get(key).map(|flight| {
            flight.ticket.raise(priority);
            debug!(key, priority = ?flight.ticket.priority(), "Joining in-flight request");
            flight.result.clone()
        })
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.in_flight).contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Run `op` for `key` unless an operation for it is already in flight.
    ///
    /// `op` is called immediately to build the operation; the operation
    /// itself runs on the runtime once the scheduler admits it, so it
    /// completes even if every caller stops waiting.
    pub fn fetch<F, Fut>(&self, key: impl Into<String>, priority: Priority, op: F) -> SharedResult<T>
    where
        F: FnOnce(EpochToken) -> Fut,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let key = key.into();
        let mut flights = lock(&self.in_flight);
        if let Some(flight) = flights.get(&key) {
            flight.ticket.raise(priority);
            debug!(key = %key, "Coalesced request");
            return flight.result.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ticket = match &self.scheduler {
            Some(scheduler) => scheduler.ticket(priority),
            None => Arc::new(Ticket::new(priority, id)),
        };
        let token = EpochToken {
            epoch: Arc::clone(&self.epoch),
            issued: self.epoch.load(Ordering::SeqCst),
        };
        let work = op(token.clone());

        let task = {
            let scheduler = self.scheduler.clone();
            let ticket = Arc::clone(&ticket);
            let in_flight = Arc::clone(&self.in_flight);
            let key = key.clone();
            tokio::spawn(async move {
                let permit = match scheduler {
                    Some(scheduler) => Some(scheduler.acquire(ticket).await),
                    None => None,
                };
                let result = work.await;
                drop(permit);
                {
                    let mut flights = lock(&in_flight);
                    if flights.get(&key).map(|flight| flight.id) == Some(id) {
                        flights.remove(&key);
                    }
                }
                if token.is_current() {
                    result
                } else {
                    Err(SyncError::SessionReset)
                }
            })
        };

        let result = async move {
            task.await.unwrap_or_else(|e| {
                Err(SyncError::TaskFailed {
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();

        flights.insert(
            key,
            InFlight {
                id,
                ticket,
                result: result.clone(),
            },
        );
        result
    }

    /// Forget every in-flight operation.
    ///
    /// Operations already running still finish, but resolve to
    /// [`SyncError::SessionReset`] and never clear newer entries.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let dropped = {
            let mut flights = lock(&self.in_flight);
            let count = flights.len();
            flights.clear();
            count
        };
        info!(dropped, "Request coordinator reset");
    }
}
