//! Priority-ordered admission for network operations.
//!
//! At most `limit` operations hold a permit at once. When one finishes,
//! the waiting ticket with the highest priority goes next; equal
//! priorities go in arrival order. A ticket's priority can be raised
//! while it waits.

use mmsync_core::Priority;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// A queued or running operation's place in line.
#[derive(Debug)]
pub struct Ticket {
    priority: AtomicU8,
    order: u64,
}

impl Ticket {
    pub(crate) fn new(priority: Priority, order: u64) -> Self {
        Self {
            priority: AtomicU8::new(priority as u8),
            order,
        }
    }

    pub fn priority(&self) -> Priority {
        Priority::from_u8(self.priority.load(Ordering::SeqCst))
    }

    /// Raise to `max(current, priority)`.
    pub fn raise(&self, priority: Priority) {
        self.priority.fetch_max(priority as u8, Ordering::SeqCst);
    }

    pub fn order(&self) -> u64 {
        self.order
    }
}

struct Waiter {
    ticket: Arc<Ticket>,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    active: usize,
    waiting: Vec<Waiter>,
}

pub struct PriorityScheduler {
    limit: usize,
    next_order: AtomicU64,
    state: Mutex<State>,
}

impl PriorityScheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            next_order: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent across a panic in a holder
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ticket(&self, priority: Priority) -> Arc<Ticket> {
        Arc::new(Ticket::new(
            priority,
            self.next_order.fetch_add(1, Ordering::SeqCst),
        ))
    }

    /// Wait until `ticket` may run.
    pub async fn acquire(self: &Arc<Self>, ticket: Arc<Ticket>) -> SchedulerPermit {
        loop {
            let woken = {
                let mut state = self.lock();
                if state.active < self.limit {
                    state.active += 1;
                    return SchedulerPermit {
                        scheduler: Arc::clone(self),
                    };
                }
                let (wake, woken) = oneshot::channel();
                state.waiting.push(Waiter {
                    ticket: Arc::clone(&ticket),
                    wake,
                });
                woken
            };
            if woken.await.is_ok() {
                debug!(order = ticket.order, priority = ?ticket.priority(), "Scheduler granted queued ticket");
                return SchedulerPermit {
                    scheduler: Arc::clone(self),
                };
            }
        }
    }

    /// Hand the freed slot to the best waiter, or return it to the pool.
    fn release(&self) {
        let mut state = self.lock();
        loop {
            let next = state
                .waiting
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.ticket
                        .priority()
                        .cmp(&b.ticket.priority())
                        .then(b.ticket.order.cmp(&a.ticket.order))
                })
                .map(|(index, _)| index);
            match next {
                Some(index) => {
                    let waiter = state.waiting.swap_remove(index);
                    if waiter.wake.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.active = state.active.saturating_sub(1);
                    return;
                }
            }
        }
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn queued(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// Held while an operation runs. Dropping it admits the next ticket.
pub struct SchedulerPermit {
    scheduler: Arc<PriorityScheduler>,
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        self.scheduler.release();
    }
}
