//! Bounded device pool with blocking acquire and scoped reservations.
//!
//! The pool is a multiset: with more than one unit slot per device, the same
//! device id is preloaded once per slot. A [`DeviceToken`] is a linear value —
//! it can only come out of the pool through [`DevicePool::acquire`] and goes
//! back exactly once, either through [`DevicePool::release`] or when the
//! [`Reservation`] holding it drops.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};

/// One unit slot on a device, checked out of the pool.
#[derive(Debug)]
pub struct DeviceToken {
    id: u32,
}

impl DeviceToken {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Shared pool of device slots. Capacity is fixed at construction:
/// `devices.len() * units_per_device` tokens.
#[derive(Debug)]
pub struct DevicePool {
    available: Mutex<VecDeque<u32>>,
    notify: Notify,
    capacity: usize,
}

impl DevicePool {
    /// Create a pool preloaded with every device slot.
    pub fn new(devices: &[u32], units_per_device: usize) -> Arc<Self> {
        let mut available = VecDeque::with_capacity(devices.len() * units_per_device);
        for device in devices {
            for _ in 0..units_per_device {
                available.push_back(*device);
            }
        }
        let capacity = available.len();
        Arc::new(Self {
            available: Mutex::new(available),
            notify: Notify::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Take one token, waiting up to `wait` for a slot to free up.
    ///
    /// `None` means "no device currently available", not failure; callers
    /// retry.
    pub async fn acquire(&self, wait: Duration) -> Option<DeviceToken> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(id) = self.available.lock().unwrap().pop_front() {
                return Some(DeviceToken { id });
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if timeout(remaining, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Return a token to the pool. Never blocks.
    pub fn release(&self, token: DeviceToken) {
        self.available.lock().unwrap().push_back(token.id);
        self.notify.notify_one();
    }

    /// Accumulate tokens on `count` distinct devices.
    ///
    /// A multiset pool can hand back a second slot on a device already held;
    /// those go straight back. After an acquire timeout with a partial batch
    /// in hand, everything is returned and the caller sleeps `backoff` before
    /// retrying from scratch — peers each sitting on part of a batch would
    /// otherwise deadlock the whole sweep. Never gives up: configuration
    /// validation guarantees the request fits the pool.
    pub async fn reserve(
        self: &Arc<Self>,
        count: usize,
        acquire_timeout: Duration,
        backoff: Duration,
    ) -> Reservation {
        let mut held: Vec<DeviceToken> = Vec::new();
        while held.len() < count {
            match self.acquire(acquire_timeout).await {
                Some(token) => {
                    if held.iter().any(|h| h.id() == token.id()) {
                        self.release(token);
                    } else {
                        held.push(token);
                    }
                }
                None if held.is_empty() => {}
                None => {
                    tracing::debug!(
                        "timed out holding {}/{} devices, backing off",
                        held.len(),
                        count
                    );
                    for token in held.drain(..) {
                        self.release(token);
                    }
                    sleep(backoff).await;
                }
            }
        }
        Reservation {
            pool: Arc::clone(self),
            tokens: held,
        }
    }
}

/// Device tokens exclusively held by one work unit's executor for its whole
/// lifetime. Dropping the reservation returns every token — success, stage
/// failure, and panic unwinding all take the same release path.
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<DevicePool>,
    tokens: Vec<DeviceToken>,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.tokens.iter().map(|t| t.id()).collect()
    }

    /// Comma-joined device ids, in the form `CUDA_VISIBLE_DEVICES` expects.
    pub fn visible_devices(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.id().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            self.pool.release(token);
        }
    }
}
