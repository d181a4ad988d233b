//! Bounded-concurrency admission gate.
//!
//! # Responsibilities
//! - Cap the number of in-flight dispatches at `max_concurrent`
//! - Block callers beyond capacity until a slot frees
//! - Let the drain wait for every outstanding slot
//!
//! # Design Decisions
//! - Backed by a fair tokio semaphore; waiters are served in arrival order
//! - A slot is an RAII guard, release happens on drop and only there

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ProxyError, Result};
use crate::observability::metrics;

/// Largest supported capacity: the semaphore's permit limit, and what
/// [`AdmissionController::wait_idle`] can acquire in one call.
pub const MAX_CAPACITY: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Shared admission controller. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    /// Capacities above [`MAX_CAPACITY`] are clamped to it.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_CAPACITY);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. There is no timeout.
    pub async fn acquire(&self) -> Result<AdmissionSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::AdmissionClosed)?;

        let slot = AdmissionSlot {
            _permit: permit,
            controller: self.clone(),
        };
        metrics::record_in_flight(self.in_flight());
        Ok(slot)
    }

    /// Take a slot only if one is free right now.
    #[cfg(test)]
    pub fn try_acquire(&self) -> Option<AdmissionSlot> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        Some(AdmissionSlot {
            _permit: permit,
            controller: self.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Resolve once every slot is back in the pool.
    ///
    /// Only meaningful once no new work is being admitted; otherwise the
    /// wait queues ahead of newer acquirers.
    pub async fn wait_idle(&self) -> Result<()> {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        let _permits = self
            .slots
            .acquire_many(all)
            .await
            .map_err(|_| ProxyError::AdmissionClosed)?;
        Ok(())
    }
}

/// One unit of concurrency capacity.
///
/// Dropping the slot returns it to the pool, which makes a double release
/// or a release without an acquire impossible.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    controller: AdmissionController,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        // the permit field is released after this body runs
        metrics::record_in_flight(self.controller.in_flight().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn slots_return_on_drop() {
        let admission = AdmissionController::new(2);

        let a = admission.acquire().await.unwrap();
        let b = admission.acquire().await.unwrap();
        assert_eq!(admission.in_flight(), 2);
        assert!(admission.try_acquire().is_none());

        drop(a);
        assert_eq!(admission.in_flight(), 1);
        drop(b);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let capacity = 4;
        let admission = AdmissionController::new(capacity);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let admission = admission.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _slot = admission.acquire().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= capacity);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_released_when_holder_panics() {
        let admission = AdmissionController::new(1);
        let held = admission.clone();

        let result = tokio::spawn(async move {
            let _slot = held.acquire().await.unwrap();
            panic!("handler fault");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(admission.in_flight(), 0);
        assert!(admission.try_acquire().is_some());
    }

    #[tokio::test]
    async fn wait_idle_waits_for_outstanding_slots() {
        let admission = AdmissionController::new(3);
        let slot = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should resolve")
            .unwrap()
            .unwrap();
    }

    #[test]
    fn oversized_capacity_is_clamped() {
        let admission = AdmissionController::new(usize::MAX);
        assert_eq!(admission.capacity(), MAX_CAPACITY);
        assert_eq!(admission.in_flight(), 0);
    }
}
