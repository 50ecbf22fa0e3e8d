//! Single-flight slot table.
//!
//! Concurrent misses for one key coalesce onto a single factory run:
//! callers race to become the *lead* (bounded by a semaphore so a policy
//! may allow N concurrent builds), everyone else subscribes to a broadcast
//! channel and receives the lead's outcome — the value, the factory's
//! error, or a stampede timeout. Values travel type-erased so one table
//! serves every cached type.
//!
//! Slot lifecycle: a slot exists while a build is in flight and is removed
//! when the lead resolves or fails it. If a lead disappears without
//! resolving (the caller's future was dropped), its semaphore permit
//! returns and the next arriving caller becomes the new lead; parked
//! waiters time out under the policy's stampede deadline.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};

use memotier_core::CacheKey;

/// Type-erased value shared between the lead and its waiters.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Failure outcome broadcast to waiters.
#[derive(Clone, Debug)]
pub enum FlightFailure {
    /// The factory failed; the error is shared by every waiter.
    Factory(Arc<dyn std::error::Error + Send + Sync>),
    /// The factory did not complete within the stampede deadline.
    Timeout(Duration),
    /// The distributed lock was unavailable and the policy forbids
    /// direct fallback.
    LockUnavailable,
}

type FlightOutcome = Result<ErasedValue, FlightFailure>;

struct FlightSlot {
    sender: broadcast::Sender<FlightOutcome>,
    semaphore: Arc<Semaphore>,
}

/// What a caller should do after checking the slot table.
pub enum FlightDecision {
    /// Build: this caller holds a build permit.
    Lead(OwnedSemaphorePermit),
    /// Wait for the lead's broadcast.
    Wait(broadcast::Receiver<FlightOutcome>),
}

/// Concurrent map of in-flight builds, keyed by cache key.
#[derive(Default)]
pub struct FlightGroup {
    slots: DashMap<CacheKey, FlightSlot>,
}

impl FlightGroup {
    /// Creates an empty flight group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the flight for `key`: becomes the lead if a build permit is
    /// available, otherwise subscribes to the in-flight build.
    pub fn check(&self, key: &CacheKey, max_concurrent_builds: usize) -> FlightDecision {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.get();
                match slot.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => FlightDecision::Lead(permit),
                    Err(_) => FlightDecision::Wait(slot.sender.subscribe()),
                }
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(4);
                let semaphore = Arc::new(Semaphore::new(max_concurrent_builds.max(1)));
                let permit = semaphore
                    .clone()
                    .try_acquire_owned()
                    .expect("first permit acquisition on a fresh semaphore cannot fail");
                vacant.insert(FlightSlot { sender, semaphore });
                FlightDecision::Lead(permit)
            }
        }
    }

    /// Completes the flight with a value; every waiter receives it and the
    /// slot is released.
    pub fn resolve(&self, key: &CacheKey, value: ErasedValue) {
        if let Some((_, slot)) = self.slots.remove(key) {
            let _ = slot.sender.send(Ok(value));
        }
    }

    /// Completes the flight with a failure; every waiter receives it and
    /// the slot is released.
    pub fn fail(&self, key: &CacheKey, failure: FlightFailure) {
        if let Some((_, slot)) = self.slots.remove(key) {
            let _ = slot.sender.send(Err(failure));
        }
    }

    /// Drops a stale slot (a waiter observed a closed channel).
    pub fn cleanup(&self, key: &CacheKey) {
        self.slots.remove(key);
    }

    /// Number of keys with an in-flight build.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("k")
    }

    #[tokio::test]
    async fn first_caller_leads_second_waits() {
        let group = FlightGroup::new();
        let first = group.check(&key(), 1);
        let second = group.check(&key(), 1);
        assert!(matches!(first, FlightDecision::Lead(_)));
        assert!(matches!(second, FlightDecision::Wait(_)));
    }

    #[tokio::test]
    async fn waiters_receive_the_resolved_value() {
        let group = FlightGroup::new();
        let _lead = group.check(&key(), 1);
        let FlightDecision::Wait(mut rx) = group.check(&key(), 1) else {
            panic!("expected waiter");
        };

        group.resolve(&key(), Arc::new(42u32));

        let outcome = rx.recv().await.unwrap().unwrap();
        assert_eq!(*outcome.downcast::<u32>().unwrap(), 42);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiters_receive_the_shared_failure() {
        let group = FlightGroup::new();
        let _lead = group.check(&key(), 1);
        let FlightDecision::Wait(mut rx) = group.check(&key(), 1) else {
            panic!("expected waiter");
        };

        let error: Arc<dyn std::error::Error + Send + Sync> =
            Arc::new(std::io::Error::other("factory exploded"));
        group.fail(&key(), FlightFailure::Factory(error));

        match rx.recv().await.unwrap() {
            Err(FlightFailure::Factory(e)) => assert_eq!(e.to_string(), "factory exploded"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bounded_builds_allow_n_leads() {
        let group = FlightGroup::new();
        let a = group.check(&key(), 2);
        let b = group.check(&key(), 2);
        let c = group.check(&key(), 2);
        assert!(matches!(a, FlightDecision::Lead(_)));
        assert!(matches!(b, FlightDecision::Lead(_)));
        assert!(matches!(c, FlightDecision::Wait(_)));
    }

    #[tokio::test]
    async fn released_permit_lets_next_caller_lead() {
        let group = FlightGroup::new();
        let lead = group.check(&key(), 1);
        drop(lead);
        assert!(matches!(group.check(&key(), 1), FlightDecision::Lead(_)));
    }
}
