//! Publishes awaiting their broker acknowledgement.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::DeliveryError;

/// Final outcome of one publish.
pub type DeliveryOutcome = Result<(), DeliveryError>;

#[derive(Default)]
struct Waiters {
    by_key: HashMap<String, oneshot::Sender<DeliveryOutcome>>,
    closed: bool,
}

/// In-flight publishes keyed by correlation key.
///
/// Each entry resolves at most once: the first acknowledgement or rejection
/// removes it, so a later notification for the same key finds nothing.
#[derive(Default)]
pub struct PendingDeliveries {
    waiters: Mutex<Waiters>,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a publish. Fails once the session has closed.
    pub fn register(
        &self,
        correlation_key: impl Into<String>,
    ) -> Result<oneshot::Receiver<DeliveryOutcome>, DeliveryError> {
        let mut waiters = self.waiters();
        if waiters.closed {
            return Err(DeliveryError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        waiters.by_key.insert(correlation_key.into(), tx);
        Ok(rx)
    }

    /// Complete the publish for `correlation_key`.
    ///
    /// Returns false when no publish is waiting on that key.
    pub fn resolve(&self, correlation_key: &str, outcome: DeliveryOutcome) -> bool {
        match self.waiters().by_key.remove(correlation_key) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget a publish without resolving it.
    pub fn remove(&self, correlation_key: &str) -> bool {
        self.waiters().by_key.remove(correlation_key).is_some()
    }

    /// Fail every waiting publish and refuse new ones.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters();
            waiters.closed = true;
            waiters.by_key.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(DeliveryError::SessionClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let pending = PendingDeliveries::new();
        let rx = pending.register("k1").unwrap();

        assert!(pending.resolve("k1", Ok(())));
        assert!(!pending.resolve(
            "k1",
            Err(DeliveryError::Rejected {
                correlation_key: "k1".into(),
                detail: "late".into()
            })
        ));

        assert!(rx.await.unwrap().is_ok());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_carries_detail() {
        let pending = PendingDeliveries::new();
        let rx = pending.register("k2").unwrap();
        pending.resolve(
            "k2",
            Err(DeliveryError::Rejected {
                correlation_key: "k2".into(),
                detail: "no subscribers".into(),
            }),
        );
        match rx.await.unwrap() {
            Err(DeliveryError::Rejected { detail, .. }) => assert_eq!(detail, "no subscribers"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let pending = PendingDeliveries::new();
        let a = pending.register("a").unwrap();
        let b = pending.register("b").unwrap();
        pending.resolve("b", Ok(()));
        assert_eq!(pending.len(), 1);
        pending.resolve("a", Ok(()));
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
    }

    #[test]
    fn test_remove_discards_waiter() {
        let pending = PendingDeliveries::new();
        let _rx = pending.register("k").unwrap();
        assert!(pending.remove("k"));
        assert!(!pending.resolve("k", Ok(())));
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_refuses_new() {
        let pending = PendingDeliveries::new();
        let rx = pending.register("k").unwrap();
        pending.close();

        assert!(matches!(rx.await.unwrap(), Err(DeliveryError::SessionClosed)));
        assert!(matches!(
            pending.register("k2"),
            Err(DeliveryError::SessionClosed)
        ));
    }
}
