//! One-shot readiness gate
//!
//! A [`GateSetter`] publishes a value exactly once; any number of
//! [`ReadinessGate`] handles wait for it. Publishing consumes the setter, so
//! a second publication cannot be written:
//!
//! ```compile_fail
//! use disk_image_importer::gate::readiness_gate;
//!
//! let (setter, _gate) = readiness_gate::<u32>();
//! setter.set(1);
//! setter.set(2);
//! ```
//!
//! Dropping the setter without publishing releases all waiters with
//! [`GateClosed`].

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("readiness gate closed before a value was published")]
pub struct GateClosed;

/// Create a connected setter/gate pair
pub fn readiness_gate<T>() -> (GateSetter<T>, ReadinessGate<T>) {
    let (tx, rx) = watch::channel(None);
    (GateSetter { tx }, ReadinessGate { rx })
}

/// The unique write capability of a gate
pub struct GateSetter<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> GateSetter<T> {
    pub fn set(self, value: T) {
        self.tx.send_replace(Some(value));
    }
}

/// Read side of a gate; cheap to clone
#[derive(Clone)]
pub struct ReadinessGate<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> ReadinessGate<T> {
    /// Wait until the value is published and return a copy of it
    pub async fn wait(&self) -> Result<T, GateClosed> {
        let mut rx = self.rx.clone();
        let value = rx.wait_for(Option::is_some).await.map_err(|_| GateClosed)?;
        value.clone().ok_or(GateClosed)
    }

    /// The published value, if any, without waiting
    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_blocks_until_set() {
        let (setter, gate) = readiness_gate::<u64>();

        let pending = tokio::time::timeout(Duration::from_millis(50), gate.wait()).await;
        assert!(pending.is_err(), "wait must not return before set");
        assert_eq!(gate.get(), None);

        setter.set(42);
        assert_eq!(gate.wait().await, Ok(42));
        assert_eq!(gate.get(), Some(42));
    }

    #[tokio::test]
    async fn all_waiters_observe_the_same_value() {
        let (setter, gate) = readiness_gate::<String>();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        setter.set("qcow2".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "qcow2");
        }
        // A value read repeatedly stays the same.
        assert_eq!(gate.wait().await.unwrap(), "qcow2");
    }

    #[tokio::test]
    async fn dropped_setter_releases_waiters() {
        let (setter, gate) = readiness_gate::<u64>();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        drop(setter);
        assert_eq!(waiter.await.unwrap(), Err(GateClosed));
    }
}
