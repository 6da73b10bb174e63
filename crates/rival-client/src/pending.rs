//! Correlation table for in-flight calls.

use crate::error::{Result, RivalError};
use crate::lock;
use rival_core::MessagePayload;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// `uuid -> waiter` for every correlated call this connection has sent.
#[derive(Default)]
pub(crate) struct PendingOperations {
    waiters: Mutex<HashMap<String, oneshot::Sender<MessagePayload>>>,
}

impl PendingOperations {
    /// Register a waiter under a fresh correlation id.
    pub(crate) fn register(&self) -> (String, oneshot::Receiver<MessagePayload>) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = lock(&self.waiters);
        let uuid = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !waiters.contains_key(&candidate) {
                break candidate;
            }
        };
        waiters.insert(uuid.clone(), tx);
        tracing::trace!(%uuid, pending = waiters.len(), "registered pending operation");
        (uuid, rx)
    }

    /// Hand a reply to the waiter registered under its `uuid`.
    ///
    /// The first reply wins; later replies for the same id report
    /// `UnknownCorrelation`.
    pub(crate) fn resolve(&self, frame: MessagePayload) -> Result<()> {
        let Some(uuid) = frame.uuid.clone() else {
            return Err(RivalError::MissingCorrelation(frame.kind));
        };
        let waiter = lock(&self.waiters).remove(&uuid);
        match waiter {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| RivalError::UnknownCorrelation(uuid)),
            None => Err(RivalError::UnknownCorrelation(uuid)),
        }
    }

    pub(crate) fn contains(&self, uuid: &str) -> bool {
        lock(&self.waiters).contains_key(uuid)
    }

    pub(crate) fn cancel(&self, uuid: &str) {
        lock(&self.waiters).remove(uuid);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Wait for the reply to `uuid`, dropping the registration on timeout.
    pub(crate) async fn wait(
        &self,
        uuid: &str,
        rx: oneshot::Receiver<MessagePayload>,
        timeout: Duration,
    ) -> Result<MessagePayload> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                self.cancel(uuid);
                Err(RivalError::Disconnected)
            }
            Err(_) => {
                self.cancel(uuid);
                tracing::warn!(%uuid, ?timeout, "request timed out");
                Err(RivalError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rival_core::PayloadType;
    use serde_json::json;

    fn reply(uuid: &str, data: serde_json::Value) -> MessagePayload {
        MessagePayload::response("peer", "me", Some(uuid.to_string()), data)
    }

    #[tokio::test]
    async fn matching_reply_resolves() {
        let pending = PendingOperations::default();
        let (uuid, rx) = pending.register();
        pending.resolve(reply(&uuid, json!(42))).unwrap();
        let frame = pending.wait(&uuid, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.data, json!(42));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn wrong_uuid_never_resolves() {
        let pending = PendingOperations::default();
        let (uuid, mut rx) = pending.register();
        let err = pending.resolve(reply("someone-else", json!(1))).unwrap_err();
        assert!(matches!(err, RivalError::UnknownCorrelation(id) if id == "someone-else"));
        assert!(rx.try_recv().is_err());
        assert!(pending.contains(&uuid));
    }

    #[tokio::test]
    async fn second_delivery_is_a_no_op() {
        let pending = PendingOperations::default();
        let (uuid, rx) = pending.register();
        pending.resolve(reply(&uuid, json!("first"))).unwrap();
        assert!(matches!(
            pending.resolve(reply(&uuid, json!("second"))),
            Err(RivalError::UnknownCorrelation(_))
        ));
        let frame = pending.wait(&uuid, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.data, json!("first"));
    }

    #[test]
    fn missing_uuid_is_reported() {
        let pending = PendingOperations::default();
        let frame = MessagePayload::response("peer", "me", None, json!(1));
        assert!(matches!(
            pending.resolve(frame),
            Err(RivalError::MissingCorrelation(PayloadType::Response))
        ));
    }

    #[test]
    fn ids_are_unique() {
        let pending = PendingOperations::default();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_the_operation() {
        let pending = PendingOperations::default();
        let (uuid, rx) = pending.register();
        let err = pending
            .wait(&uuid, rx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RivalError::Timeout(d) if d == Duration::from_secs(5)));
        assert!(!pending.contains(&uuid));
        // A late reply is dropped.
        assert!(matches!(
            pending.resolve(reply(&uuid, json!(1))),
            Err(RivalError::UnknownCorrelation(_))
        ));
    }
}
