//! Protocol event dispatch.
//!
//! One [`EventDispatcher::dispatch`] call serves two kinds of consumers:
//! one-shot waiters registered through `wait_for`, which are all released
//! and discarded, and the standing [`EventHandler`], which is spawned as its
//! own task so a slow or failing handler never stalls the read loop.

use crate::error::{Result, RivalError};
use crate::lock;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;

/// The closed set of protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Ready,
    Disconnect,
    Request,
    Response,
    Information,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        Self::Connect,
        Self::Ready,
        Self::Disconnect,
        Self::Request,
        Self::Response,
        Self::Information,
        Self::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "rival_connect",
            Self::Ready => "rival_ready",
            Self::Disconnect => "rival_disconnect",
            Self::Request => "rival_request",
            Self::Response => "rival_response",
            Self::Information => "rival_information",
            Self::Error => "rival_error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = RivalError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| RivalError::UnknownEvent(s.to_string()))
    }
}

/// An occurrence together with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect,
    Ready,
    Disconnect,
    Request { route: String, sender: String },
    Response { sender: String },
    Information { data: Value, sender: String },
    Error(String),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Ready => EventKind::Ready,
            Self::Disconnect => EventKind::Disconnect,
            Self::Request { .. } => EventKind::Request,
            Self::Response { .. } => EventKind::Response,
            Self::Information { .. } => EventKind::Information,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Standing handler for protocol events. Every method defaults to a no-op.
///
/// Errors returned from a handler are logged and otherwise ignored.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_request(&self, _route: &str, _sender: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_response(&self, _sender: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Information broadcast by `sender`.
    async fn on_information(&self, _data: Value, _sender: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_error(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn invoke(handler: &dyn EventHandler, event: Event) -> anyhow::Result<()> {
    match event {
        Event::Connect => handler.on_connect().await,
        Event::Ready => handler.on_ready().await,
        Event::Disconnect => handler.on_disconnect().await,
        Event::Request { route, sender } => handler.on_request(&route, &sender).await,
        Event::Response { sender } => handler.on_response(&sender).await,
        Event::Information { data, sender } => handler.on_information(data, &sender).await,
        Event::Error(message) => handler.on_error(&message).await,
    }
}

type Waiters = Arc<Mutex<HashMap<EventKind, Vec<oneshot::Sender<()>>>>>;

#[derive(Default)]
pub(crate) struct EventDispatcher {
    waiters: Waiters,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub(crate) fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        *self
            .handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    /// Register a one-shot waiter now and return the future that awaits it.
    ///
    /// Waiters whose future timed out or was dropped are pruned here and on
    /// timeout, so the queue only holds live receivers.
    pub(crate) fn wait_for(
        &self,
        kind: EventKind,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.waiters);
            let queue = waiters.entry(kind).or_default();
            queue.retain(|waiter| !waiter.is_closed());
            queue.push(tx);
        }
        let waiters = Arc::clone(&self.waiters);
        async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        prune(&waiters, kind);
                        return Err(RivalError::Timeout(limit));
                    }
                },
                None => rx.await,
            };
            outcome.map_err(|_| RivalError::Disconnected)
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        lock(&self.waiters).values().map(Vec::len).sum()
    }

    pub(crate) fn dispatch(&self, event: Event) {
        let kind = event.kind();
        tracing::debug!(event = %kind, "dispatching event");

        let waiters = lock(&self.waiters).remove(&kind).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(());
        }

        let handler = self
            .handler
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            tokio::spawn(async move {
                if let Err(error) = invoke(handler.as_ref(), event).await {
                    tracing::error!(event = %kind, ?error, "event handler failed");
                }
            });
        }
    }
}

fn prune(waiters: &Mutex<HashMap<EventKind, Vec<oneshot::Sender<()>>>>, kind: EventKind) {
    let mut waiters = lock(waiters);
    if let Some(queue) = waiters.get_mut(&kind) {
        queue.retain(|waiter| !waiter.is_closed());
        if queue.is_empty() {
            waiters.remove(&kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("rival_ready".parse::<EventKind>().unwrap(), EventKind::Ready);
        assert_eq!(
            "RIVAL_INFORMATION".parse::<EventKind>().unwrap(),
            EventKind::Information
        );
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn names_outside_the_set_are_rejected() {
        assert!(matches!(
            "on_message".parse::<EventKind>(),
            Err(RivalError::UnknownEvent(name)) if name == "on_message"
        ));
    }

    #[tokio::test]
    async fn dispatch_releases_every_waiter() {
        let dispatcher = EventDispatcher::default();
        let first = dispatcher.wait_for(EventKind::Ready, None);
        let second = dispatcher.wait_for(EventKind::Ready, Some(Duration::from_secs(1)));
        let other = dispatcher.wait_for(EventKind::Disconnect, Some(Duration::from_millis(10)));

        dispatcher.dispatch(Event::Ready);

        first.await.unwrap();
        second.await.unwrap();
        assert!(matches!(other.await, Err(RivalError::Timeout(_))));
        assert!(lock(&dispatcher.waiters)
            .get(&EventKind::Ready)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let dispatcher = EventDispatcher::default();
        let err = dispatcher
            .wait_for(EventKind::Ready, Some(Duration::from_secs(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, RivalError::Timeout(d) if d == Duration::from_secs(3)));
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiters_do_not_accumulate() {
        let dispatcher = EventDispatcher::default();
        for _ in 0..100 {
            let outcome = dispatcher
                .wait_for(EventKind::Disconnect, Some(Duration::from_millis(1)))
                .await;
            assert!(matches!(outcome, Err(RivalError::Timeout(_))));
        }
        assert_eq!(dispatcher.queued(), 0);

        for _ in 0..100 {
            drop(dispatcher.wait_for(EventKind::Ready, None));
        }
        let live = dispatcher.wait_for(EventKind::Ready, None);
        assert_eq!(dispatcher.queued(), 1);

        dispatcher.dispatch(Event::Ready);
        live.await.unwrap();
        assert_eq!(dispatcher.queued(), 0);
    }

    struct Recorder {
        seen: mpsc::UnboundedSender<(Value, String)>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_information(&self, data: Value, sender: &str) -> anyhow::Result<()> {
            let _ = self.seen.send((data, sender.to_string()));
            Ok(())
        }

        async fn on_error(&self, _message: &str) -> anyhow::Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    #[tokio::test]
    async fn standing_handler_receives_arguments() {
        let dispatcher = EventDispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.set_handler(Arc::new(Recorder { seen: tx }));

        dispatcher.dispatch(Event::Information {
            data: json!({"guilds": 3}),
            sender: "shard-2".into(),
        });

        let (data, sender) = rx.recv().await.unwrap();
        assert_eq!(data, json!({"guilds": 3}));
        assert_eq!(sender, "shard-2");
    }

    #[tokio::test]
    async fn handler_errors_do_not_propagate() {
        let dispatcher = EventDispatcher::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.set_handler(Arc::new(Recorder { seen: tx }));

        dispatcher.dispatch(Event::Error("boom".into()));
        dispatcher.dispatch(Event::Information {
            data: json!(1),
            sender: "a".into(),
        });

        assert_eq!(rx.recv().await.unwrap().0, json!(1));
    }
}
