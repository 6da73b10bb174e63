//! Remote object registrations.
//!
//! A route may answer with a [`RemoteObject`]. Its methods are registered
//! under a fresh id and the requester receives an
//! [`ObjectDescriptor`](rival_core::ObjectDescriptor) naming them. Only the
//! names given to [`RemoteObject::method`] are callable. A registration lives
//! for a fixed time after creation, however often it is used.

use crate::lock;
use crate::routes::{HandlerFuture, Reply};
use rival_core::ObjectDescriptor;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Lifetime of a registration unless overridden with
/// [`RemoteObject::expires_after`].
pub const DEFAULT_OBJECT_EXPIRY: Duration = Duration::from_secs(60);

/// Positional and keyword arguments of a remote method invocation.
#[derive(Debug, Clone, Default)]
pub struct MethodCall {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

pub(crate) type MethodHandler = Arc<dyn Fn(MethodCall) -> HandlerFuture + Send + Sync>;

/// An object returned to another process by reference.
pub struct RemoteObject {
    attributes: Value,
    methods: HashMap<String, MethodHandler>,
    expiry: Duration,
}

impl RemoteObject {
    /// An object carrying `attributes` as its plain data.
    pub fn new(attributes: Value) -> Self {
        Self {
            attributes,
            methods: HashMap::new(),
            expiry: DEFAULT_OBJECT_EXPIRY,
        }
    }

    /// Expose a method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |call| Box::pin(method(call)));
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn expires_after(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn attributes(&self) -> &Value {
        &self.attributes
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("RemoteObject")
            .field("attributes", &self.attributes)
            .field("methods", &methods)
            .field("expiry", &self.expiry)
            .finish()
    }
}

struct Registration {
    methods: HashMap<String, MethodHandler>,
    expires_at: Instant,
}

#[derive(Default)]
pub(crate) struct ObjectRegistry {
    entries: Arc<Mutex<HashMap<String, Registration>>>,
}

impl ObjectRegistry {
    /// Register `object` and schedule its removal.
    pub(crate) fn register(&self, object: RemoteObject) -> ObjectDescriptor {
        let RemoteObject {
            attributes,
            methods,
            expiry,
        } = object;

        let mut names: Vec<String> = methods.keys().cloned().collect();
        names.sort();

        let uuid = uuid::Uuid::new_v4().to_string();
        lock(&self.entries).insert(
            uuid.clone(),
            Registration {
                methods,
                expires_at: Instant::now() + expiry,
            },
        );

        let entries = Arc::clone(&self.entries);
        let purge_id = uuid.clone();
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            lock(&entries).remove(&purge_id);
            tracing::debug!(object = %purge_id, "remote object expired");
        });

        tracing::debug!(object = %uuid, methods = ?names, ?expiry, "registered remote object");
        ObjectDescriptor {
            uuid,
            attributes,
            methods: names,
            expiry: expiry.as_secs_f64(),
        }
    }

    /// The method `name` of object `uuid`, if the registration is still live.
    pub(crate) fn lookup(&self, uuid: &str, name: &str) -> Option<MethodHandler> {
        let entries = lock(&self.entries);
        let registration = entries.get(uuid)?;
        if Instant::now() >= registration.expires_at {
            return None;
        }
        registration.methods.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> RemoteObject {
        RemoteObject::new(json!({"name": "counter"}))
            .method("add", |call: MethodCall| async move {
                let total: i64 = call.args.iter().filter_map(Value::as_i64).sum();
                Ok(Reply::value(total))
            })
            .expires_after(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn descriptor_lists_allowed_methods() {
        let registry = ObjectRegistry::default();
        let descriptor = registry.register(counter());
        assert_eq!(descriptor.methods, vec!["add".to_string()]);
        assert_eq!(descriptor.attributes, json!({"name": "counter"}));
        assert_eq!(descriptor.expiry, 10.0);
        assert!(registry.lookup(&descriptor.uuid, "add").is_some());
        assert!(registry.lookup(&descriptor.uuid, "drop").is_none());
        assert!(registry.lookup("never-registered", "add").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn methods_run_with_arguments() {
        let registry = ObjectRegistry::default();
        let descriptor = registry.register(counter());
        let method = registry.lookup(&descriptor.uuid, "add").unwrap();
        let reply = method(MethodCall {
            args: vec![json!(2), json!(3)],
            kwargs: Map::new(),
        })
        .await
        .unwrap();
        assert!(matches!(reply, Reply::Value(v) if v == json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn registration_expires_even_when_used() {
        let registry = ObjectRegistry::default();
        let descriptor = registry.register(counter());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(registry.lookup(&descriptor.uuid, "add").is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.lookup(&descriptor.uuid, "add").is_none());
        tokio::task::yield_now().await;
        assert_eq!(registry.len(), 0);
    }
}
