//! Locally registered request handlers.

use crate::error::{Result, RivalError};
use crate::objects::RemoteObject;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// What a route or remote method answers with.
#[derive(Debug)]
pub enum Reply {
    /// Plain data, sent back as-is.
    Value(Value),
    /// An object whose methods stay callable by the requester until it expires.
    Object(RemoteObject),
}

impl Reply {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Serialize any value into a plain reply.
    pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<RemoteObject> for Reply {
    fn from(object: RemoteObject) -> Self {
        Self::Object(object)
    }
}

/// An inbound request handed to a route.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Logical identifier of the requesting peer.
    pub sender: String,
    pub route: String,
    /// Keyword arguments supplied by the requester.
    pub data: Value,
}

impl RouteRequest {
    /// A single keyword argument.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Deserialize all keyword arguments into `T`.
    pub fn args<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

pub(crate) type HandlerFuture = BoxFuture<'static, anyhow::Result<Reply>>;
pub(crate) type RouteHandler = Arc<dyn Fn(RouteRequest) -> HandlerFuture + Send + Sync>;

pub(crate) fn route_handler<F, Fut>(handler: F) -> RouteHandler
where
    F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(handler(request)))
}

#[derive(Default)]
pub(crate) struct RouteTable {
    routes: RwLock<HashMap<String, RouteHandler>>,
}

impl RouteTable {
    pub(crate) fn insert(&self, name: &str, handler: RouteHandler) -> Result<()> {
        if name.is_empty() {
            return Err(RivalError::RouteType("route name cannot be empty".into()));
        }
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.contains_key(name) {
            return Err(RivalError::RouteType(format!(
                "route name {name} is already registered"
            )));
        }
        routes.insert(name.to_string(), handler);
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RivalError::RouteNotFound(name.to_string()))
    }

    pub(crate) fn get(&self, name: &str) -> Option<RouteHandler> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
