use crate::connection::Connection;
use crate::error::{Result, RivalError};
use crate::events::EventHandler;
use crate::routes::{Reply, RouteHandler, RouteRequest, route_handler};
use rival_core::{DEFAULT_HOST, DEFAULT_MAX_DATA_SIZE_MIB, DEFAULT_PORT, mib_to_bytes};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Logical identifier presented to the router.
    pub local_name: String,
    pub host: String,
    pub port: u16,
    /// Retry forever after losing the link.
    pub reconnect: bool,
    /// Fixed delay between reconnect attempts.
    pub reconnect_threshold: Duration,
    /// Inbound message ceiling in MiB.
    pub max_data_size: f64,
    /// Default timeout for `request`, `ping` and `get_clients`.
    pub request_timeout: Duration,
    /// Timeout for remote object method calls.
    pub function_call_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            reconnect: true,
            reconnect_threshold: Duration::from_secs(60),
            max_data_size: DEFAULT_MAX_DATA_SIZE_MIB,
            request_timeout: Duration::from_secs(60),
            function_call_timeout: Duration::from_secs(30),
        }
    }

    /// The router URI, `ws://host:port`.
    pub fn uri(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn max_message_bytes(&self) -> usize {
        mib_to_bytes(self.max_data_size)
    }
}

/// Builds a [`Connection`] with routes and an event handler declared up front.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    routes: Vec<(String, RouteHandler)>,
    handler: Option<Arc<dyn EventHandler>>,
}

impl ConnectionBuilder {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self::from_config(ConnectionConfig::new(local_name))
    }

    pub fn from_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            handler: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn reconnect_threshold(mut self, delay: Duration) -> Self {
        self.config.reconnect_threshold = delay;
        self
    }

    /// Inbound message ceiling in MiB.
    pub fn max_data_size(mut self, mib: f64) -> Self {
        self.config.max_data_size = mib;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn function_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.function_call_timeout = timeout;
        self
    }

    /// Declare a route. Duplicate names are reported by [`build`](Self::build).
    pub fn route<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.routes.push((name.into(), route_handler(handler)));
        self
    }

    pub fn event_handler(mut self, handler: impl EventHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Connection> {
        if self.config.local_name.is_empty() {
            return Err(RivalError::InvalidArgument(
                "local name cannot be empty".into(),
            ));
        }
        let connection = Connection::with_config(self.config);
        for (name, handler) in self.routes {
            connection.insert_route(&name, handler)?;
        }
        if let Some(handler) = self.handler {
            connection.set_event_handler(handler);
        }
        Ok(connection)
    }
}
