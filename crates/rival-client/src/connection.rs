//! The client link to the router.

use crate::config::{ConnectionBuilder, ConnectionConfig};
use crate::error::{Result, RivalError};
use crate::events::{Event, EventDispatcher, EventHandler, EventKind};
use crate::lock;
use crate::objects::{MethodCall, ObjectRegistry};
use crate::pending::PendingOperations;
use crate::response::{ObjectProxy, Response};
use crate::routes::{HandlerFuture, Reply, RouteHandler, RouteRequest, RouteTable, route_handler};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use rival_core::{
    ALREADY_AUTHORIZED, ConnectionState, FunctionCallData, MessagePayload, OBJECT_EXPIRED,
    ObjectDescriptor, PayloadType, ProtocolError, ROUTE_NOT_FOUND,
};
use serde_json::{Map, Value, json};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketReader = SplitStream<Socket>;
type SocketWriter = SplitSink<Socket, Message>;

/// Recipients of an [`inform`](Connection::inform) broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destinations {
    /// Every other active peer.
    All,
    Only(Vec<String>),
}

impl Destinations {
    fn into_list(self) -> Option<Vec<String>> {
        match self {
            Self::All => None,
            Self::Only(list) if list.is_empty() => None,
            Self::Only(list) => Some(list),
        }
    }
}

impl From<&str> for Destinations {
    fn from(destination: &str) -> Self {
        Self::Only(vec![destination.to_string()])
    }
}

impl From<String> for Destinations {
    fn from(destination: String) -> Self {
        Self::Only(vec![destination])
    }
}

impl From<Vec<String>> for Destinations {
    fn from(destinations: Vec<String>) -> Self {
        Self::Only(destinations)
    }
}

impl From<Vec<&str>> for Destinations {
    fn from(destinations: Vec<&str>) -> Self {
        Self::Only(destinations.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Destinations {
    fn from(destinations: &[&str]) -> Self {
        Self::Only(destinations.iter().map(|d| d.to_string()).collect())
    }
}

#[derive(Default)]
struct Link {
    state: ConnectionState,
    on_hold: bool,
    /// Set by `close`; suppresses reconnecting.
    closing: bool,
    /// A read loop task is alive (possibly reconnecting).
    running: bool,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

/// Claims `running` for a `start` in flight and releases it unless the read
/// loop took over, including when the `start` future is dropped.
struct Starting<'a> {
    link: &'a Mutex<Link>,
    handed_off: bool,
}

impl Drop for Starting<'_> {
    fn drop(&mut self) {
        if !self.handed_off {
            let mut link = lock(self.link);
            link.running = false;
            link.state = ConnectionState::Disconnected;
            link.outbound = None;
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    link: Mutex<Link>,
    pending: PendingOperations,
    routes: RouteTable,
    objects: ObjectRegistry,
    events: EventDispatcher,
}

/// A link to the router under one logical identifier.
///
/// Cloning is cheap; clones share the same socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local_name", &self.inner.config.local_name)
            .field("uri", &self.inner.config.uri())
            .field("state", &self.state())
            .field("on_hold", &self.on_hold())
            .finish()
    }
}

impl Connection {
    /// A connection with default settings.
    pub fn new(local_name: impl Into<String>) -> Self {
        Self::with_config(ConnectionConfig::new(local_name))
    }

    pub fn builder(local_name: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(local_name)
    }

    pub fn with_config(config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link: Mutex::new(Link::default()),
                pending: PendingOperations::default(),
                routes: RouteTable::default(),
                objects: ObjectRegistry::default(),
                events: EventDispatcher::default(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn local_name(&self) -> &str {
        &self.inner.config.local_name
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    pub fn authorized(&self) -> bool {
        self.state() == ConnectionState::Authorized
    }

    /// Another live connection holds this identifier.
    pub fn on_hold(&self) -> bool {
        lock(&self.inner.link).on_hold
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link)
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn is_ready(&self) -> bool {
        let link = lock(&self.inner.link);
        link.state == ConnectionState::Authorized && !link.on_hold
    }

    fn is_closing(&self) -> bool {
        lock(&self.inner.link).closing
    }

    /// Names of the registered routes.
    pub fn routes(&self) -> Vec<String> {
        self.inner.routes.names()
    }

    /// Register a route. Fails if the name is taken.
    pub fn add_route<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        self.insert_route(name, route_handler(handler))
    }

    pub(crate) fn insert_route(&self, name: &str, handler: RouteHandler) -> Result<()> {
        self.inner.routes.insert(name, handler)?;
        tracing::debug!(route = %name, "registered route");
        Ok(())
    }

    pub fn remove_route(&self, name: &str) -> Result<()> {
        self.inner.routes.remove(name)
    }

    /// Install the standing event handler, replacing any previous one.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.set_handler(handler);
    }

    /// Wait for the next occurrence of `kind`.
    ///
    /// The waiter is registered when this is called, not when the returned
    /// future is first polled.
    pub fn wait_for(
        &self,
        kind: EventKind,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        self.inner.events.wait_for(kind, timeout)
    }

    /// Resolve once the connection is authorized and not on hold.
    pub async fn wait_until_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let ready = self.wait_for(EventKind::Ready, None);
        if self.is_ready() {
            return Ok(());
        }
        ready.await
    }

    pub async fn wait_until_disconnected(&self) -> Result<()> {
        self.wait_for(EventKind::Disconnect, None).await
    }

    /// Connect, send verification and start the read loop.
    pub async fn start(&self) -> Result<()> {
        {
            let mut link = lock(&self.inner.link);
            let open = link.outbound.as_ref().is_some_and(|tx| !tx.is_closed());
            if open || link.running {
                return Err(RivalError::AlreadyConnected);
            }
            link.closing = false;
            link.running = true;
        }
        let mut starting = Starting {
            link: &self.inner.link,
            handed_off: false,
        };
        let stream = self.connect_and_verify().await?;
        starting.handed_off = true;
        tokio::spawn(self.clone().read_loop(stream));
        Ok(())
    }

    /// Close the socket and stop the read loop without reconnecting.
    pub fn close(&self) {
        let mut link = lock(&self.inner.link);
        link.closing = true;
        if let Some(tx) = &link.outbound {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Call `route` on peer `source` with keyword arguments `data`, using the
    /// configured request timeout.
    pub async fn request(&self, route: &str, source: &str, data: Value) -> Result<Response> {
        self.request_with_timeout(route, source, data, self.inner.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        route: &str,
        source: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Response> {
        self.ensure_ready()?;
        if route.is_empty() || source.is_empty() {
            return Err(RivalError::InvalidArgument(
                "missing required information for this request".into(),
            ));
        }
        tracing::info!(route = %route, destination = %source, "requesting");

        let (uuid, rx) = self.inner.pending.register();
        let frame = MessagePayload::request(self.local_name(), source, route, data, uuid.as_str());
        let reply = self.call(frame, &uuid, rx, timeout).await?;
        self.response_from(reply)
    }

    /// Ask the router whether `client` (or the router itself) is reachable.
    pub async fn ping(&self, client: Option<&str>, timeout: Duration) -> Result<bool> {
        self.ensure_ready()?;
        tracing::debug!(client = ?client, "pinging router");

        let (uuid, rx) = self.inner.pending.register();
        let frame = MessagePayload::ping(
            self.local_name(),
            client.map(str::to_string),
            uuid.as_str(),
        );
        let reply = self.call(frame, &uuid, rx, timeout).await?;
        if reply.kind == PayloadType::Error {
            return Err(remote_error(reply));
        }
        Ok(reply
            .data
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Identifiers currently active on the router.
    pub async fn get_clients(&self, timeout: Duration) -> Result<Vec<String>> {
        self.ensure_ready()?;
        tracing::info!("requesting client list");

        let (uuid, rx) = self.inner.pending.register();
        let frame = MessagePayload::client_list(self.local_name(), uuid.as_str());
        let reply = self.call(frame, &uuid, rx, timeout).await?;
        if reply.kind == PayloadType::Error {
            return Err(remote_error(reply));
        }
        serde_json::from_value(reply.data).map_err(|e| RivalError::InvalidReply(e.to_string()))
    }

    /// Broadcast `data` without expecting a reply.
    pub fn inform(&self, data: Value, destinations: impl Into<Destinations>) -> Result<()> {
        self.ensure_ready()?;
        let destinations = destinations.into().into_list();
        tracing::info!(destinations = ?destinations, "informing peers");
        let frame = MessagePayload::information(self.local_name(), destinations, data);
        self.send(&frame)
    }

    /// Invoke `method` on remote object `object_id` held by `destination`,
    /// using the configured function call timeout.
    pub async fn function_call(
        &self,
        destination: &str,
        object_id: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Response> {
        let timeout = self.inner.config.function_call_timeout;
        self.function_call_with_timeout(destination, object_id, method, args, kwargs, timeout)
            .await
    }

    pub async fn function_call_with_timeout(
        &self,
        destination: &str,
        object_id: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Response> {
        self.ensure_ready()?;
        tracing::debug!(destination = %destination, object = %object_id, method = %method, "calling remote object");

        let call = FunctionCallData::new(object_id, method)
            .with_args(args)
            .with_kwargs(kwargs);
        let (uuid, rx) = self.inner.pending.register();
        let frame = match MessagePayload::function_call(
            self.local_name(),
            destination,
            uuid.as_str(),
            &call,
        ) {
            Ok(frame) => frame,
            Err(error) => {
                self.inner.pending.cancel(&uuid);
                return Err(error.into());
            }
        };
        let reply = self.call(frame, &uuid, rx, timeout).await?;
        self.response_from(reply)
    }

    fn ensure_ready(&self) -> Result<()> {
        let link = lock(&self.inner.link);
        let open = link.outbound.as_ref().is_some_and(|tx| !tx.is_closed());
        if !open || link.on_hold {
            return Err(RivalError::NotReady);
        }
        if link.state != ConnectionState::Authorized {
            return Err(RivalError::Unauthorized);
        }
        Ok(())
    }

    fn send(&self, frame: &MessagePayload) -> Result<()> {
        let text = frame.encode()?;
        tracing::debug!(
            kind = %frame.kind,
            destination = ?frame.destination,
            uuid = ?frame.uuid,
            "sending frame"
        );
        let link = lock(&self.inner.link);
        let tx = link.outbound.as_ref().ok_or(RivalError::NotReady)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| RivalError::Disconnected)
    }

    async fn call(
        &self,
        frame: MessagePayload,
        uuid: &str,
        rx: oneshot::Receiver<MessagePayload>,
        timeout: Duration,
    ) -> Result<MessagePayload> {
        if let Err(error) = self.send(&frame) {
            self.inner.pending.cancel(uuid);
            return Err(error);
        }
        self.inner.pending.wait(uuid, rx, timeout).await
    }

    fn response_from(&self, reply: MessagePayload) -> Result<Response> {
        if reply.kind == PayloadType::Error {
            return Err(remote_error(reply));
        }
        if reply.pseudo_object {
            let descriptor: ObjectDescriptor = serde_json::from_value(reply.data)
                .map_err(|e| RivalError::InvalidReply(e.to_string()))?;
            return Ok(Response::Object(ObjectProxy::new(
                self.clone(),
                reply.id,
                descriptor,
            )));
        }
        Ok(Response::Value(reply.data))
    }

    async fn connect_and_verify(&self) -> Result<SocketReader> {
        let stream = self.connect().await?;
        self.verify()?;
        Ok(stream)
    }

    async fn connect(&self) -> Result<SocketReader> {
        let config = &self.inner.config;
        let max_bytes = config.max_message_bytes();
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_bytes))
            .max_frame_size(Some(max_bytes));

        tracing::info!(uri = %config.uri(), "connecting to router");
        let (socket, _) =
            tokio_tungstenite::connect_async_with_config(config.uri(), Some(ws_config), false)
                .await?;
        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));

        {
            let mut link = lock(&self.inner.link);
            link.state = ConnectionState::Connecting;
            link.on_hold = false;
            link.outbound = Some(tx);
        }
        self.inner.events.dispatch(Event::Connect);
        tracing::info!(uri = %config.uri(), "connected to router");
        Ok(stream)
    }

    fn verify(&self) -> Result<()> {
        lock(&self.inner.link).state = ConnectionState::Verifying;
        let frame = MessagePayload::verification(self.local_name(), uuid::Uuid::new_v4().to_string());
        self.send(&frame)?;
        tracing::info!(peer = %self.local_name(), "verification request sent");
        Ok(())
    }

    /// Retry with a fixed delay until the link is back. `None` once closed.
    async fn reconnect(&self) -> Option<SocketReader> {
        let delay = self.inner.config.reconnect_threshold;
        loop {
            if self.is_closing() {
                return None;
            }
            match self.connect_and_verify().await {
                Ok(stream) => return Some(stream),
                Err(error) => {
                    tracing::error!(%error, "while trying to reconnect there has been an error");
                    tracing::debug!(?delay, "failed to reconnect, retrying");
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    fn mark_disconnected(&self) {
        let mut link = lock(&self.inner.link);
        link.state = ConnectionState::Disconnected;
        link.on_hold = false;
        link.outbound = None;
    }

    async fn read_loop(self, mut stream: SocketReader) {
        tracing::info!(peer = %self.local_name(), "listening to messages");
        loop {
            let lost = match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.handle_decoded(MessagePayload::decode(&text));
                    false
                }
                Some(Ok(Message::Binary(bytes))) => {
                    self.handle_decoded(MessagePayload::decode_slice(&bytes));
                    false
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "router closed the connection");
                    true
                }
                Some(Ok(_)) => false,
                Some(Err(error)) => {
                    tracing::warn!(%error, "websocket error");
                    true
                }
                None => true,
            };
            if !lost {
                continue;
            }

            self.mark_disconnected();
            self.inner.events.dispatch(Event::Disconnect);
            tracing::warn!(peer = %self.local_name(), "connection to router lost");

            if !self.inner.config.reconnect || self.is_closing() {
                break;
            }
            match self.reconnect().await {
                Some(next) => stream = next,
                None => break,
            }
        }
        lock(&self.inner.link).running = false;
        tracing::info!(peer = %self.local_name(), "stopped listening");
    }

    fn handle_decoded(&self, decoded: std::result::Result<MessagePayload, ProtocolError>) {
        match decoded {
            Ok(frame) => self.handle_frame(frame),
            Err(error) => tracing::warn!(%error, "discarding invalid frame"),
        }
    }

    fn handle_frame(&self, frame: MessagePayload) {
        tracing::debug!(kind = %frame.kind, from = %frame.id, uuid = ?frame.uuid, "received frame");
        match frame.kind {
            PayloadType::Success => self.on_success(),
            PayloadType::Ping => self.on_ping(frame),
            PayloadType::Request => self.on_request(frame),
            PayloadType::Response => {
                tracing::info!(uuid = ?frame.uuid, "received a response");
                let sender = frame.id.clone();
                self.resolve(frame);
                self.inner.events.dispatch(Event::Response { sender });
            }
            PayloadType::Error => self.on_error(frame),
            PayloadType::Information => {
                if !frame.data.is_null() {
                    tracing::debug!(from = %frame.id, "received information");
                    self.inner.events.dispatch(Event::Information {
                        data: frame.data,
                        sender: frame.id,
                    });
                }
            }
            PayloadType::FunctionCall => self.on_function_call(frame),
            PayloadType::ClientList => self.resolve(frame),
            PayloadType::Verification => {
                tracing::debug!(from = %frame.id, "ignoring verification frame");
            }
        }
    }

    fn on_success(&self) {
        let became_ready = {
            let mut link = lock(&self.inner.link);
            if link.state != ConnectionState::Authorized {
                link.state = ConnectionState::Authorized;
                link.on_hold = false;
                tracing::info!(peer = %self.inner.config.local_name, "authorized successfully");
                true
            } else if link.on_hold {
                link.on_hold = false;
                tracing::info!(peer = %self.inner.config.local_name, "connection reactivated after being on hold");
                true
            } else {
                false
            }
        };
        if became_ready {
            self.inner.events.dispatch(Event::Ready);
        }
    }

    fn on_error(&self, frame: MessagePayload) {
        if frame.message() == Some(ALREADY_AUTHORIZED) {
            let mut link = lock(&self.inner.link);
            if link.state != ConnectionState::Authorized {
                link.on_hold = true;
                tracing::warn!(
                    peer = %self.inner.config.local_name,
                    "another client is already connected, requests are enabled once it disconnects"
                );
                return;
            }
        }

        let message = match &frame.data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        tracing::debug!(error = %message, uuid = ?frame.uuid, "peer failed to fulfill request");
        self.inner.events.dispatch(Event::Error(message));
        if frame.uuid.is_some() {
            self.resolve(frame);
        }
    }

    fn on_ping(&self, frame: MessagePayload) {
        let awaited = frame
            .uuid
            .as_deref()
            .is_some_and(|uuid| self.inner.pending.contains(uuid));
        if awaited {
            self.resolve(frame);
            return;
        }
        tracing::debug!(from = %frame.id, "received a ping");
        let reply = frame.response_reply(self.local_name(), json!({ "success": true }));
        self.send_or_log(&reply);
    }

    fn on_request(&self, frame: MessagePayload) {
        let route = frame.route_name().unwrap_or_default().to_string();
        let Some(handler) = self.inner.routes.get(&route) else {
            tracing::info!(route = %route, from = %frame.id, "failed to fulfill request, route not found");
            let reply = frame.error_reply(
                self.local_name(),
                ROUTE_NOT_FOUND,
                Some(ROUTE_NOT_FOUND.to_string()),
            );
            self.send_or_log(&reply);
            return;
        };

        tracing::info!(route = %route, from = %frame.id, "fulfilling request");
        let request = RouteRequest {
            sender: frame.id.clone(),
            route: route.clone(),
            data: frame.data.clone(),
        };
        self.inner.events.dispatch(Event::Request {
            route,
            sender: frame.id.clone(),
        });
        let work = handler(request);
        tokio::spawn(self.clone().fulfill(frame, work));
    }

    fn on_function_call(&self, frame: MessagePayload) {
        let call = match frame.function_call_data() {
            Ok(call) => call,
            Err(error) => {
                tracing::warn!(%error, from = %frame.id, "malformed function call");
                let reply = frame.error_reply(self.local_name(), error.to_string(), None);
                self.send_or_log(&reply);
                return;
            }
        };

        let Some(method) = self.inner.objects.lookup(&call.object, &call.method) else {
            tracing::debug!(object = %call.object, method = %call.method, "remote object method not available");
            let reply = frame.error_reply(
                self.local_name(),
                OBJECT_EXPIRED,
                Some(OBJECT_EXPIRED.to_string()),
            );
            self.send_or_log(&reply);
            return;
        };

        tracing::debug!(object = %call.object, method = %call.method, "received an object function call");
        let work = method(MethodCall {
            args: call.args,
            kwargs: call.kwargs,
        });
        tokio::spawn(self.clone().fulfill(frame, work));
    }

    /// Run a handler and send its outcome back to the requester.
    async fn fulfill(self, request: MessagePayload, work: HandlerFuture) {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("handler panicked")),
        };
        let reply = self.reply_for(&request, outcome);
        self.send_or_log(&reply);
    }

    fn reply_for(&self, request: &MessagePayload, outcome: anyhow::Result<Reply>) -> MessagePayload {
        let local = self.local_name();
        match outcome {
            Ok(Reply::Value(value)) => request.response_reply(local, value),
            Ok(Reply::Object(object)) => {
                let descriptor = self.inner.objects.register(object);
                match serde_json::to_value(&descriptor) {
                    Ok(data) => {
                        let mut reply = request.response_reply(local, data);
                        reply.pseudo_object = true;
                        reply
                    }
                    Err(error) => request.error_reply(local, error.to_string(), None),
                }
            }
            Err(error) => {
                tracing::error!(uuid = ?request.uuid, ?error, "failed to run the registered handler");
                let message = error.to_string();
                self.inner.events.dispatch(Event::Error(message.clone()));
                request.error_reply(local, message, Some(format!("{error:?}")))
            }
        }
    }

    fn resolve(&self, frame: MessagePayload) {
        match self.inner.pending.resolve(frame) {
            Ok(()) => {}
            Err(RivalError::UnknownCorrelation(uuid)) => {
                tracing::warn!(%uuid, "received a reply but no listener is waiting for it");
            }
            Err(error) => {
                tracing::warn!(%error, "discarding reply");
                self.inner.events.dispatch(Event::Error(error.to_string()));
            }
        }
    }

    fn send_or_log(&self, frame: &MessagePayload) {
        if let Err(error) = self.send(frame) {
            tracing::warn!(%error, kind = %frame.kind, uuid = ?frame.uuid, "failed to send frame");
        }
    }
}

fn remote_error(reply: MessagePayload) -> RivalError {
    let message = match reply.data {
        Value::String(text) => text,
        other => other.to_string(),
    };
    RivalError::RemoteExecution {
        message,
        traceback: reply.traceback,
    }
}

async fn write_loop(mut sink: SocketWriter, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(error) = sink.send(message).await {
            tracing::debug!(%error, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
