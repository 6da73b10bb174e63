//! Accept loop and per-socket sessions.

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::registry::{Admission, Peer, Registry, Role};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rival_core::{
    ALREADY_AUTHORIZED, DESTINATION_NOT_CONNECTED, DESTINATION_NOT_FOUND, MessagePayload,
    NOT_VERIFIED, PayloadType, ROUTER_ID,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

type SharedRegistry = Arc<RwLock<Registry>>;
type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A bound router, ready to accept peers.
pub struct Router {
    listener: TcpListener,
    config: RouterConfig,
    registry: SharedRegistry,
}

impl Router {
    pub async fn bind(config: RouterConfig) -> Result<Self, RouterError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        Ok(Self {
            listener,
            config,
            registry: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RouterError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Accept sockets until the listener fails.
    pub async fn serve(self) -> Result<(), RouterError> {
        let max_bytes = self.config.max_message_bytes();
        tracing::info!("Listening on ws://{}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, max_bytes).await {
                    tracing::warn!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Bind and serve.
pub async fn run(config: RouterConfig) -> Result<(), RouterError> {
    Router::bind(config).await?.serve().await
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: SharedRegistry,
    max_bytes: usize,
) -> Result<(), RouterError> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(max_bytes))
        .max_frame_size(Some(max_bytes));
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
    let (mut sink, mut stream) = ws.split();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let peer = Peer::new(addr, tx);
    registry.write().await.insert_pending(peer.clone());

    tracing::debug!("New connection from {}", addr);

    let outcome = loop {
        tokio::select! {
            inbound = stream.next() => {
                let decoded = match inbound {
                    Some(Ok(Message::Text(text))) => MessagePayload::decode(&text),
                    Some(Ok(Message::Binary(bytes))) => MessagePayload::decode_slice(&bytes),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.into()),
                };
                match decoded {
                    Ok(frame) => handle_frame(&registry, &peer, frame).await,
                    Err(e) => tracing::warn!("Invalid message from {}: {}", addr, e),
                }
            }

            next = outbound.recv() => match next {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut sink, &frame).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            }
        }
    };

    let promoted = registry.write().await.disconnect(addr);
    if let Some((id, held)) = promoted {
        tracing::info!("{} disconnected, promoting held connection from {}", id, held.addr);
        held.send(MessagePayload::success(ROUTER_ID));
    }

    tracing::debug!("Connection closed: {}", addr);
    outcome
}

async fn write_frame(sink: &mut Sink, frame: &MessagePayload) -> Result<(), RouterError> {
    let text = frame.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn handle_frame(registry: &SharedRegistry, peer: &Peer, frame: MessagePayload) {
    let role = registry.read().await.role(peer.addr);
    match (role, frame.kind) {
        (Some(Role::Pending), PayloadType::Verification) => verify(registry, peer, frame).await,
        (Some(Role::Active(id)), PayloadType::Verification) => {
            tracing::debug!("{} verified again", id);
            peer.send(success_for(&frame));
        }
        (Some(Role::Active(id)), _) => route(registry, peer, id, frame).await,
        (Some(Role::Held(id)), kind) => {
            tracing::warn!("Ignoring {} frame from held connection {} ({})", kind, id, peer.addr);
        }
        (Some(Role::Pending) | None, kind) => {
            tracing::warn!("Rejecting {} frame from unverified connection {}", kind, peer.addr);
            peer.send(frame.error_reply(ROUTER_ID, NOT_VERIFIED, None));
        }
    }
}

async fn verify(registry: &SharedRegistry, peer: &Peer, frame: MessagePayload) {
    if frame.id.is_empty() {
        peer.send(frame.error_reply(ROUTER_ID, NOT_VERIFIED, None));
        return;
    }

    let admission = registry.write().await.verify(peer.addr, &frame.id);
    match admission {
        Some(Admission::Admitted) => {
            tracing::info!("{} verified from {}", frame.id, peer.addr);
            peer.send(success_for(&frame));
        }
        Some(Admission::OnHold { position }) => {
            tracing::warn!(
                "{} is already connected, holding {} ({} in line)",
                frame.id,
                peer.addr,
                position
            );
            peer.send(frame.error_reply(ROUTER_ID, ALREADY_AUTHORIZED, None));
        }
        None => tracing::debug!("{} is no longer pending", peer.addr),
    }
}

async fn route(registry: &SharedRegistry, peer: &Peer, sender: String, mut frame: MessagePayload) {
    frame.id = sender;
    let registry = registry.read().await;

    match frame.kind {
        PayloadType::Ping => {
            let success = frame
                .destination
                .as_deref()
                .is_none_or(|destination| registry.is_active(destination));
            peer.send(frame.response_reply(ROUTER_ID, json!({ "success": success })));
        }
        PayloadType::ClientList => {
            peer.send(frame.response_reply(ROUTER_ID, json!(registry.client_list())));
        }
        PayloadType::Request
        | PayloadType::Response
        | PayloadType::Error
        | PayloadType::FunctionCall => {
            let Some(destination) = frame.destination.as_deref() else {
                peer.send(frame.error_reply(ROUTER_ID, DESTINATION_NOT_FOUND, None));
                return;
            };
            match registry.active(destination) {
                Some(target) => {
                    tracing::debug!("{} {} -> {}", frame.kind, frame.id, destination);
                    if !target.send(frame.clone()) {
                        peer.send(frame.error_reply(ROUTER_ID, DESTINATION_NOT_CONNECTED, None));
                    }
                }
                None => {
                    tracing::debug!("{} from {} to unknown {}", frame.kind, frame.id, destination);
                    peer.send(frame.error_reply(ROUTER_ID, DESTINATION_NOT_CONNECTED, None));
                }
            }
        }
        PayloadType::Information => {
            let targets = registry.information_targets(&frame.id, frame.destinations());
            tracing::debug!("information from {} to {} peers", frame.id, targets.len());
            for (_, target) in targets {
                target.send(frame.clone());
            }
        }
        PayloadType::Success | PayloadType::Verification => {
            tracing::debug!("Ignoring {} frame from {}", frame.kind, frame.id);
        }
    }
}

/// `success` echoing the correlation id of `frame`.
fn success_for(frame: &MessagePayload) -> MessagePayload {
    let mut success = MessagePayload::success(ROUTER_ID);
    success.uuid = frame.uuid.clone();
    success
}
