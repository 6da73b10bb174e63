use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rival_client::{
    Connection, ConnectionBuilder, Destinations, EventHandler, EventKind, Reply, RemoteObject,
    RivalError, RouteRequest,
};
use rival_core::{MessagePayload, PayloadType};
use rival_router::{Router, RouterConfig};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_router() -> u16 {
    let router = Router::bind(RouterConfig {
        port: 0,
        ..RouterConfig::default()
    })
    .await
    .unwrap();
    let port = router.local_addr().unwrap().port();
    tokio::spawn(router.serve());
    port
}

async fn ready(builder: ConnectionBuilder, port: u16) -> Connection {
    let connection = builder.port(port).reconnect(false).build().unwrap();
    connection.start().await.unwrap();
    tokio::time::timeout(WAIT, connection.wait_until_ready())
        .await
        .unwrap()
        .unwrap();
    connection
}

fn echo_server() -> ConnectionBuilder {
    Connection::builder("shard-1").route("echo", |request: RouteRequest| async move {
        Ok(Reply::from(request.arg("value").cloned().unwrap_or(Value::Null)))
    })
}

#[tokio::test]
async fn request_reaches_registered_route() {
    let port = spawn_router().await;
    let _server = ready(echo_server(), port).await;
    let client = ready(Connection::builder("shard-2"), port).await;

    let response = client
        .request("echo", "shard-1", json!({"value": 42}))
        .await
        .unwrap();
    assert_eq!(response.into_value(), json!(42));
}

#[tokio::test]
async fn remote_failures_reach_the_caller() {
    let port = spawn_router().await;
    let _server = ready(echo_server(), port).await;
    let client = ready(Connection::builder("shard-2"), port).await;

    match client.request("missing", "shard-1", json!({})).await {
        Err(RivalError::RemoteExecution { message, .. }) => {
            assert_eq!(message, rival_core::ROUTE_NOT_FOUND)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    match client.request("echo", "ghost", json!({})).await {
        Err(RivalError::RemoteExecution { message, .. }) => {
            assert_eq!(message, rival_core::DESTINATION_NOT_CONNECTED)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn ping_and_client_list() {
    let port = spawn_router().await;
    let _server = ready(echo_server(), port).await;
    let client = ready(Connection::builder("shard-2"), port).await;

    assert!(client.ping(None, WAIT).await.unwrap());
    assert!(client.ping(Some("shard-1"), WAIT).await.unwrap());
    assert!(!client.ping(Some("ghost"), WAIT).await.unwrap());
    assert_eq!(client.get_clients(WAIT).await.unwrap(), vec!["shard-1", "shard-2"]);
}

#[tokio::test]
async fn duplicate_identifier_waits_for_the_holder() {
    let port = spawn_router().await;
    let first = ready(Connection::builder("dup"), port).await;

    let second = Connection::builder("dup").port(port).reconnect(false).build().unwrap();
    second.start().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while !second.on_hold() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!second.authorized());
    assert!(matches!(second.get_clients(WAIT).await, Err(RivalError::NotReady)));
    assert_eq!(first.get_clients(WAIT).await.unwrap(), vec!["dup"]);

    let promoted = second.wait_for(EventKind::Ready, Some(WAIT));
    let gone = first.wait_for(EventKind::Disconnect, Some(WAIT));
    first.close();
    gone.await.unwrap();
    promoted.await.unwrap();

    assert!(second.authorized());
    assert!(!second.on_hold());
    assert_eq!(second.get_clients(WAIT).await.unwrap(), vec!["dup"]);
}

async fn held(name: &str, port: u16) -> Connection {
    let connection = Connection::builder(name).port(port).reconnect(false).build().unwrap();
    connection.start().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while !connection.on_hold() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    connection
}

#[tokio::test]
async fn held_duplicates_take_over_in_arrival_order() {
    let port = spawn_router().await;
    let first = ready(Connection::builder("dup"), port).await;
    let second = held("dup", port).await;
    let third = held("dup", port).await;

    assert!(first.authorized());
    assert!(second.on_hold());

    let promoted = second.wait_for(EventKind::Ready, Some(WAIT));
    first.close();
    promoted.await.unwrap();
    assert!(second.authorized());
    assert!(third.on_hold());
    assert_eq!(second.get_clients(WAIT).await.unwrap(), vec!["dup"]);

    let promoted = third.wait_for(EventKind::Ready, Some(WAIT));
    second.close();
    promoted.await.unwrap();
    assert!(third.authorized());
    assert!(!third.on_hold());
}

struct Inbox(mpsc::UnboundedSender<(Value, String)>);

#[async_trait]
impl EventHandler for Inbox {
    async fn on_information(&self, data: Value, sender: &str) -> anyhow::Result<()> {
        let _ = self.0.send((data, sender.to_string()));
        Ok(())
    }
}

async fn listener(name: &str, port: u16) -> (Connection, mpsc::UnboundedReceiver<(Value, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = ready(Connection::builder(name).event_handler(Inbox(tx)), port).await;
    (connection, rx)
}

async fn nothing_more(rx: &mut mpsc::UnboundedReceiver<(Value, String)>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn information_reaches_exactly_the_addressed_peers() {
    let port = spawn_router().await;
    let (a, mut a_rx) = listener("a", port).await;
    let (_b, mut b_rx) = listener("b", port).await;
    let (_c, mut c_rx) = listener("c", port).await;

    a.inform(json!({"guilds": 10}), "b").unwrap();
    assert_eq!(b_rx.recv().await.unwrap(), (json!({"guilds": 10}), "a".to_string()));
    nothing_more(&mut c_rx).await;

    a.inform(json!("all"), Destinations::All).unwrap();
    assert_eq!(b_rx.recv().await.unwrap(), (json!("all"), "a".to_string()));
    assert_eq!(c_rx.recv().await.unwrap(), (json!("all"), "a".to_string()));
    nothing_more(&mut a_rx).await;
    nothing_more(&mut b_rx).await;
    nothing_more(&mut c_rx).await;
}

#[tokio::test]
async fn late_reply_after_timeout_is_dropped() {
    let port = spawn_router().await;
    let server = echo_server().route("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Reply::value("late"))
    });
    let _server = ready(server, port).await;
    let client = ready(Connection::builder("shard-2"), port).await;

    let outcome = client
        .request_with_timeout("slow", "shard-1", json!({}), Duration::from_millis(50))
        .await;
    assert!(matches!(outcome, Err(RivalError::Timeout(_))));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = client
        .request("echo", "shard-1", json!({"value": "still fine"}))
        .await
        .unwrap();
    assert_eq!(response.into_value(), json!("still fine"));
}

#[tokio::test]
async fn remote_object_expires_after_its_lifetime() {
    let port = spawn_router().await;
    let server = Connection::builder("shard-1").route("guild", |_| async {
        Ok(Reply::from(
            RemoteObject::new(json!({"id": 7}))
                .method("member_count", |_| async { Ok(Reply::value(120)) })
                .expires_after(Duration::from_millis(400)),
        ))
    });
    let _server = ready(server, port).await;
    let client = ready(Connection::builder("shard-2"), port).await;

    let guild = client
        .request("guild", "shard-1", json!({}))
        .await
        .unwrap()
        .into_object()
        .unwrap();
    assert_eq!(guild.attributes(), &json!({"id": 7}));

    let count = guild.call("member_count", Vec::new(), Map::new()).await.unwrap();
    assert_eq!(count.into_value(), json!(120));

    tokio::time::sleep(Duration::from_millis(600)).await;
    match guild.call("member_count", Vec::new(), Map::new()).await {
        Err(RivalError::RemoteExecution { message, .. }) => {
            assert_eq!(message, rival_core::OBJECT_EXPIRED)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn unverified_socket_is_refused() {
    let port = spawn_router().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    let ping = MessagePayload::ping("sneaky", None, "u-1");
    socket
        .send(Message::Text(ping.encode().unwrap().into()))
        .await
        .unwrap();

    let reply = match tokio::time::timeout(WAIT, socket.next()).await.unwrap() {
        Some(Ok(Message::Text(text))) => MessagePayload::decode(&text).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(reply.kind, PayloadType::Error);
    assert_eq!(reply.message(), Some(rival_core::NOT_VERIFIED));
    assert_eq!(reply.uuid.as_deref(), Some("u-1"));
}

#[tokio::test]
async fn router_stamps_the_verified_sender() {
    let port = spawn_router().await;
    let (_b, mut b_rx) = listener("b", port).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let verification = MessagePayload::verification("raw", "v-1");
    socket
        .send(Message::Text(verification.encode().unwrap().into()))
        .await
        .unwrap();
    match tokio::time::timeout(WAIT, socket.next()).await.unwrap() {
        Some(Ok(Message::Text(text))) => {
            assert_eq!(MessagePayload::decode(&text).unwrap().kind, PayloadType::Success)
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let spoofed = MessagePayload::information("someone-else", Some(vec!["b".into()]), json!(1));
    socket
        .send(Message::Text(spoofed.encode().unwrap().into()))
        .await
        .unwrap();
    assert_eq!(b_rx.recv().await.unwrap(), (json!(1), "raw".to_string()));
}
