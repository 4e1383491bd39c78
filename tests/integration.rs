//! Integration Tests for the Comet gateway
//!
//! These tests run the gateway on a loopback listener and drive it with real
//! WebSocket clients, covering routing, the peer/worker exchange and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use comet::config::Config;
use comet::gateway::Gateway;
use comet::messaging::handler_fn;
use comet::topic::TOPIC_JOIN;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONFIG: &str = r#"
[server]
max_connections = 16

[[service]]
name = "chat"

[[service]]
name = "vault"
queue = "vault-workers"

[[service.tokens]]
token = "s3cret"
identity = "alice"
"#;

struct TestGateway {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    server: JoinHandle<std::io::Result<()>>,
}

impl TestGateway {
    async fn start(config: &str) -> Self {
        let config = Config::parse(config).unwrap();
        let gateway = Arc::new(Gateway::from_config(&config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.serve(listener).await })
        };

        Self {
            gateway,
            addr,
            server,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("ws://{}{}", self.addr, path_and_query)
    }

    async fn connect(&self, path_and_query: &str) -> Client {
        let (client, _) = connect_async(self.url(path_and_query)).await.unwrap();
        client
    }

    async fn reject_status(&self, path_and_query: &str) -> StatusCode {
        match connect_async(self.url(path_and_query)).await {
            Err(WsError::Http(response)) => response.status(),
            Err(e) => panic!("expected HTTP rejection, got {}", e),
            Ok(_) => panic!("upgrade to {} unexpectedly succeeded", path_and_query),
        }
    }
}

/// Next data frame, skipping control frames
async fn next_data(client: &mut Client) -> Vec<u8> {
    timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(Message::Text(text))) => return text.into_bytes(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    })
    .await
    .expect("no data frame received")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_peer_worker_round_trip() {
    let tg = TestGateway::start(CONFIG).await;

    let mut worker = tg.connect("/service/conn?service=chat").await;
    eventually(|| tg.gateway.worker_count() == 1).await;

    let mut peer = tg.connect("/client/conn?service=chat&client_id=c1").await;
    eventually(|| tg.gateway.peer_count() == 1).await;

    peer.send(Message::Binary(b"hello".to_vec())).await.unwrap();
    assert_eq!(next_data(&mut worker).await, b"hello");

    // Text frames are relayed as data too
    peer.send(Message::Text("ping?".into())).await.unwrap();
    assert_eq!(next_data(&mut worker).await, b"ping?");

    worker.send(Message::Binary(b"reply".to_vec())).await.unwrap();
    assert_eq!(next_data(&mut peer).await, b"reply");
}

#[tokio::test]
async fn test_worker_broadcast_to_peers() {
    let tg = TestGateway::start(CONFIG).await;

    let mut alice = tg.connect("/client/conn?service=chat&client_id=alice").await;
    let mut bob = tg.connect("/client/conn?service=chat&client_id=bob").await;
    let mut worker = tg.connect("/service/conn?service=chat").await;
    eventually(|| tg.gateway.peer_count() == 2 && tg.gateway.worker_count() == 1).await;

    worker.send(Message::Binary(b"news".to_vec())).await.unwrap();
    assert_eq!(next_data(&mut alice).await, b"news");
    assert_eq!(next_data(&mut bob).await, b"news");
}

#[tokio::test]
async fn test_join_event() {
    let tg = TestGateway::start(CONFIG).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    tg.gateway
        .dispatcher()
        .subscribe(
            TOPIC_JOIN,
            handler_fn(move |_topic, message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    Ok(())
                }
            }),
        )
        .unwrap();

    let _peer = tg
        .connect("/client/conn?service=vault&client_id=dev-9&service_token=s3cret")
        .await;

    let message = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
    assert_eq!(json["client_id"], "dev-9");
    assert_eq!(json["identity"], "alice");
    assert_eq!(json["ip"], "127.0.0.1");
}

#[tokio::test]
async fn test_bad_token_closes_peer() {
    let tg = TestGateway::start(CONFIG).await;

    let mut peer = tg
        .connect("/client/conn?service=vault&service_token=wrong")
        .await;

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match peer.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "peer with a bad token was not closed");
    assert_eq!(tg.gateway.peer_count(), 0);
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let tg = TestGateway::start(CONFIG).await;

    assert_eq!(tg.reject_status("/nowhere").await, StatusCode::NOT_FOUND);
    assert_eq!(
        tg.reject_status("/client/conn?service=missing").await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        tg.reject_status("/service/conn?service=missing").await,
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        tg.reject_status("/client/conn").await,
        StatusCode::BAD_REQUEST
    );

    assert_eq!(tg.gateway.peer_count(), 0);
    assert_eq!(tg.gateway.worker_count(), 0);
}

#[tokio::test]
async fn test_disconnect_detaches() {
    let tg = TestGateway::start(CONFIG).await;

    let mut peer = tg.connect("/client/conn?service=chat").await;
    let mut worker = tg.connect("/service/conn?service=chat").await;
    eventually(|| tg.gateway.peer_count() == 1 && tg.gateway.worker_count() == 1).await;

    peer.close(None).await.unwrap();
    worker.close(None).await.unwrap();

    eventually(|| tg.gateway.peer_count() == 0 && tg.gateway.worker_count() == 0).await;
    eventually(|| tg.gateway.dispatcher().subscription_count() == 0).await;
    eventually(|| tg.gateway.connection_count() == 0).await;
}

#[tokio::test]
async fn test_connection_limit() {
    let tg = TestGateway::start(
        r#"
[server]
max_connections = 1

[[service]]
name = "chat"
"#,
    )
    .await;

    let _first = tg.connect("/client/conn?service=chat").await;
    eventually(|| tg.gateway.peer_count() == 1).await;

    let second = timeout(
        Duration::from_secs(2),
        connect_async(tg.url("/client/conn?service=chat")),
    )
    .await
    .expect("rejected connection was left hanging");
    assert!(second.is_err());
    assert_eq!(tg.gateway.peer_count(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let tg = TestGateway::start(CONFIG).await;

    let mut peer = tg.connect("/client/conn?service=chat").await;
    let mut worker = tg.connect("/service/conn?service=chat").await;
    eventually(|| tg.gateway.peer_count() == 1 && tg.gateway.worker_count() == 1).await;

    tg.gateway.shutdown();

    let served = timeout(Duration::from_secs(2), tg.server).await.unwrap();
    assert!(served.unwrap().is_ok());

    for client in [&mut peer, &mut worker] {
        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection survived shutdown");
    }

    eventually(|| tg.gateway.peer_count() == 0 && tg.gateway.worker_count() == 0).await;
}
