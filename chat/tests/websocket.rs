//! Room behaviour over real WebSocket connections.

use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use axum::{
    body::Body,
    http::{Request, StatusCode, header::COOKIE},
};
use chat::{
    acceptor::{self, ROOM_PATH},
    client::ClientConfig,
    console::{establish_connection, run_client_loop},
    hub::{Hub, HubConfig, HubHandle},
    identity::{AUTH_COOKIE, Identity},
    message::Message,
    server::Server,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message as Frame},
};
use tower::ServiceExt;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct RunningServer {
    addr: SocketAddr,
    hub: HubHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(
            listener,
            HubConfig::default(),
            ClientConfig::default(),
            tracer::off(),
        );
        let addr = server.local_addr()?;
        let hub = server.hub();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            hub,
            shutdown,
            task,
        })
    }

    fn url(&self) -> String {
        format!("ws://{}{ROOM_PATH}", self.addr)
    }

    async fn join(&self, name: &str) -> Result<Socket> {
        establish_connection(&self.url(), &Identity::new(name, None)).await
    }

    async fn wait_for_members(&self, count: usize) -> Result<()> {
        timeout(READ_TIMEOUT, async {
            loop {
                if self.hub.roster().await?.len() == count {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn send_text(socket: &mut Socket, payload: &str) -> Result<()> {
    socket.send(Frame::Text(payload.to_string())).await?;
    Ok(())
}

async fn read_chat(socket: &mut Socket, description: &str) -> Result<Message> {
    loop {
        let frame = timeout(READ_TIMEOUT, socket.next())
            .await
            .map_err(|_| anyhow!("{description}: timed out"))?
            .ok_or_else(|| anyhow!("{description}: connection closed"))??;

        match frame {
            Frame::Text(text) => return Ok(serde_json::from_str(&text)?),
            Frame::Close(_) => return Err(anyhow!("{description}: room closed the socket")),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn messages_are_stamped_with_the_connection_identity() -> Result<()> {
    let server = RunningServer::start().await?;

    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    server.wait_for_members(2).await?;

    // The payload's own name is ignored in favour of the cookie identity.
    send_text(&mut alice, r#"{"message":"hi bob","name":"mallory"}"#).await?;

    let heard = read_chat(&mut bob, "bob waiting for alice").await?;
    assert_eq!(heard.name, "alice");
    assert_eq!(heard.message, "hi bob");

    let echo = read_chat(&mut alice, "alice waiting for her echo").await?;
    assert_eq!(echo, heard);

    alice.close(None).await?;
    bob.close(None).await?;
    server.wait_for_members(0).await?;
    server.stop().await;

    Ok(())
}

#[tokio::test]
async fn malformed_frame_disconnects_only_the_sender() -> Result<()> {
    let server = RunningServer::start().await?;

    let mut alice = server.join("alice").await?;
    let mut bob = server.join("bob").await?;
    server.wait_for_members(2).await?;

    send_text(&mut bob, "this is not json").await?;
    server.wait_for_members(1).await?;

    send_text(&mut alice, r#"{"message":"anyone?"}"#).await?;
    let echo = read_chat(&mut alice, "alice waiting for her echo").await?;
    assert_eq!(echo.message, "anyone?");

    // Bob's socket was closed by the room rather than fed further messages.
    let bob_next = read_chat(&mut bob, "bob after disconnect").await;
    assert!(bob_next.is_err());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn connection_without_identity_is_refused() -> Result<()> {
    let server = RunningServer::start().await?;

    let result = connect_async(server.url()).await;
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        Err(other) => return Err(anyhow!("unexpected handshake error: {other}")),
        Ok(_) => return Err(anyhow!("room accepted an anonymous connection")),
    }

    assert!(server.hub.roster().await?.is_empty());
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn plain_http_request_is_rejected_without_touching_the_room() -> Result<()> {
    let (hub, handle) = Hub::new(HubConfig::default(), tracer::off());
    tokio::spawn(hub.run());
    let app = acceptor::router(handle.clone(), ClientConfig::default());

    let cookie = format!("{AUTH_COOKIE}={}", Identity::new("alice", None).to_assertion());
    let request = Request::builder()
        .uri(ROOM_PATH)
        .header(COOKIE, cookie)
        .body(Body::empty())?;

    let response = app.oneshot(request).await?;
    assert!(response.status().is_client_error());
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(handle.roster().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn garbled_identity_is_unauthorized() -> Result<()> {
    let (hub, handle) = Hub::new(HubConfig::default(), tracer::off());
    tokio::spawn(hub.run());
    let app = acceptor::router(handle.clone(), ClientConfig::default());

    let request = Request::builder()
        .uri(ROOM_PATH)
        .header(COOKIE, format!("{AUTH_COOKIE}=!!!"))
        .body(Body::empty())?;

    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(handle.roster().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn console_keeps_a_half_typed_line_across_room_traffic() -> Result<()> {
    let server = RunningServer::start().await?;
    let mut bob = server.join("bob").await?;
    let mut alice = server.join("alice").await?;
    server.wait_for_members(2).await?;

    let (mut keyboard, terminal) = tokio::io::duplex(64);
    let console = tokio::spawn(async move {
        let mut lines = BufReader::new(terminal).lines();
        run_client_loop(&mut alice, &mut lines).await
    });

    keyboard.write_all(b"hel").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A room message reaches the console while Alice is mid-line.
    send_text(&mut bob, r#"{"message":"interrupting"}"#).await?;
    let echo = read_chat(&mut bob, "bob waiting for his echo").await?;
    assert_eq!(echo.message, "interrupting");
    tokio::time::sleep(Duration::from_millis(20)).await;

    keyboard.write_all(b"lo\n").await?;
    let heard = read_chat(&mut bob, "bob waiting for alice").await?;
    assert_eq!(heard.name, "alice");
    assert_eq!(heard.message, "hello");

    // End of input ends the console.
    drop(keyboard);
    timeout(READ_TIMEOUT, console).await???;

    server.stop().await;
    Ok(())
}
