//! Terminal front end for a room: stdin lines go out as messages, room
//! messages are printed as `<name> text`.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message as Frame,
        client::IntoClientRequest,
        http::{HeaderValue, header::COOKIE},
    },
};
use tracing::{info, warn};

use crate::{
    cli::ConnectArgs,
    identity::{AUTH_COOKIE, Identity},
    message::{IncomingMessage, Message},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ConnectArgs) -> Result<()> {
    let identity = Identity::new(args.name.trim(), args.avatar_url.clone());
    let mut socket = establish_connection(&args.server, &identity).await?;

    let mut input = BufReader::new(io::stdin()).lines();

    run_client_loop(&mut socket, &mut input).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

/// Opens a WebSocket to `server`, presenting `identity` the way the login
/// flow would: as the `auth` cookie.
pub async fn establish_connection(server: &str, identity: &Identity) -> Result<Socket> {
    let mut request = server
        .into_client_request()
        .with_context(|| format!("invalid room url {server}"))?;
    let cookie = HeaderValue::from_str(&format!("{AUTH_COOKIE}={}", identity.to_assertion()))
        .context("identity does not fit in a cookie header")?;
    request.headers_mut().insert(COOKIE, cookie);

    let (socket, _response) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;

    info!("connected to {server}");
    Ok(socket)
}

/// Pumps room frames to stdout and lines from `input` to the room until
/// either side ends. `next_line` keeps a partially typed line across
/// iterations.
pub async fn run_client_loop<R>(socket: &mut Socket, input: &mut Lines<R>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            frame = socket.next() => {
                if !handle_frame(frame).await? {
                    break;
                }
            }
            line = input.next_line() => {
                if !handle_input_line(line?, socket).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_frame(
    frame: Option<Result<Frame, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Frame::Text(text))) => {
            let message: Message =
                serde_json::from_str(&text).context("room sent a malformed message")?;
            write_stdout(&render(&message)).await?;
            Ok(true)
        }
        Some(Ok(Frame::Close(_))) | None => {
            write_stdout("*** room closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("connection to room failed"),
    }
}

async fn handle_input_line(line: Option<String>, socket: &mut Socket) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let payload = serde_json::to_string(&IncomingMessage {
        message: text.to_string(),
    })?;
    socket.send(Frame::Text(payload)).await?;
    Ok(true)
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close room connection cleanly");
    }
}

pub fn render(message: &Message) -> String {
    format!("<{}> {}", message.name, message.message)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
