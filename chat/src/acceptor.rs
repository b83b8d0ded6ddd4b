use std::{future, sync::Arc};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message as Frame, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    client::{ClientConfig, ConnectionError, serve_connection},
    hub::HubHandle,
    identity::{Identity, identity_from_headers},
    message::{IncomingMessage, Message},
};

/// Path the room's WebSocket endpoint is served on.
pub const ROOM_PATH: &str = "/room";

#[derive(Clone)]
struct RoomState {
    hub: HubHandle,
    client_config: ClientConfig,
}

/// Builds the HTTP router that upgrades room connections and hands them to `hub`.
pub fn router(hub: HubHandle, client_config: ClientConfig) -> Router {
    Router::new()
        .route(ROOM_PATH, get(join_room))
        .layer(TraceLayer::new_for_http())
        .with_state(RoomState { hub, client_config })
}

async fn join_room(
    State(state): State<RoomState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match identity_from_headers(&headers) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(error = %err, "rejecting room request without a valid identity");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(name = %identity.name, error = %rejection, "websocket upgrade rejected");
            return rejection.into_response();
        }
    };

    upgrade
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| accept(socket, identity, state))
}

async fn accept(socket: WebSocket, identity: Identity, state: RoomState) {
    let name = identity.name.clone();
    info!(%name, "websocket connection accepted");

    let (sink, stream) = socket.split();
    let source = stream.filter_map(|frame| future::ready(decode_frame(frame)));
    let sink = sink
        .sink_map_err(ConnectionError::transport)
        .with(|message: Arc<Message>| future::ready(encode_frame(&message)));

    match serve_connection(&state.hub, identity, source, sink, state.client_config).await {
        Ok(()) => info!(%name, "websocket connection closed"),
        Err(err) => debug!(%name, error = %err, "websocket connection dropped"),
    }
}

/// Maps one WebSocket frame to an inbound message. Control frames carry no
/// message and are skipped.
fn decode_frame(
    frame: Result<Frame, axum::Error>,
) -> Option<Result<IncomingMessage, ConnectionError>> {
    match frame {
        Ok(Frame::Text(text)) => Some(serde_json::from_str(&text).map_err(ConnectionError::from)),
        Ok(Frame::Binary(bytes)) => {
            Some(serde_json::from_slice(&bytes).map_err(ConnectionError::from))
        }
        Ok(Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_)) => None,
        Err(err) => Some(Err(ConnectionError::transport(err))),
    }
}

fn encode_frame(message: &Message) -> Result<Frame, ConnectionError> {
    Ok(Frame::Text(serde_json::to_string(message)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_binary_frames_decode() {
        let text = decode_frame(Ok(Frame::Text(r#"{"message":"hi"}"#.into())));
        assert!(matches!(text, Some(Ok(IncomingMessage { ref message })) if message == "hi"));

        let binary = decode_frame(Ok(Frame::Binary(br#"{"message":"yo"}"#.to_vec())));
        assert!(matches!(binary, Some(Ok(IncomingMessage { ref message })) if message == "yo"));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(decode_frame(Ok(Frame::Ping(vec![1]))).is_none());
        assert!(decode_frame(Ok(Frame::Pong(Vec::new()))).is_none());
        assert!(decode_frame(Ok(Frame::Close(None))).is_none());
    }

    #[test]
    fn garbage_frame_is_a_decode_error() {
        let frame = decode_frame(Ok(Frame::Text("hello?".into())));
        assert!(matches!(frame, Some(Err(ConnectionError::Decode(_)))));
    }

    #[test]
    fn outbound_messages_are_json_text() {
        let message = Message::stamped(&Identity::new("alice", None), "hi".into());
        let Frame::Text(text) = encode_frame(&message).expect("encode") else {
            panic!("expected a text frame");
        };
        let parsed: Message = serde_json::from_str(&text).expect("json");
        assert_eq!(parsed, message);
    }
}
