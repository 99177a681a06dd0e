//! Live relay connections over WebSocket
//!
//! `GET /ws/:user_id` upgrades the request and hands the socket to the
//! relay. `user_id` must be an integer; it is the same id that appears in
//! message bodies. Each text frame is one JSON message
//! `{"sender_id":1,"recipient_id":2,"text":"hi"}`; messages addressed to
//! this user arrive in the same form. Pings and pongs count as activity
//! for the idle timeout.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::PathRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parley_relay::{Frame, FrameSink, FrameSource, RelayError, UserId};
use tracing::{debug, info, info_span, warn, Instrument};

use super::ApiError;
use crate::server::AppState;

/// Create the WebSocket router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:user_id", get(websocket_handler))
        .with_state(state)
}

/// GET /ws/:user_id
///
/// Registers the connection once the upgrade completes. A non-integer
/// user id or a failed upgrade is reported to the caller and nothing is
/// registered.
async fn websocket_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    user_id: Result<Path<i64>, PathRejection>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = match user_id {
        Ok(Path(user_id)) => user_id,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(user_id = %user_id, error = %rejection, "WebSocket upgrade rejected");
            return rejection.into_response();
        }
    };

    info!(user_id = %user_id, "WebSocket connection request");
    let relay = state.relay.clone();

    ws.on_failed_upgrade(move |e| {
        warn!(user_id = %user_id, error = %e, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| {
        let user_id = UserId::from(user_id);
        let span = info_span!("relay.connection", user_id = %user_id);
        async move {
            let (sink, stream) = socket.split();
            let task = relay.connect(user_id, WsSource::new(stream), WsSink::new(sink));
            debug!(connection = %task.connection().id(), "WebSocket connection registered");
            task.run().await;
        }
        .instrument(span)
    })
}

/// Read half of an upgraded WebSocket.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

impl WsSource {
    pub fn new(stream: SplitStream<WebSocket>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, RelayError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Text(text))),
            Some(Ok(Message::Binary(data))) => String::from_utf8(data)
                .map(|text| Some(Frame::Text(text)))
                .map_err(|e| RelayError::decode(format!("binary frame is not UTF-8: {}", e))),
            // Pings are answered by the socket itself
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Ok(Some(Frame::Heartbeat)),
            Some(Ok(Message::Close(_))) | None => Ok(None),
            Some(Err(e)) => Err(RelayError::transport(e.to_string())),
        }
    }
}

/// Write half of an upgraded WebSocket.
pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), RelayError> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| RelayError::transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), RelayError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| RelayError::transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.sink
            .close()
            .await
            .map_err(|e| RelayError::transport(e.to_string()))
    }
}
