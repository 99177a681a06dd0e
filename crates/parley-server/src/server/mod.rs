use crate::accounts::AccountService;
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use parley_relay::Relay;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, warn, Level};

mod routes;

/// How often closed connections that were never unregistered are swept.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Server application state
pub struct AppState {
    /// Account and message operations
    pub accounts: AccountService,
    /// Live connection relay
    pub relay: Relay,
}

impl AppState {
    pub fn new(accounts: AccountService, relay: Relay) -> Self {
        Self { accounts, relay }
    }
}

/// Start the HTTP server and run until ctrl-c.
pub async fn start(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let relay = state.relay.clone();
    let janitor = tokio::spawn(sweep_stale_connections(relay.clone()));

    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(relay))
        .await?;

    janitor.abort();
    info!("HTTP server stopped");
    Ok(())
}

/// Wait for ctrl-c, then close every live connection.
async fn shutdown_signal(relay: Relay) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
    relay.shutdown();
}

async fn sweep_stale_connections(relay: Relay) {
    let shutdown = relay.shutdown_token();
    let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = relay.registry().cleanup_stale();
                debug!(
                    removed,
                    live = relay.registry().connection_count(),
                    "Swept stale connections"
                );
            }
        }
    }
}

/// Create the Axum router with all routes and middleware
fn create_router(state: Arc<AppState>) -> Router {
    let users_router = routes::users::router(state.clone());
    let messages_router = routes::messages::router(state.clone());
    let websocket_router = routes::websocket::router(state.clone());

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .merge(users_router)
        .merge(messages_router)
        .merge(websocket_router)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.relay.registry().connection_count();

    if state.accounts.store_healthy().await {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "parley-server",
                "version": env!("CARGO_PKG_VERSION"),
                "connections": connections
            })),
        )
    } else {
        warn!("Health check: database unhealthy");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "service": "parley-server",
                "version": env!("CARGO_PKG_VERSION"),
                "connections": connections,
                "error": "database unhealthy"
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySessionCache;
    use crate::db::{Database, LibSqlStore, MigrationRunner};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use http_body_util::BodyExt;
    use parley_relay::{ConnectionRegistry, Message, RelayConfig, UserId};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    async fn create_test_state() -> Arc<AppState> {
        let db = Database::in_memory("test").await.unwrap();
        MigrationRunner::schema().run(&db).await.unwrap();

        let store = Arc::new(LibSqlStore::new(Arc::new(db)));
        let cache = Arc::new(MemorySessionCache::new(128, 16));
        let accounts = AccountService::new(store.clone(), cache.clone(), Duration::from_secs(3600));
        let relay = Relay::new(
            Arc::new(ConnectionRegistry::new()),
            store,
            cache,
            RelayConfig::default(),
        );

        Arc::new(AppState::new(accounts, relay))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_router(create_test_state().await);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "parley-server");
        assert_eq!(json["connections"], 0);
    }

    #[tokio::test]
    async fn test_create_user_omits_password() {
        let app = create_router(create_test_state().await);

        let response = app
            .oneshot(json_request(
                "POST",
                "/users",
                json!({"username": "alice", "email": "alice@example.com", "password": "hunter22"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert!(json["id"].as_i64().unwrap() > 0);
        assert_eq!(json["username"], "alice");
        assert_eq!(json["email"], "alice@example.com");
        assert!(json.get("password").is_none());
        assert!(json.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_user_conflicts() {
        let app = create_router(create_test_state().await);
        let body = json!({"username": "bob", "email": "bob@example.com", "password": "pw"});

        let first = app
            .clone()
            .oneshot(json_request("POST", "/users", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app.oneshot(json_request("POST", "/users", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(second).await["error"], "conflict");
    }

    #[tokio::test]
    async fn test_create_user_rejects_bad_input() {
        let app = create_router(create_test_state().await);

        let malformed = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(malformed).await["error"], "invalid_input");

        let invalid = app
            .oneshot(json_request(
                "POST",
                "/users",
                json!({"username": "carol", "email": "nope", "password": "pw"}),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_user_round_trip() {
        let app = create_router(create_test_state().await);

        let created = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/users",
                json!({"username": "dave", "email": "dave@example.com", "password": "pw"}),
            ))
            .await
            .unwrap();
        let id = body_json(created).await["id"].as_i64().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/users/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], id);
        assert_eq!(json["username"], "dave");
    }

    #[tokio::test]
    async fn test_get_user_errors() {
        let app = create_router(create_test_state().await);

        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/users/999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(missing).await["error"], "not_found");

        let not_a_number = app
            .oneshot(Request::builder().uri("/users/abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(not_a_number.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_message_is_created_for_offline_recipient() {
        let app = create_router(create_test_state().await);

        let response = app
            .oneshot(json_request(
                "POST",
                "/messages",
                json!({"sender_id": 1, "recipient_id": 2, "text": "hello"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert!(json["id"].as_i64().unwrap() > 0);
        assert_eq!(json["text"], "hello");
    }

    #[tokio::test]
    async fn test_post_message_rejects_malformed_body() {
        let app = create_router(create_test_state().await);

        let response = app
            .oneshot(json_request("POST", "/messages", json!({"text": "no ids"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_plain_get_on_websocket_route_is_rejected() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        let response = app
            .oneshot(Request::builder().uri("/ws/1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(state.relay.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_websocket_route_rejects_non_integer_user() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        let response = app
            .oneshot(Request::builder().uri("/ws/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_input");
        assert_eq!(state.relay.registry().connection_count(), 0);
    }

    async fn wait_until_connected(state: &AppState, user: &str) {
        let user = UserId::from(user);
        for _ in 0..200 {
            if state.relay.registry().is_connected(&user) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("user {} never registered", user);
    }

    #[tokio::test]
    async fn test_websocket_relay_end_to_end() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut alice, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/1", addr))
            .await
            .unwrap();
        // A zero-padded id registers under the same key as the message body's.
        let (mut bob, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/02", addr))
            .await
            .unwrap();
        wait_until_connected(&state, "1").await;
        wait_until_connected(&state, "2").await;

        let outgoing = Message::new(1, 2, "hi bob");
        alice
            .send(WsMessage::Text(outgoing.encode().unwrap().into()))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), bob.next())
            .await
            .expect("timed out waiting for relay")
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(frame.to_text().unwrap()).unwrap(), outgoing);

        // Closing the client unregisters it.
        alice.close(None).await.unwrap();
        for _ in 0..200 {
            if !state.relay.registry().is_connected(&UserId::from(1)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!state.relay.registry().is_connected(&UserId::from(1)));
        assert!(state.relay.registry().is_connected(&UserId::from(2)));
    }
}
