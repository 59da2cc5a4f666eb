//! Defines the Axum routes and handlers.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use futures::{SinkExt, StreamExt, future};
use tower_http::services::{ServeDir, ServeFile};

use crate::web::AppState;
use crate::web::session;

pub const INDEX_PAGE: &str = "index.html";

/// Asset directories served verbatim from the UI dir.
const ASSET_DIRS: [&str; 4] = ["css", "js", "img", "fonts"];

/// Creates the router for the UI served from `state.ui_dir`.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/abs", get(ws_upgrade))
        .route_service("/favicon.ico", ServeFile::new(state.ui_dir.join("favicon.ico")));
    for dir in ASSET_DIRS {
        router = router.nest_service(&format!("/{dir}"), ServeDir::new(state.ui_dir.join(dir)));
    }
    router
        .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
        .with_state(state)
}

/// Renders the index page, substituting `{{listen}}`.
async fn index(State(state): State<AppState>) -> axum::response::Response {
    let path = state.ui_dir.join(INDEX_PAGE);
    match tokio::fs::read_to_string(&path).await {
        Ok(page) => Html(page.replace("{{listen}}", &state.listen)).into_response(),
        Err(e) => {
            tracing::error!("Unable to render UI from {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "unable to render UI").into_response()
        }
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("UI session connected");
    let (sender, receiver) = socket.split();
    let inbound = receiver
        .take_while(|frame| future::ready(!matches!(frame, Ok(WsMessage::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });
    let outbound = sender
        .with(|text: String| future::ready(Ok::<_, axum::Error>(WsMessage::Text(text.into()))));

    let client_in = state.client_in.clone();
    match session::bridge(inbound, outbound, client_in, state.outbound.subscribe()).await {
        Ok(()) => tracing::info!("UI session closed"),
        Err(e) => tracing::error!("UI session ended: {}", e),
    }
}
