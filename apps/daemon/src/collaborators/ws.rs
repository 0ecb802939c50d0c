//! HTTP/WebSocket UI surface: a snapshot endpoint for a one-shot fetch plus
//! a socket that pushes every dispatch package as it lands (spec.md §6).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use solar_domain_models::value::flatten_packet;
use solar_infra_state::CentralState;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct UiState {
    pub central: Arc<CentralState>,
}

pub fn router(central: Arc<CentralState>) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(UiState { central })
}

async fn get_state(State(state): State<UiState>) -> impl IntoResponse {
    let snapshot = state.central.snapshot().await;
    Json(flatten_packet(&snapshot))
}

#[instrument(skip(upgrade, state))]
async fn upgrade(upgrade: WebSocketUpgrade, State(state): State<UiState>) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| push_loop(socket, state))
}

async fn push_loop(mut socket: WebSocket, state: UiState) {
    let mut dispatch_rx = state.central.dispatch_subscribe();

    loop {
        tokio::select! {
            changed = dispatch_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let package = dispatch_rx.borrow_and_update().clone();
                let flat = flatten_packet(&package.merged_data);
                let Ok(payload) = serde_json::to_string(&flat) else { continue; };
                if socket.send(Message::Text(payload)).await.is_err() {
                    debug!("ui socket closed by peer");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "ui socket read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
