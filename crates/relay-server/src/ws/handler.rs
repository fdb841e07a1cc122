use crate::auth::{self, AuthError};
use crate::config::AppState;
use crate::ws::pump::{self, PumpContext};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::HeaderMap,
    response::Response,
};
use futures::StreamExt;
use tracing::{debug, error, info};

/// GET / and GET /ws
///
/// Authenticates the bearer credential, then upgrades and hands the socket
/// to a connection pump. Unauthenticated requests are rejected before the
/// upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AuthError> {
    let token = auth::extract_token(&headers).inspect_err(|e| {
        debug!("Rejecting connection: {}", e);
    })?;

    let user_id = state.auth.validate(token).await.inspect_err(|e| {
        debug!("Rejecting connection: {}", e);
    })?;

    info!("User {} connected", user_id);

    let ctx = PumpContext::from(&state);
    let pumps = state.pumps.clone();

    Ok(ws
        .on_failed_upgrade(|e| error!("Failed to upgrade connection: {}", e))
        .on_upgrade(move |socket| {
            pumps.track_future(async move {
                let (writer, reader) = socket.split();
                pump::run_connection(user_id, writer, reader, ctx).await;
            })
        }))
}
