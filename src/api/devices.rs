/// Push device registration endpoints
use crate::{
    api::middleware::AuthUser,
    context::AppContext,
    error::AppResult,
    push::{DeviceToken, Environment, NewDevice, Platform, TransferPolicy},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Json, Router,
};
use serde::Deserialize;

/// Build device routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/push/devices", post(register_device))
        .route("/api/push/devices/:token", delete(unregister_device))
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    token: String,
    platform: Platform,
    environment: Environment,
    #[serde(default)]
    bundle_id: Option<String>,
}

/// Register or refresh the caller's device token
async fn register_device(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Json(req): Json<RegisterDeviceRequest>,
) -> AppResult<impl IntoResponse> {
    let policy = if ctx.config.push.allow_token_transfer {
        TransferPolicy::Allow
    } else {
        TransferPolicy::Reject
    };

    // Fall back to the configured app when the client does not say
    let bundle_id = req
        .bundle_id
        .filter(|b| !b.is_empty())
        .or_else(|| ctx.config.push.apns.as_ref().map(|a| a.bundle_id.clone()))
        .unwrap_or_default();

    let registration = ctx
        .devices
        .register(
            user.id,
            NewDevice {
                token: req.token,
                platform: req.platform,
                environment: req.environment,
                bundle_id,
            },
            policy,
        )
        .await?;

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration.token)))
}

/// Deactivate one of the caller's tokens
async fn unregister_device(
    State(ctx): State<AppContext>,
    AuthUser(user): AuthUser,
    Path(token): Path<String>,
) -> AppResult<Json<DeviceToken>> {
    let record = ctx.devices.deactivate_for_user(user.id, &token).await?;
    tracing::info!(user_id = user.id, token_id = record.id, "Device token unregistered");
    Ok(Json(record))
}
