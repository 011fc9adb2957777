//! HTTP handlers for webhook management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::instrument;
use url::Url;

use crate::{
    AppState,
    api::DeveloperIdentity,
    api::models::webhooks::{
        SubscriptionResponse, UnsubscribeResponse, WebhookCreate, WebhookResponse, WebhookUpdate,
    },
    consumer::did::resolve_asset_did,
    db::handlers::{Subscriptions, Webhooks},
    db::models::webhooks::{WebhookCreateDBRequest, WebhookStatus, WebhookUpdateDBRequest},
    errors::{Error, Result},
    types::{Service, WebhookId},
    xl,
};

/// Validate a `(service, metric, condition)` triple: the metric must exist
/// for signals, and the condition must compile against the metric's
/// variable schema.
fn validate_condition(
    state: &AppState,
    service: Service,
    metric_name: &str,
    condition: &str,
) -> Result<()> {
    let schema = match service {
        Service::Signals => {
            let def = state
                .catalog
                .lookup(metric_name)
                .ok_or_else(|| Error::BadRequest {
                    message: format!("Unknown signal: {metric_name}"),
                })?;
            xl::signal_schema(def.value_type.kind())
        }
        Service::Events => xl::event_schema(),
    };
    xl::compile(condition, &schema)?;
    Ok(())
}

/// The target must be an absolute https URL.
fn validate_target_uri(target_uri: &str) -> Result<()> {
    let url = Url::parse(target_uri).map_err(|e| Error::BadRequest {
        message: format!("Invalid target URI: {e}"),
    })?;
    if url.scheme() != "https" {
        return Err(Error::BadRequest {
            message: "Target URI must use HTTPS".to_string(),
        });
    }
    Ok(())
}

/// Verification handshake: POST `{"verification":"test"}` to the target;
/// the endpoint must answer 200 with the declared token as its body.
async fn verify_target(state: &AppState, target_uri: &str, token: &str) -> Result<()> {
    let response = state
        .http_client
        .post(target_uri)
        .json(&serde_json::json!({"verification": "test"}))
        .send()
        .await
        .map_err(|e| Error::BadRequest {
            message: format!("Target endpoint verification failed: {e}"),
        })?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::BadRequest {
            message: format!(
                "Target endpoint verification failed: expected 200, got {}",
                response.status()
            ),
        });
    }

    let body = response.text().await.unwrap_or_default();
    if body.trim() != token {
        return Err(Error::BadRequest {
            message: "Target endpoint verification failed: token mismatch".to_string(),
        });
    }
    Ok(())
}

/// Register a webhook.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn create_webhook(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Json(request): Json<WebhookCreate>,
) -> Result<(StatusCode, Json<WebhookResponse>)> {
    let service: Service = request.service.parse().map_err(|e| Error::BadRequest {
        message: format!("Invalid service: {e}"),
    })?;
    validate_condition(&state, service, &request.metric_name, &request.condition)?;
    validate_target_uri(&request.target_uri)?;
    verify_target(&state, &request.target_uri, &request.verification_token).await?;

    let cooldown = request
        .cooldown_period
        .unwrap_or(state.config.engine.cooldown_default.as_secs() as u32);

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let webhook = Webhooks::new(&mut tx)
        .create(&WebhookCreateDBRequest {
            service: service.as_str().to_string(),
            metric_name: request.metric_name,
            condition: request.condition,
            target_uri: request.target_uri,
            cooldown_period: cooldown.min(i32::MAX as u32) as i32,
            developer_license: identity.0,
            display_name: request.display_name,
            description: request.description,
        })
        .await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    state.refresh.request_refresh();
    Ok((StatusCode::CREATED, Json(webhook.into())))
}

/// List the caller's webhooks.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn list_webhooks(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
) -> Result<Json<Vec<WebhookResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let webhooks = Webhooks::new(&mut conn).list_by_owner(&identity.0).await?;
    Ok(Json(webhooks.into_iter().map(Into::into).collect()))
}

/// Get one webhook.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn get_webhook(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path(webhook_id): Path<WebhookId>,
) -> Result<Json<WebhookResponse>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let webhook = Webhooks::new(&mut conn)
        .get_owned(webhook_id, &identity.0)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    Ok(Json(webhook.into()))
}

/// Update a webhook. Changing the target URI re-runs the verification
/// handshake and clears the failure streak so a circuit-broken webhook can
/// deliver again.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn update_webhook(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path(webhook_id): Path<WebhookId>,
    Json(request): Json<WebhookUpdate>,
) -> Result<Json<WebhookResponse>> {
    if let Some(status) = request.status
        && !matches!(status, WebhookStatus::Enabled | WebhookStatus::Disabled)
    {
        return Err(Error::BadRequest {
            message: "Status can only be set to enabled or disabled".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let existing = Webhooks::new(&mut conn)
        .get_owned(webhook_id, &identity.0)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    drop(conn);

    // Validate the effective (metric, condition) pair after the patch.
    let service: Service = existing.service.parse().map_err(|e| Error::Internal {
        operation: format!("parse stored service: {e}"),
    })?;
    let metric = request.metric_name.as_deref().unwrap_or(&existing.metric_name);
    let condition = request.condition.as_deref().unwrap_or(&existing.condition);
    validate_condition(&state, service, metric, condition)?;

    let target_changed = matches!(&request.target_uri, Some(uri) if *uri != existing.target_uri);
    if let Some(uri) = &request.target_uri {
        validate_target_uri(uri)?;
    }
    if target_changed {
        let token = request
            .verification_token
            .as_deref()
            .ok_or_else(|| Error::BadRequest {
                message: "verification_token is required when changing the target URI".to_string(),
            })?;
        verify_target(&state, request.target_uri.as_deref().unwrap_or_default(), token).await?;
    }

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Webhooks::new(&mut tx);
    let status = if target_changed && existing.webhook_status() == WebhookStatus::Failed {
        // A repaired target gets a fresh start.
        Some(WebhookStatus::Enabled)
    } else {
        request.status
    };
    let webhook = repo
        .update(
            webhook_id,
            &identity.0,
            &WebhookUpdateDBRequest {
                metric_name: request.metric_name,
                condition: request.condition,
                target_uri: request.target_uri,
                cooldown_period: request
                    .cooldown_period
                    .map(|c| c.min(i32::MAX as u32) as i32),
                display_name: request.display_name,
                description: request.description,
                status,
            },
        )
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    if target_changed {
        repo.reset_failure_count(webhook_id).await?;
    }
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    state.refresh.request_refresh();
    Ok(Json(webhook.into()))
}

/// Soft-delete a webhook and cascade its subscriptions atomically.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn delete_webhook(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path(webhook_id): Path<WebhookId>,
) -> Result<StatusCode> {
    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    let deleted = Webhooks::new(&mut tx).soft_delete(webhook_id, &identity.0).await?;
    if !deleted {
        return Err(Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        });
    }
    Subscriptions::new(&mut tx).delete_for_webhook(webhook_id).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    state.refresh.request_refresh();
    Ok(StatusCode::NO_CONTENT)
}

/// Subscribe a vehicle to a webhook.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn create_subscription(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path((webhook_id, asset_did)): Path<(WebhookId, String)>,
) -> Result<(StatusCode, Json<SubscriptionResponse>)> {
    let asset_did = resolve_asset_did(&asset_did)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    Webhooks::new(&mut tx)
        .get_owned(webhook_id, &identity.0)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    let subscription = Subscriptions::new(&mut tx).create(&asset_did, webhook_id).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    state.refresh.request_refresh();
    Ok((
        StatusCode::CREATED,
        Json(SubscriptionResponse {
            asset_did: subscription.asset_did,
            webhook_id: subscription.webhook_id,
            created_at: subscription.created_at,
        }),
    ))
}

/// Unsubscribe a vehicle from a webhook.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn delete_subscription(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path((webhook_id, asset_did)): Path<(WebhookId, String)>,
) -> Result<Json<UnsubscribeResponse>> {
    let asset_did = resolve_asset_did(&asset_did)?;

    let mut tx = state.db.begin().await.map_err(|e| Error::Database(e.into()))?;
    Webhooks::new(&mut tx)
        .get_owned(webhook_id, &identity.0)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    let deleted = Subscriptions::new(&mut tx).delete(&asset_did, webhook_id).await?;
    tx.commit().await.map_err(|e| Error::Database(e.into()))?;

    if deleted == 0 {
        return Err(Error::NotFound {
            resource: "Subscription".to_string(),
            id: format!("{webhook_id}/{asset_did}"),
        });
    }
    state.refresh.request_refresh();
    Ok(Json(UnsubscribeResponse { deleted }))
}

/// List a webhook's subscriptions.
#[instrument(skip_all, fields(owner = %identity.0))]
pub async fn list_subscriptions(
    State(state): State<AppState>,
    identity: DeveloperIdentity,
    Path(webhook_id): Path<WebhookId>,
) -> Result<Json<Vec<SubscriptionResponse>>> {
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Webhooks::new(&mut conn)
        .get_owned(webhook_id, &identity.0)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Webhook".to_string(),
            id: webhook_id.to_string(),
        })?;
    let subscriptions = Subscriptions::new(&mut conn).list_for_webhook(webhook_id).await?;
    Ok(Json(
        subscriptions
            .into_iter()
            .map(|s| SubscriptionResponse {
                asset_did: s.asset_did,
                webhook_id: s.webhook_id,
                created_at: s.created_at,
            })
            .collect(),
    ))
}
