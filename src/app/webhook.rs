//! Completion webhook: the runner's callback when a run finishes.
//!
//! A callback either completes the item with its `result` or, when it
//! carries an `error`, marks it failed. Malformed or foreign callbacks are
//! rejected before anything is written. Callbacks are not signed; anyone
//! who can reach this route can complete an item.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::post,
};
use serde::Deserialize;
use tracing::{info, warn};

use super::api::{ApiError, SharedState};
use super::db::DbHandle;
use super::models::{DerivedResult, WorkItem};
use crate::errors::BridgeError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMetadata {
    #[serde(default)]
    pub work_item_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Callback body as posted by the runner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCallback {
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<CallbackMetadata>,
    /// Runner-reported failure; takes precedence over `result`.
    #[serde(default)]
    pub error: Option<String>,
}

/// Knobs for callback handling.
#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    pub workflow_name: String,
    pub enforce_run_id: bool,
}

enum Outcome {
    Complete(serde_json::Value),
    Fail(String),
}

enum Applied {
    Updated(WorkItem),
    Missing,
    Stale { active_run_id: Option<String> },
}

/// Validate a callback and persist its outcome.
///
/// The run-id check and the write happen inside one store call, so a
/// dispatch cannot slip in between them.
pub async fn apply_callback(
    db: &DbHandle,
    policy: &CallbackPolicy,
    callback: WorkflowCallback,
) -> Result<WorkItem, BridgeError> {
    let workflow_name = callback.workflow_name.unwrap_or_default();
    if workflow_name != policy.workflow_name {
        return Err(BridgeError::Validation(format!(
            "Unexpected workflowName '{}'",
            workflow_name
        )));
    }

    let metadata = callback.metadata.unwrap_or_default();
    let work_item_id = metadata
        .work_item_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BridgeError::Validation("metadata.workItemId is required".to_string()))?;

    let outcome = match (callback.error.filter(|e| !e.trim().is_empty()), callback.result) {
        (Some(reason), _) => Outcome::Fail(reason),
        (None, Some(result)) if !result.is_null() => Outcome::Complete(result),
        (None, _) => {
            return Err(BridgeError::Validation(
                "result is required for a successful run".to_string(),
            ));
        }
    };

    let callback_run_id = metadata.run_id.filter(|r| !r.is_empty());
    let enforce = policy.enforce_run_id;
    let id = work_item_id.clone();
    let guard_run_id = callback_run_id.clone();
    let applied = db
        .call(move |db| {
            let Some(item) = db.get_work_item(&id)? else {
                return Ok(Applied::Missing);
            };
            if enforce {
                if let Some(run_id) = &guard_run_id {
                    if item.run_id.as_deref() != Some(run_id.as_str()) {
                        return Ok(Applied::Stale {
                            active_run_id: item.run_id,
                        });
                    }
                }
            }
            let updated = match &outcome {
                Outcome::Fail(reason) => db.fail_work_item(&id, reason)?,
                Outcome::Complete(payload) => {
                    let derived = DerivedResult::from_result(payload);
                    db.complete_work_item(&id, payload, &derived)?
                }
            };
            Ok(Applied::Updated(updated))
        })
        .await?;

    match applied {
        Applied::Updated(item) => {
            info!(
                work_item_id = %item.id,
                run_id = ?item.run_id,
                status = %item.status,
                "Workflow callback applied"
            );
            Ok(item)
        }
        Applied::Missing => Err(BridgeError::work_item_not_found(&work_item_id)),
        Applied::Stale { active_run_id } => Err(BridgeError::StaleRun {
            id: work_item_id,
            callback_run_id: callback_run_id.unwrap_or_default(),
            active_run_id,
        }),
    }
}

async fn workflow_callback(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let callback: WorkflowCallback = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Rejected unparseable workflow callback");
        BridgeError::Validation(format!("Invalid callback body: {}", e))
    })?;

    let policy = CallbackPolicy {
        workflow_name: state.workflow_name.clone(),
        enforce_run_id: state.enforce_run_id,
    };
    if let Err(e) = apply_callback(&state.db, &policy, callback).await {
        warn!(error = %e, kind = e.kind(), "Rejected workflow callback");
        return Err(e.into());
    }
    Ok(Json(serde_json::json!({"success": true})))
}

pub fn webhook_router() -> Router<SharedState> {
    Router::new().route("/webhooks/workflow", post(workflow_callback))
}
