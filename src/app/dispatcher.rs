//! Run dispatch and retry.
//!
//! Order of operations: precondition check, `createRun`, conditional claim
//! of the item under the new run id, then `start-async`. Runner failures
//! are recorded on the item as `FAILED` and returned as `Upstream`; there
//! is no silent retry.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::context::RequestContext;
use super::db::DbHandle;
use super::models::{WorkItem, WorkItemStatus};
use super::runner::{StartRunRequest, WorkflowRunner};
use crate::errors::BridgeError;

/// Result of a successful dispatch or retry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub run_id: String,
    pub work_item: WorkItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Dispatch,
    Retry,
}

/// Check that every source URL is an absolute http(s) URL.
pub fn validate_source_urls(urls: &[String]) -> Result<(), BridgeError> {
    if urls.is_empty() {
        return Err(BridgeError::Validation(
            "sourceUrls must contain at least one URL".to_string(),
        ));
    }
    for raw in urls {
        let parsed = reqwest::Url::parse(raw)
            .map_err(|e| BridgeError::Validation(format!("'{}' is not a valid URL: {}", raw, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(BridgeError::Validation(format!(
                "'{}' must be an absolute http(s) URL",
                raw
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct Dispatcher {
    db: DbHandle,
    runner: Arc<dyn WorkflowRunner>,
    webhook_url: String,
}

impl Dispatcher {
    pub fn new(db: DbHandle, runner: Arc<dyn WorkflowRunner>, webhook_url: impl Into<String>) -> Self {
        Self {
            db,
            runner,
            webhook_url: webhook_url.into(),
        }
    }

    /// Start a run for a `PENDING` or `FAILED` item, or for a `COMPLETE`
    /// item when new `source_urls` are supplied.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        work_item_id: &str,
        source_urls: Option<Vec<String>>,
    ) -> Result<DispatchOutcome, BridgeError> {
        self.start(ctx, work_item_id, source_urls, Mode::Dispatch).await
    }

    /// Start a new run for a `FAILED` item, with its stored input or `source_urls`.
    pub async fn retry(
        &self,
        ctx: &RequestContext,
        work_item_id: &str,
        source_urls: Option<Vec<String>>,
    ) -> Result<DispatchOutcome, BridgeError> {
        self.start(ctx, work_item_id, source_urls, Mode::Retry).await
    }

    async fn start(
        &self,
        ctx: &RequestContext,
        work_item_id: &str,
        source_urls: Option<Vec<String>>,
        mode: Mode,
    ) -> Result<DispatchOutcome, BridgeError> {
        if let Some(urls) = &source_urls {
            validate_source_urls(urls)?;
        }

        let id = work_item_id.to_string();
        let item = self
            .db
            .call(move |db| db.get_work_item(&id))
            .await?
            .ok_or_else(|| BridgeError::work_item_not_found(work_item_id))?;
        ctx.ensure_owner("Work item", &item.id, &item.owner_id)?;
        check_precondition(&item, source_urls.is_some(), mode)?;

        let input = source_urls.clone().unwrap_or_else(|| item.source_urls.clone());
        validate_source_urls(&input)?;

        let run_id = match self.runner.create_run().await {
            Ok(run_id) => run_id,
            Err(e) => {
                let reason = e.to_string();
                warn!(work_item_id = %item.id, error = %reason, "createRun failed");
                let id = item.id.clone();
                self.db
                    .call(move |db| db.fail_unless_processing(&id, &reason))
                    .await?;
                return Err(e.into());
            }
        };

        let id = item.id.clone();
        let claim_run_id = run_id.clone();
        let claimed = self
            .db
            .call(move |db| {
                let claimed = db.claim_for_run(&id, &claim_run_id, source_urls.as_deref())?;
                let current = match claimed {
                    Some(_) => None,
                    None => db.get_work_item(&id)?,
                };
                Ok((claimed, current))
            })
            .await?;
        let claimed = match claimed {
            (Some(item), _) => item,
            (None, Some(current)) => {
                warn!(work_item_id = %current.id, run_id = %run_id, "lost dispatch race; orphaned run left unstarted");
                return Err(BridgeError::InvalidState {
                    id: current.id,
                    status: current.status.to_string(),
                    message: "a run is already in flight".to_string(),
                });
            }
            (None, None) => return Err(BridgeError::work_item_not_found(work_item_id)),
        };

        let request = StartRunRequest::new(&claimed.id, &run_id, input, &self.webhook_url)
            .with_org(ctx.org_id.clone());
        if let Err(e) = self.runner.start_async(&request).await {
            let reason = e.to_string();
            warn!(work_item_id = %claimed.id, run_id = %run_id, error = %reason, "start-async failed");
            let id = claimed.id.clone();
            let failed_run = run_id.clone();
            self.db
                .call(move |db| db.fail_active_run(&id, &failed_run, &reason))
                .await?;
            return Err(e.into());
        }

        let is_retry = mode == Mode::Retry;
        info!(
            work_item_id = %claimed.id,
            run_id = %run_id,
            org_id = ?ctx.org_id,
            retry = is_retry,
            "Workflow run dispatched"
        );
        Ok(DispatchOutcome {
            run_id,
            work_item: claimed,
        })
    }
}

fn check_precondition(item: &WorkItem, has_new_input: bool, mode: Mode) -> Result<(), BridgeError> {
    let allowed = match (mode, item.status) {
        (Mode::Retry, WorkItemStatus::Failed) => true,
        (Mode::Retry, _) => false,
        (Mode::Dispatch, WorkItemStatus::Pending | WorkItemStatus::Failed) => true,
        (Mode::Dispatch, WorkItemStatus::Complete) => has_new_input,
        (Mode::Dispatch, WorkItemStatus::Processing) => false,
    };
    if allowed {
        return Ok(());
    }
    let message = match (mode, item.status) {
        (_, WorkItemStatus::Processing) => "a run is already in flight",
        (Mode::Retry, _) => "only FAILED work items can be retried",
        _ => "re-dispatching a COMPLETE work item requires new sourceUrls",
    };
    Err(BridgeError::InvalidState {
        id: item.id.clone(),
        status: item.status.to_string(),
        message: message.to_string(),
    })
}
