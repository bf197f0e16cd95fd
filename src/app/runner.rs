//! Client for the external workflow runner.
//!
//! A run is started in two calls: `createRun` allocates a `runId`, then
//! `start-async` kicks off execution and registers the completion webhook.
//! The runner reports back through `POST /webhooks/workflow`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::WebsConfig;
use crate::errors::RunnerError;

/// Input handed to the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    pub work_item_id: String,
    pub source_urls: Vec<String>,
}

/// Echoed back verbatim in the completion callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub work_item_id: String,
    pub run_id: String,
    /// Caller's organisation, when the identity proxy supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookTarget {
    pub url: String,
    pub method: String,
}

/// Body of the `start-async` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub run_id: String,
    pub trigger_data: TriggerData,
    pub metadata: RunMetadata,
    pub webhook: WebhookTarget,
}

impl StartRunRequest {
    pub fn new(work_item_id: &str, run_id: &str, source_urls: Vec<String>, webhook_url: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            trigger_data: TriggerData {
                work_item_id: work_item_id.to_string(),
                source_urls,
            },
            metadata: RunMetadata {
                work_item_id: work_item_id.to_string(),
                run_id: run_id.to_string(),
                org_id: None,
            },
            webhook: WebhookTarget {
                url: webhook_url.to_string(),
                method: "POST".to_string(),
            },
        }
    }
    pub fn with_org(mut self, org_id: Option<String>) -> Self {
        self.metadata.org_id = org_id;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunResponse {
    run_id: String,
}

#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Name callbacks must carry in `workflowName`.
    fn workflow_name(&self) -> &str;

    async fn create_run(&self) -> Result<String, RunnerError>;

    async fn start_async(&self, request: &StartRunRequest) -> Result<(), RunnerError>;
}

/// Runner reached over HTTP.
pub struct HttpWorkflowRunner {
    client: reqwest::Client,
    base_url: String,
    workflow_name: String,
    api_key: Option<String>,
}

impl HttpWorkflowRunner {
    pub fn new(
        base_url: &str,
        workflow_name: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build runner HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            workflow_name: workflow_name.to_string(),
            api_key,
        })
    }

    fn endpoint(&self, action: &str) -> String {
        format!("{}/workflows/{}/{}", self.base_url, self.workflow_name, action)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<String, RunnerError> {
        let mut req = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|source| RunnerError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        let text = resp.text().await.map_err(|source| RunnerError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(RunnerError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl WorkflowRunner for HttpWorkflowRunner {
    fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    async fn create_run(&self) -> Result<String, RunnerError> {
        let url = self.endpoint("createRun");
        let text = self.post_json(&url, &serde_json::json!({})).await?;
        let parsed: CreateRunResponse =
            serde_json::from_str(&text).map_err(|e| RunnerError::Decode {
                url: url.clone(),
                message: e.to_string(),
            })?;
        if parsed.run_id.is_empty() {
            return Err(RunnerError::Decode {
                url,
                message: "empty runId".to_string(),
            });
        }
        Ok(parsed.run_id)
    }

    async fn start_async(&self, request: &StartRunRequest) -> Result<(), RunnerError> {
        let url = self.endpoint("start-async");
        self.post_json(&url, request).await?;
        Ok(())
    }
}

/// Stand-in used when no runner URL is configured; every call fails.
pub struct UnconfiguredRunner {
    workflow_name: String,
}

#[async_trait]
impl WorkflowRunner for UnconfiguredRunner {
    fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    async fn create_run(&self) -> Result<String, RunnerError> {
        Err(RunnerError::NotConfigured)
    }

    async fn start_async(&self, _request: &StartRunRequest) -> Result<(), RunnerError> {
        Err(RunnerError::NotConfigured)
    }
}

/// Build the runner described by `[runner]`.
pub fn runner_from_config(config: &WebsConfig) -> anyhow::Result<Arc<dyn WorkflowRunner>> {
    match &config.runner.base_url {
        Some(base_url) => Ok(Arc::new(HttpWorkflowRunner::new(
            base_url,
            &config.runner.workflow_name,
            config.runner.api_key.clone(),
            config.runner_timeout(),
        )?)),
        None => {
            tracing::warn!("runner.base_url is not set; dispatch will fail");
            Ok(Arc::new(UnconfiguredRunner {
                workflow_name: config.runner.workflow_name.clone(),
            }))
        }
    }
}
