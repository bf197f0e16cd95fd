//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::api::{AppState, SharedState};
use super::db::{AppDb, DbHandle};
use super::dispatcher::Dispatcher;
use super::runner::{StartRunRequest, WorkflowRunner};
use super::stream::StatusHub;
use crate::errors::RunnerError;

pub const WORKFLOW: &str = "webAnalysisWorkflow";

/// In-process runner that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeRunner {
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    created: AtomicUsize,
    started: Mutex<Vec<StartRunRequest>>,
}

impl FakeRunner {
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<StartRunRequest> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowRunner for FakeRunner {
    fn workflow_name(&self) -> &str {
        WORKFLOW
    }

    async fn create_run(&self) -> Result<String, RunnerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RunnerError::Status {
                url: "http://runner.test/workflows/webAnalysisWorkflow/createRun".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        Ok(format!("run-{}", n))
    }

    async fn start_async(&self, request: &StartRunRequest) -> Result<(), RunnerError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RunnerError::Status {
                url: "http://runner.test/workflows/webAnalysisWorkflow/start-async".to_string(),
                status: 500,
                body: "boom".to_string(),
            });
        }
        self.started.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Application state over an in-memory database and a fake runner.
pub fn test_state(runner: Arc<FakeRunner>) -> SharedState {
    let db = DbHandle::new(AppDb::new_in_memory().unwrap());
    Arc::new(AppState {
        dispatcher: Dispatcher::new(db.clone(), runner.clone(), "http://app.test/webhooks/workflow"),
        hub: StatusHub::new(db.clone(), Duration::from_millis(20)),
        db,
        workflow_name: WORKFLOW.to_string(),
        enforce_run_id: true,
        keep_alive: Duration::from_secs(15),
    })
}
