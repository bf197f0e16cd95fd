use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tracing::error;

use super::context::RequestContext;
use super::db::DbHandle;
use super::dispatcher::{Dispatcher, validate_source_urls};
use super::models::{MessageRole, WorkItem};
use super::stream::{StatusHub, sse_response};
use super::webhook::webhook_router;
use crate::errors::BridgeError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: Dispatcher,
    pub hub: StatusHub,
    /// `workflowName` accepted on the completion webhook.
    pub workflow_name: String,
    pub enforce_run_id: bool,
    pub keep_alive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSpaceRequest {
    pub name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkItemRequest {
    pub title: Option<String>,
    pub space_id: Option<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub source_urls: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkItemsQuery {
    pub space_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateMessageRequest {
    pub role: Option<MessageRole>,
    pub content: String,
}

// ── Error handling ────────────────────────────────────────────────────

/// HTTP face of [`BridgeError`]; body is `{"error": message, "kind": kind}`.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(BridgeError::Internal(err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(BridgeError::Validation(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            BridgeError::Unauthenticated => StatusCode::UNAUTHORIZED,
            BridgeError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            BridgeError::InvalidState { .. } | BridgeError::StaleRun { .. } => StatusCode::CONFLICT,
            BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
            BridgeError::Upstream(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = ?self.0, "Request failed");
        }
        let body = serde_json::json!({"error": self.0.to_string(), "kind": self.0.kind()});
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/spaces", get(list_spaces).post(create_space))
        .route("/api/spaces/{id}", delete(delete_space))
        .route("/api/work-items", get(list_work_items).post(create_work_item))
        .route(
            "/api/work-items/{id}",
            get(get_work_item).delete(delete_work_item),
        )
        .route("/api/work-items/{id}/dispatch", post(dispatch_work_item))
        .route("/api/work-items/{id}/retry", post(retry_work_item))
        .route(
            "/api/work-items/{id}/messages",
            get(list_messages).post(create_message),
        )
        .route("/api/work-items/{id}/entities", get(list_entities))
        .route("/api/work-items/{id}/stream", get(stream_work_item))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/health", get(health_check))
        .merge(webhook_router())
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Fetch a work item and check the caller owns it.
async fn load_owned(
    state: &SharedState,
    ctx: &RequestContext,
    id: &str,
) -> Result<WorkItem, ApiError> {
    let lookup = id.to_string();
    let item = state
        .db
        .call(move |db| db.get_work_item(&lookup))
        .await?
        .ok_or_else(|| BridgeError::work_item_not_found(id))?;
    ctx.ensure_owner("Work item", id, &item.owner_id)?;
    Ok(item)
}

/// Parse an optional JSON body; an empty body means "no new input".
fn parse_dispatch_body(body: &Bytes) -> Result<DispatchRequest, ApiError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(DispatchRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| BridgeError::Validation(format!("Invalid request body: {}", e)).into())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_spaces(
    State(state): State<SharedState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let spaces = state
        .db
        .call(move |db| db.list_spaces(&ctx.user_id))
        .await?;
    Ok(Json(spaces))
}

async fn create_space(
    State(state): State<SharedState>,
    ctx: RequestContext,
    req: Result<Json<CreateSpaceRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(BridgeError::Validation("name must not be empty".into()).into());
    }
    let space = state
        .db
        .call(move |db| db.create_space(&ctx.user_id, &name))
        .await?;
    Ok((StatusCode::CREATED, Json(space)))
}

async fn delete_space(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let space = state
        .db
        .call(move |db| db.get_space(&lookup))
        .await?
        .ok_or_else(|| BridgeError::NotFound {
            kind: "Space",
            id: id.clone(),
        })?;
    ctx.ensure_owner("Space", &id, &space.owner_id)?;
    state.db.call(move |db| db.delete_space(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_work_items(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Query(query): Query<ListWorkItemsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .db
        .call(move |db| db.list_work_items(&ctx.user_id, query.space_id.as_deref()))
        .await?;
    Ok(Json(items))
}

async fn create_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    req: Result<Json<CreateWorkItemRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    if !req.source_urls.is_empty() {
        validate_source_urls(&req.source_urls)?;
    }
    if let Some(space_id) = req.space_id.clone() {
        let lookup = space_id.clone();
        let space = state
            .db
            .call(move |db| db.get_space(&lookup))
            .await?
            .ok_or_else(|| BridgeError::NotFound {
                kind: "Space",
                id: space_id.clone(),
            })?;
        ctx.ensure_owner("Space", &space_id, &space.owner_id)?;
    }

    let item = state
        .db
        .call(move |db| {
            db.create_work_item(
                &ctx.user_id,
                req.space_id.as_deref(),
                req.title.as_deref(),
                &req.source_urls,
            )
        })
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let item = load_owned(&state, &ctx, &id).await?;
    Ok(Json(item))
}

async fn delete_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &ctx, &id).await?;
    let lookup = id.clone();
    let deleted = state
        .db
        .call(move |db| db.delete_work_item(&lookup))
        .await?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(BridgeError::work_item_not_found(&id).into()),
    }
}

async fn dispatch_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_dispatch_body(&body)?;
    let outcome = state.dispatcher.dispatch(&ctx, &id, req.source_urls).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn retry_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_dispatch_body(&body)?;
    let outcome = state.dispatcher.retry(&ctx, &id, req.source_urls).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn list_messages(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &ctx, &id).await?;
    let messages = state.db.call(move |db| db.list_messages(&id)).await?;
    Ok(Json(messages))
}

async fn create_message(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    req: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = req?;
    if req.content.trim().is_empty() {
        return Err(BridgeError::Validation("content must not be empty".into()).into());
    }
    load_owned(&state, &ctx, &id).await?;
    let role = req.role.unwrap_or(MessageRole::User);
    let message = state
        .db
        .call(move |db| db.create_message(&id, &ctx.user_id, role, &req.content))
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn list_entities(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &ctx, &id).await?;
    let entities = state.db.call(move |db| db.list_entities(&id)).await?;
    Ok(Json(entities))
}

async fn stream_work_item(
    State(state): State<SharedState>,
    ctx: RequestContext,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &ctx, &id).await?;
    let events = state.hub.watch(&id).await;
    Ok(sse_response(events, state.keep_alive))
}

async fn get_settings(
    State(state): State<SharedState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = ctx.user_id.clone();
    let settings = state.db.call(move |db| db.get_settings(&user_id)).await?;
    let body = match settings {
        Some(s) => serde_json::to_value(s).map_err(anyhow::Error::from)?,
        None => serde_json::json!({"userId": ctx.user_id, "settings": {}, "updatedAt": null}),
    };
    Ok(Json(body))
}

async fn put_settings(
    State(state): State<SharedState>,
    ctx: RequestContext,
    settings: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(settings) = settings?;
    if !settings.is_object() {
        return Err(BridgeError::Validation("settings must be a JSON object".into()).into());
    }
    let saved = state
        .db
        .call(move |db| db.put_settings(&ctx.user_id, &settings))
        .await?;
    Ok(Json(saved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::context::USER_ID_HEADER;
    use crate::app::models::{WorkItemStatus, DerivedResult};
    use crate::app::test_support::{FakeRunner, test_state};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_app() -> (Router, SharedState, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::default());
        let state = test_state(runner.clone());
        (api_router().with_state(state.clone()), state, runner)
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_item(app: &Router, user: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/work-items",
                Some(user),
                Some(json!({"title": "Pricing pages", "sourceUrls": ["https://example.com/pricing"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response.into_body()).await
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _) = test_app();
        let response = app.oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthenticated() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(request("GET", "/api/work-items", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_create_and_get_work_item() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        assert_eq!(created["status"], "PENDING");
        assert_eq!(created["ownerId"], "u1");

        let uri = format!("/api/work-items/{}", created["id"].as_str().unwrap());
        let response = app.clone().oneshot(request("GET", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_other_owner_is_forbidden() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        let uri = format!("/api/work-items/{}", created["id"].as_str().unwrap());
        let response = app.oneshot(request("GET", &uri, Some("u2"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_list_is_owner_scoped() {
        let (app, _, _) = test_app();
        create_item(&app, "u1").await;
        create_item(&app, "u2").await;
        let response = app
            .oneshot(request("GET", "/api/work-items", Some("u1"), None))
            .await
            .unwrap();
        let items: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["ownerId"], "u1");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_urls() {
        let (app, _, _) = test_app();
        let response = app
            .oneshot(request(
                "POST",
                "/api/work-items",
                Some("u1"),
                Some(json!({"sourceUrls": ["javascript:alert(1)"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_malformed_json_bodies_are_validation_errors() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        let messages = format!("/api/work-items/{}/messages", created["id"].as_str().unwrap());

        let cases = [
            ("POST", "/api/work-items".to_string(), json!({"sourceUrls": 5})),
            ("POST", "/api/spaces".to_string(), json!({"title": "no name"})),
            ("POST", messages, json!({"role": "narrator", "content": "hi"})),
        ];
        for (method, uri, body) in cases {
            let response = app
                .clone()
                .oneshot(request(method, &uri, Some("u1"), Some(body)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{} {}", method, uri);
            let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
            assert!(content_type.starts_with("application/json"));
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["kind"], "validation_error");
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/settings")
                    .header(USER_ID_HEADER, "u1")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "validation_error");
    }

    #[tokio::test]
    async fn test_dispatch_returns_accepted_then_conflict() {
        let (app, _, runner) = test_app();
        let created = create_item(&app, "u1").await;
        let uri = format!("/api/work-items/{}/dispatch", created["id"].as_str().unwrap());

        let response = app.clone().oneshot(request("POST", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["workItem"]["status"], "PROCESSING");
        assert_eq!(body["workItem"]["runId"], body["runId"]);

        let response = app.oneshot(request("POST", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["kind"], "invalid_state");
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_upstream_failure_is_bad_gateway() {
        let (app, state, runner) = test_app();
        runner.fail_start(true);
        let created = create_item(&app, "u1").await;
        let id = created["id"].as_str().unwrap().to_string();
        let uri = format!("/api/work-items/{}/dispatch", id);

        let response = app.oneshot(request("POST", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let item = state.db.call(move |db| db.get_work_item(&id)).await.unwrap().unwrap();
        assert_eq!(item.status, WorkItemStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_with_new_input() {
        let (app, state, runner) = test_app();
        let created = create_item(&app, "u1").await;
        let id = created["id"].as_str().unwrap().to_string();
        let fail_id = id.clone();
        state.db.call(move |db| db.fail_work_item(&fail_id, "timeout")).await.unwrap();

        let uri = format!("/api/work-items/{}/retry", id);
        let response = app
            .oneshot(request(
                "POST",
                &uri,
                Some("u1"),
                Some(json!({"sourceUrls": ["https://example.org/new"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            runner.started()[0].trigger_data.source_urls,
            vec!["https://example.org/new".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dispatch_malformed_body_is_bad_request() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        let uri = format!("/api/work-items/{}/dispatch", created["id"].as_str().unwrap());
        let req = Request::builder()
            .method("POST")
            .uri(&uri)
            .header(USER_ID_HEADER, "u1")
            .body(Body::from("{oops"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_work_item_cascades() {
        let (app, state, _) = test_app();
        let created = create_item(&app, "u1").await;
        let id = created["id"].as_str().unwrap().to_string();

        let messages_uri = format!("/api/work-items/{}/messages", id);
        let response = app
            .clone()
            .oneshot(request("POST", &messages_uri, Some("u1"), Some(json!({"content": "Summarise"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let uri = format!("/api/work-items/{}", id);
        let response = app.clone().oneshot(request("DELETE", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(request("GET", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let messages = state.db.call(move |db| db.list_messages(&id)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_messages_round_trip() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        let uri = format!("/api/work-items/{}/messages", created["id"].as_str().unwrap());

        app.clone()
            .oneshot(request("POST", &uri, Some("u1"), Some(json!({"content": "hello"}))))
            .await
            .unwrap();
        app.clone()
            .oneshot(request(
                "POST",
                &uri,
                Some("u1"),
                Some(json!({"role": "assistant", "content": "hi"})),
            ))
            .await
            .unwrap();

        let response = app.oneshot(request("GET", &uri, Some("u1"), None)).await.unwrap();
        let messages: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_entities_after_completion() {
        let (app, state, _) = test_app();
        let created = create_item(&app, "u1").await;
        let id = created["id"].as_str().unwrap().to_string();
        let complete_id = id.clone();
        state
            .db
            .call(move |db| {
                let payload = json!({"entities": [{"name": "Acme", "type": "organization"}]});
                db.complete_work_item(&complete_id, &payload, &DerivedResult::from_result(&payload))
            })
            .await
            .unwrap();

        let uri = format!("/api/work-items/{}/entities", id);
        let response = app.oneshot(request("GET", &uri, Some("u1"), None)).await.unwrap();
        let entities: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0]["kind"], "organization");
    }

    #[tokio::test]
    async fn test_spaces_crud() {
        let (app, _, _) = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/api/spaces", Some("u1"), Some(json!({"name": "Competitors"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let space: serde_json::Value = body_json(response.into_body()).await;

        let response = app
            .clone()
            .oneshot(request("GET", "/api/spaces", Some("u1"), None))
            .await
            .unwrap();
        let spaces: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(spaces.len(), 1);

        let uri = format!("/api/spaces/{}", space["id"].as_str().unwrap());
        let response = app.clone().oneshot(request("DELETE", &uri, Some("u2"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app.oneshot(request("DELETE", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_in_foreign_space_is_forbidden() {
        let (app, _, _) = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/api/spaces", Some("u1"), Some(json!({"name": "Mine"}))))
            .await
            .unwrap();
        let space: serde_json::Value = body_json(response.into_body()).await;

        let response = app
            .oneshot(request(
                "POST",
                "/api/work-items",
                Some("u2"),
                Some(json!({"spaceId": space["id"]})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_settings_default_and_upsert() {
        let (app, _, _) = test_app();
        let response = app
            .clone()
            .oneshot(request("GET", "/api/settings", Some("u1"), None))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["settings"], json!({}));

        let response = app
            .clone()
            .oneshot(request("PUT", "/api/settings", Some("u1"), Some(json!({"theme": "dark"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("PUT", "/api/settings", Some("u1"), Some(json!(["not", "object"]))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request("GET", "/api/settings", Some("u1"), None))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["settings"]["theme"], "dark");
    }

    #[tokio::test]
    async fn test_stream_for_complete_item() {
        let (app, state, _) = test_app();
        let created = create_item(&app, "u1").await;
        let id = created["id"].as_str().unwrap().to_string();
        let complete_id = id.clone();
        state
            .db
            .call(move |db| db.complete_work_item(&complete_id, &json!({"ok": 1}), &DerivedResult::default()))
            .await
            .unwrap();

        let uri = format!("/api/work-items/{}/stream", id);
        let response = app.oneshot(request("GET", &uri, Some("u1"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event: ").or_else(|| l.strip_prefix("event:")))
            .collect();
        assert_eq!(events, vec!["status", "complete"]);
        assert!(text.contains("\"status\":\"COMPLETE\""));
    }

    #[tokio::test]
    async fn test_stream_requires_owner() {
        let (app, _, _) = test_app();
        let created = create_item(&app, "u1").await;
        let uri = format!("/api/work-items/{}/stream", created["id"].as_str().unwrap());
        let response = app.oneshot(request("GET", &uri, Some("u2"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_api_error_status_mapping() {
        let cases = [
            (BridgeError::work_item_not_found("w"), StatusCode::NOT_FOUND),
            (BridgeError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (BridgeError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (
                BridgeError::StaleRun {
                    id: "w".into(),
                    callback_run_id: "r0".into(),
                    active_run_id: Some("r1".into()),
                },
                StatusCode::CONFLICT,
            ),
            (
                BridgeError::Upstream(crate::errors::RunnerError::NotConfigured),
                StatusCode::BAD_GATEWAY,
            ),
            (BridgeError::Internal(anyhow::anyhow!("db")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }
}
