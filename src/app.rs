use std::{env, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::parsing::{
    extract_analysis_sections, extract_embedded_record_id, parse_ad_copy_variations,
};
use crate::templates::render_template;
use crate::types::*;

/// A job still `processing` after this long is presumed lost and marked failed.
const JOB_STALENESS_SECS: i64 = 300;
/// A chat busy flag older than this may be force-reset by a new submission.
const CHAT_BUSY_STALENESS_SECS: i64 = 30;
/// Estimated-token ceiling before oldest-first message eviction kicks in.
const TOKEN_CLEANUP_THRESHOLD: i64 = 8000;
/// Eviction never shrinks a conversation below this many messages.
const MIN_RETAINED_MESSAGES: usize = 2;
/// Timeout for calls to external workflow engines.
const UPSTREAM_TIMEOUT_SECS: u64 = 300;

const JOB_TIMEOUT_MESSAGE: &str = "Generation timed out. Please try again.";

type ApiError = (StatusCode, Json<Value>);

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "marketing_ops".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

/// Crude chars/4 proxy for token counts. Not a tokenizer; budget enforcement
/// only needs a stable monotone estimate.
fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

fn stored_file_name(original: &str) -> String {
    let ext = original
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}.{}", Utc::now().timestamp_millis(), &random[..12], ext)
}

fn sign_callback_token(secret: &str, record_id: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"fallback").expect("hmac accepts any key size"));
    mac.update(record_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_callback_token(secret: &str, record_id: &str, token: &str) -> bool {
    let expected = sign_callback_token(secret, record_id);
    // Constant-time compare via the hmac crate.
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(record_id.as_bytes());
    match hex::decode(token) {
        Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
        Err(_) => token == expected,
    }
}

fn email_domain_allowed(email: &str, allow_list: &str) -> bool {
    let allowed = allow_list
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>();
    if allowed.is_empty() {
        return true;
    }
    let Some(domain) = email.rsplit_once('@').map(|(_, d)| d) else {
        return false;
    };
    allowed.iter().any(|d| d.eq_ignore_ascii_case(domain))
}

fn content_is_placeholder(content: &Value) -> bool {
    match content {
        Value::Null => true,
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.is_empty() || trimmed == PLACEHOLDER_CONTENT
        }
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealAction {
    RevertToProcessing,
    MarkFailed,
    MarkCompleted,
}

/// Self-healing rules for a polled job record, applied in order: a completed
/// record with placeholder content is inconsistent and reverts; a processing
/// record past the staleness threshold has lost its callback and fails; a
/// processing record that already has real content moves forward to completed.
fn healing_action(status: &str, content: &Value, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<HealAction> {
    let placeholder = content_is_placeholder(content);
    match status {
        "completed" if placeholder => Some(HealAction::RevertToProcessing),
        "processing" if now.signed_duration_since(created_at).num_seconds() > JOB_STALENESS_SECS => {
            Some(HealAction::MarkFailed)
        }
        "processing" if !placeholder => Some(HealAction::MarkCompleted),
        _ => None,
    }
}

/// Oldest-first eviction plan: drop messages from the front while the running
/// total exceeds the threshold, never going below the retained-message floor.
/// Returns the ids to delete and the total after eviction.
fn plan_eviction(messages: &[(String, i64)], threshold: i64, floor: usize) -> (Vec<String>, i64) {
    let mut total: i64 = messages.iter().map(|(_, t)| t).sum();
    let mut remaining = messages.len();
    let mut evict = Vec::new();
    for (id, tokens) in messages {
        if total <= threshold || remaining <= floor {
            break;
        }
        evict.push(id.clone());
        total -= tokens;
        remaining -= 1;
    }
    (evict, total)
}

/// Record-id resolution chain for callbacks: query param, then path segment,
/// then a marker embedded in the body.
fn resolve_callback_record_id(
    query: &CallbackQuery,
    path_id: Option<&str>,
    body: &str,
) -> Option<String> {
    query
        .record_id
        .clone()
        .or_else(|| query.analysis_id.clone())
        .or_else(|| query.conversation_id.clone())
        .filter(|id| !id.trim().is_empty())
        .or_else(|| path_id.map(str::to_string).filter(|id| !id.trim().is_empty()))
        .or_else(|| extract_embedded_record_id(body))
}

/// Shapes a raw callback body into the value stored on the job record.
fn shape_callback_content(kind: JobKind, body: &str) -> Value {
    match kind {
        JobKind::AdCopy => match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => {
                if let Some(Value::Object(variations)) = map.get("variations") {
                    Value::Object(variations.clone())
                } else {
                    Value::Object(map)
                }
            }
            _ => Value::String(body.trim().to_string()),
        },
        JobKind::LinkedinAnalysis => {
            let sections = extract_analysis_sections(body);
            if sections.is_empty() {
                Value::String(format!("<div class=\"analysis-content\">{}</div>", body.trim()))
            } else {
                let map: Map<String, Value> = sections
                    .into_iter()
                    .map(|(title, html)| (title, Value::String(html)))
                    .collect();
                json!({ "sections": map })
            }
        }
        JobKind::SeoBrief | JobKind::Ga4Report => Value::String(body.trim().to_string()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn auth_user_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<UserProfile, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        ));
    };
    let row = sqlx::query(
        "SELECT u.id, u.email, u.name FROM auth_tokens t JOIN users u ON u.id = t.user_id \
         WHERE t.token = $1",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    match row {
        Some(row) => Ok(UserProfile {
            id: row.get("id"),
            email: row.get("email"),
            name: row.get("name"),
        }),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or expired token" })),
        )),
    }
}

fn parse_job_row(row: sqlx::postgres::PgRow) -> WorkflowJob {
    WorkflowJob {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: row.get("kind"),
        params: row.get("params"),
        content: row.get("content"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn fetch_job(pool: &PgPool, record_id: &str) -> Option<WorkflowJob> {
    sqlx::query(
        "SELECT id, user_id, kind, params, content, status, created_at, updated_at \
         FROM workflow_jobs WHERE id = $1 AND deleted = FALSE",
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .map(parse_job_row)
}

async fn fetch_latest_job(pool: &PgPool, user_id: &str, kind: JobKind) -> Option<WorkflowJob> {
    sqlx::query(
        "SELECT id, user_id, kind, params, content, status, created_at, updated_at \
         FROM workflow_jobs WHERE user_id = $1 AND kind = $2 AND deleted = FALSE \
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(user_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .map(parse_job_row)
}

async fn persist_job_status(pool: &PgPool, record_id: &str, status: &str) {
    let result = sqlx::query("UPDATE workflow_jobs SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(record_id)
        .bind(status)
        .bind(now_iso())
        .execute(pool)
        .await;
    if let Err(err) = result {
        error!(record_id, status, "failed to persist job status: {err}");
    }
}

fn missing_required_params(kind: JobKind, params: &Value) -> Vec<&'static str> {
    kind.required_params()
        .iter()
        .filter(|name| {
            params
                .get(**name)
                .and_then(Value::as_str)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
        })
        .copied()
        .collect()
}

fn webhook_url_for(kind: JobKind) -> Result<String, String> {
    let var = kind.webhook_env_var();
    match env::var(var) {
        Ok(url) if !url.trim().is_empty() => Ok(url.trim().to_string()),
        _ => Err(format!("{var} not configured")),
    }
}

// ---------------------------------------------------------------------------
// Job submission

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(params): Json<Value>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    if !params.is_object() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "request body must be a JSON object" })),
        )
            .into_response();
    }
    let missing = missing_required_params(kind, &params);
    if !missing.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("missing required fields: {}", missing.join(", ")) })),
        )
            .into_response();
    }
    let webhook_url = match webhook_url_for(kind) {
        Ok(url) => url,
        Err(message) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response();
        }
    };

    let record_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let inserted = sqlx::query(
        "INSERT INTO workflow_jobs (id, user_id, kind, params, content, status, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'processing', $6, $6)",
    )
    .bind(&record_id)
    .bind(&user.id)
    .bind(kind.as_str())
    .bind(&params)
    .bind(Value::String(PLACEHOLDER_CONTENT.to_string()))
    .bind(&now)
    .execute(&state.db)
    .await;
    if let Err(err) = inserted {
        error!(kind = kind.as_str(), "failed to create job record: {err}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create job record" })),
        )
            .into_response();
    }

    let token = sign_callback_token(&state.callback_secret, &record_id);
    let callback_url = format!(
        "{}/api/jobs/{}/callback?recordId={}&token={}",
        state.public_base_url,
        kind.as_str().replace('_', "-"),
        record_id,
        token
    );
    let mut payload = params.as_object().cloned().unwrap_or_default();
    payload.insert("callbackUrl".to_string(), json!(callback_url));
    payload.insert("recordId".to_string(), json!(record_id));
    payload.insert("userId".to_string(), json!(user.id));

    info!(kind = kind.as_str(), %record_id, "dispatching job to workflow");
    let response = state
        .http_client
        .post(&webhook_url)
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .json(&Value::Object(payload))
        .send()
        .await;

    // On dispatch failure the placeholder record stays in place; the poller's
    // staleness rule reaps it later.
    match response {
        Ok(resp) if resp.status().is_success() => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Job submitted",
                "recordId": record_id
            })),
        )
            .into_response(),
        Ok(resp) => {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            warn!(kind = kind.as_str(), %record_id, %status, "workflow rejected job: {detail}");
            let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            (
                code,
                Json(json!({
                    "error": format!("workflow returned {status}"),
                    "detail": detail,
                    "recordId": record_id
                })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(kind = kind.as_str(), %record_id, "workflow dispatch failed: {err}");
            let code = if err.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            (
                code,
                Json(json!({ "error": format!("failed to reach workflow: {err}"), "recordId": record_id })),
            )
                .into_response()
        }
    }
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    let rows = sqlx::query(
        "SELECT id, kind, params, status, created_at, updated_at FROM workflow_jobs \
         WHERE user_id = $1 AND kind = $2 AND deleted = FALSE \
         ORDER BY created_at DESC, id DESC",
    )
    .bind(&user.id)
    .bind(kind.as_str())
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let jobs = rows
        .into_iter()
        .map(|row| JobSummary {
            id: row.get("id"),
            kind: row.get("kind"),
            params: row.get("params"),
            status: row.get("status"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
        .collect::<Vec<_>>();
    Json(json!({ "jobs": jobs })).into_response()
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path((kind, record_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    if JobKind::parse(&kind).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    }
    let result = sqlx::query(
        "UPDATE workflow_jobs SET deleted = TRUE, updated_at = $3 \
         WHERE id = $1 AND user_id = $2 AND deleted = FALSE",
    )
    .bind(&record_id)
    .bind(&user.id)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    match result {
        Ok(outcome) if outcome.rows_affected() > 0 => {
            Json(json!({ "success": true })).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Status poller

async fn poll_job_record(state: &Arc<AppState>, job: WorkflowJob) -> Value {
    let mut status = job.status.clone();
    let created_at = DateTime::parse_from_rfc3339(&job.created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    if let Some(action) = healing_action(&job.status, &job.content, created_at, Utc::now()) {
        status = match action {
            HealAction::RevertToProcessing => "processing",
            HealAction::MarkFailed => "failed",
            HealAction::MarkCompleted => "completed",
        }
        .to_string();
        info!(
            record_id = %job.id,
            from = %job.status,
            to = %status,
            "healing inconsistent job record"
        );
        persist_job_status(&state.db, &job.id, &status).await;
    }
    match status.as_str() {
        "completed" => {
            let mut body = json!({
                "status": "completed",
                "recordId": job.id,
                "content": job.content
            });
            if job.kind == JobKind::AdCopy.as_str() {
                if let Value::Object(variations) = &job.content {
                    body["parsed"] = serde_json::to_value(parse_ad_copy_variations(variations))
                        .unwrap_or(Value::Null);
                }
            }
            body
        }
        "failed" => json!({
            "status": "failed",
            "recordId": job.id,
            "message": JOB_TIMEOUT_MESSAGE
        }),
        _ => json!({ "status": "processing", "recordId": job.id }),
    }
}

async fn job_status_latest(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    // Latest-wins read: a newer submission shadows older in-flight ones. Kept
    // for clients that do not track record ids; prefer the by-id route.
    let Some(job) = fetch_latest_job(&state.db, &user.id, kind).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no records found" })),
        )
            .into_response();
    };
    Json(poll_job_record(&state, job).await).into_response()
}

async fn job_status_by_id(
    State(state): State<Arc<AppState>>,
    Path((kind, record_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    let Some(job) = fetch_job(&state.db, &record_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        )
            .into_response();
    };
    if job.user_id != user.id || job.kind != kind.as_str() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        )
            .into_response();
    }
    Json(poll_job_record(&state, job).await).into_response()
}

// ---------------------------------------------------------------------------
// Callback router

async fn handle_job_callback(
    state: Arc<AppState>,
    kind: JobKind,
    path_id: Option<String>,
    query: CallbackQuery,
    body: Bytes,
) -> axum::response::Response {
    let body_text = String::from_utf8_lossy(&body).to_string();
    let Some(record_id) = resolve_callback_record_id(&query, path_id.as_deref(), &body_text) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing record id" })),
        )
            .into_response();
    };
    let token = query.token.unwrap_or_default();
    if !verify_callback_token(&state.callback_secret, &record_id, &token) {
        warn!(%record_id, "callback rejected: bad signature token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid callback token" })),
        )
            .into_response();
    }

    let trimmed = body_text.trim();
    if trimmed.is_empty() || trimmed == PLACEHOLDER_CONTENT {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid content received" })),
        )
            .into_response();
    }
    let content = shape_callback_content(kind, &body_text);
    if content_is_placeholder(&content) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid content received" })),
        )
            .into_response();
    }

    let result = sqlx::query(
        "UPDATE workflow_jobs SET content = $2, status = 'completed', updated_at = $3 \
         WHERE id = $1 AND kind = $4 AND deleted = FALSE",
    )
    .bind(&record_id)
    .bind(&content)
    .bind(now_iso())
    .bind(kind.as_str())
    .execute(&state.db)
    .await;
    match result {
        Ok(outcome) if outcome.rows_affected() > 0 => {
            info!(%record_id, kind = kind.as_str(), "callback stored job result");
            Json(json!({ "success": true })).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        )
            .into_response(),
        Err(err) => {
            error!(%record_id, "failed to store callback result: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to store result" })),
            )
                .into_response()
        }
    }
}

async fn job_callback(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    handle_job_callback(state, kind, None, query, body).await
}

async fn job_callback_with_id(
    State(state): State<Arc<AppState>>,
    Path((kind, record_id)): Path<(String, String)>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(kind) = JobKind::parse(&kind) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown job kind" })),
        )
            .into_response();
    };
    handle_job_callback(state, kind, Some(record_id), query, body).await
}

// ---------------------------------------------------------------------------
// Chat sessions

fn parse_session_row(row: sqlx::postgres::PgRow) -> ChatSessionRecord {
    ChatSessionRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        total_tokens: row.get("total_tokens"),
        is_processing: row.get("is_processing"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn fetch_session(pool: &PgPool, session_id: &str, user_id: &str) -> Option<ChatSessionRecord> {
    sqlx::query(
        "SELECT id, user_id, name, total_tokens, is_processing, is_active, created_at, updated_at \
         FROM chat_sessions WHERE id = $1 AND user_id = $2 AND is_active = TRUE",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .map(parse_session_row)
}

async fn fetch_session_messages(pool: &PgPool, session_id: &str) -> Vec<ChatMessageRecord> {
    let rows = sqlx::query(
        "SELECT id, session_id, role, content, tokens, created_at FROM chat_messages \
         WHERE session_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter()
        .map(|row| ChatMessageRecord {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: row.get("role"),
            content: row.get("content"),
            tokens: row.get("tokens"),
            created_at: row.get("created_at"),
        })
        .collect()
}

fn parse_file_row(row: sqlx::postgres::PgRow) -> ChatFileRecord {
    let sheet_names: Value = row.get("sheet_names");
    ChatFileRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        original_name: row.get("original_name"),
        stored_name: row.get("stored_name"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get("size_bytes"),
        status: row.get("status"),
        is_processed: row.get("is_processed"),
        sheet_names: serde_json::from_value(sheet_names).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

async fn fetch_session_files(pool: &PgPool, session_id: &str) -> Vec<ChatFileRecord> {
    let rows = sqlx::query(
        "SELECT id, session_id, original_name, stored_name, mime_type, size_bytes, status, \
                is_processed, sheet_names, created_at \
         FROM chat_files WHERE session_id = $1 ORDER BY created_at ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter().map(parse_file_row).collect()
}

async fn clear_processing_flag(pool: &PgPool, session_id: &str) {
    let result = sqlx::query(
        "UPDATE chat_sessions SET is_processing = FALSE, processing_started_at = NULL, updated_at = $2 \
         WHERE id = $1",
    )
    .bind(session_id)
    .bind(now_iso())
    .execute(pool)
    .await;
    if let Err(err) = result {
        error!(session_id, "failed to clear processing flag: {err}");
    }
}

async fn remove_stored_file(state: &Arc<AppState>, stored_name: &str) {
    let path = state.upload_storage_dir.join(stored_name);
    if let Err(err) = tokio::fs::remove_file(&path).await {
        warn!("failed to remove stored file {}: {err}", path.display());
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let session_id = Uuid::new_v4().to_string();
    let now = now_iso();
    let name = body
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "New chat".to_string());
    let result = sqlx::query(
        "INSERT INTO chat_sessions (id, user_id, name, total_tokens, is_processing, is_active, created_at, updated_at) \
         VALUES ($1, $2, $3, 0, FALSE, TRUE, $4, $4)",
    )
    .bind(&session_id)
    .bind(&user.id)
    .bind(&name)
    .bind(&now)
    .execute(&state.db)
    .await;
    if result.is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create session" })),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({ "sessionId": session_id, "name": name })),
    )
        .into_response()
}

async fn list_sessions(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let rows = sqlx::query(
        "SELECT id, user_id, name, total_tokens, is_processing, is_active, created_at, updated_at \
         FROM chat_sessions WHERE user_id = $1 AND is_active = TRUE ORDER BY updated_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let sessions = rows.into_iter().map(parse_session_row).collect::<Vec<_>>();
    Json(json!({ "sessions": sessions })).into_response()
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };
    let messages = fetch_session_messages(&state.db, &session.id).await;
    let files = fetch_session_files(&state.db, &session.id).await;
    Json(json!({ "session": session, "messages": messages, "files": files })).into_response()
}

async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RenameSessionBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name is required" })),
        )
            .into_response();
    }
    let result = sqlx::query(
        "UPDATE chat_sessions SET name = $3, updated_at = $4 \
         WHERE id = $1 AND user_id = $2 AND is_active = TRUE",
    )
    .bind(&session_id)
    .bind(&user.id)
    .bind(&name)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    match result {
        Ok(outcome) if outcome.rows_affected() > 0 => {
            Json(json!({ "success": true, "name": name })).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response(),
    }
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };
    let files = fetch_session_files(&state.db, &session.id).await;
    for file in &files {
        remove_stored_file(&state, &file.stored_name).await;
    }
    let _ = sqlx::query("DELETE FROM chat_files WHERE session_id = $1")
        .bind(&session.id)
        .execute(&state.db)
        .await;
    // Soft delete only; messages stay with the inactive session.
    let _ = sqlx::query(
        "UPDATE chat_sessions SET is_active = FALSE, is_processing = FALSE, updated_at = $2 WHERE id = $1",
    )
    .bind(&session.id)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    Json(json!({ "success": true })).into_response()
}

async fn reset_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };
    let files = fetch_session_files(&state.db, &session.id).await;
    for file in &files {
        remove_stored_file(&state, &file.stored_name).await;
    }
    let _ = sqlx::query("DELETE FROM chat_files WHERE session_id = $1")
        .bind(&session.id)
        .execute(&state.db)
        .await;
    let _ = sqlx::query("DELETE FROM chat_messages WHERE session_id = $1")
        .bind(&session.id)
        .execute(&state.db)
        .await;
    let _ = sqlx::query(
        "UPDATE chat_sessions SET total_tokens = 0, is_processing = FALSE, \
         processing_started_at = NULL, updated_at = $2 WHERE id = $1",
    )
    .bind(&session.id)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    Json(json!({ "success": true })).into_response()
}

async fn insert_chat_message(
    pool: &PgPool,
    session_id: &str,
    role: &str,
    content: &str,
) -> ChatMessageRecord {
    let message = ChatMessageRecord {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        tokens: estimate_tokens(content),
        created_at: now_iso(),
    };
    let result = sqlx::query(
        "INSERT INTO chat_messages (id, session_id, role, content, tokens, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(&message.role)
    .bind(&message.content)
    .bind(message.tokens)
    .bind(&message.created_at)
    .execute(pool)
    .await;
    if let Err(err) = result {
        error!(session_id, role, "failed to persist chat message: {err}");
    }
    message
}

/// Recomputes the token total, evicts oldest messages past the budget, and
/// stores the resulting total on the session.
async fn enforce_token_budget(pool: &PgPool, session_id: &str) -> i64 {
    let messages = fetch_session_messages(pool, session_id).await;
    let pairs = messages
        .iter()
        .map(|m| (m.id.clone(), m.tokens))
        .collect::<Vec<_>>();
    let (evict, total) = plan_eviction(&pairs, TOKEN_CLEANUP_THRESHOLD, MIN_RETAINED_MESSAGES);
    if !evict.is_empty() {
        info!(session_id, evicted = evict.len(), "token budget eviction");
        for id in &evict {
            let _ = sqlx::query("DELETE FROM chat_messages WHERE id = $1")
                .bind(id)
                .execute(pool)
                .await;
        }
    }
    let _ = sqlx::query("UPDATE chat_sessions SET total_tokens = $2, updated_at = $3 WHERE id = $1")
        .bind(session_id)
        .bind(total)
        .bind(now_iso())
        .execute(pool)
        .await;
    total
}

async fn dify_chat_completion(
    state: &Arc<AppState>,
    user_id: &str,
    query_text: &str,
    files: &[ChatFileRecord],
) -> Result<String, String> {
    let api_url = env::var("DIFY_API_URL")
        .unwrap_or_else(|_| "https://api.dify.ai/v1".to_string())
        .trim_end_matches('/')
        .to_string();
    let api_key = env::var("DIFY_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err("DIFY_API_KEY not configured".to_string());
    }
    let endpoint = format!("{api_url}/chat-messages");

    let response = if files.is_empty() {
        state
            .http_client
            .post(&endpoint)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .json(&json!({
                "inputs": {},
                "query": query_text,
                "response_mode": "blocking",
                "user": user_id
            }))
            .send()
            .await
    } else {
        let mut form = reqwest::multipart::Form::new()
            .text("query", query_text.to_string())
            .text("response_mode", "blocking")
            .text("user", user_id.to_string());
        for file in files {
            let path = state.upload_storage_dir.join(&file.stored_name);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|err| format!("failed to read stored file {}: {err}", file.original_name))?;
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file.original_name.clone())
                .mime_str(&file.mime_type)
                .map_err(|err| format!("bad mime type for {}: {err}", file.original_name))?;
            form = form.part("files", part);
        }
        state
            .http_client
            .post(&endpoint)
            .bearer_auth(&api_key)
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .multipart(form)
            .send()
            .await
    };

    let response = response.map_err(|err| {
        if err.is_timeout() {
            "assistant request timed out".to_string()
        } else {
            format!("assistant request failed: {err}")
        }
    })?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("assistant returned {status}: {body}"));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("assistant response parse failed: {err}"))?;
    let answer = payload
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if answer.is_empty() {
        return Err("assistant response had empty answer".to_string());
    }
    Ok(answer)
}

async fn send_chat_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendChatMessageBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    if body.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message is required" })),
        )
            .into_response();
    }
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };

    // Atomic busy-flag acquisition: succeeds only when the flag is clear or
    // stale past the 30s override, so concurrent tabs cannot race past it.
    let now = Utc::now();
    let stale_cutoff = (now - ChronoDuration::seconds(CHAT_BUSY_STALENESS_SECS)).to_rfc3339();
    let acquired = sqlx::query(
        "UPDATE chat_sessions SET is_processing = TRUE, processing_started_at = $2, updated_at = $2 \
         WHERE id = $1 AND is_active = TRUE \
           AND (is_processing = FALSE OR processing_started_at IS NULL OR processing_started_at < $3) \
         RETURNING id",
    )
    .bind(&session.id)
    .bind(now.to_rfc3339())
    .bind(&stale_cutoff)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    if acquired.is_none() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Session is busy" })),
        )
            .into_response();
    }

    let user_message = insert_chat_message(&state.db, &session.id, "user", body.message.trim()).await;

    // Explicitly named unprocessed files, or every unprocessed file by default.
    let all_files = fetch_session_files(&state.db, &session.id).await;
    let selected_files = all_files
        .into_iter()
        .filter(|f| !f.is_processed)
        .filter(|f| body.file_ids.is_empty() || body.file_ids.contains(&f.id))
        .collect::<Vec<_>>();
    if !selected_files.is_empty() {
        for file in &selected_files {
            let _ = sqlx::query("UPDATE chat_files SET status = 'processing' WHERE id = $1")
                .bind(&file.id)
                .execute(&state.db)
                .await;
        }
    }

    let answer = dify_chat_completion(&state, &user.id, body.message.trim(), &selected_files).await;

    let answer = match answer {
        Ok(answer) => answer,
        Err(message) => {
            // Busy flag is released on every exit path; the 30s staleness
            // override is the second line of defense, not the first.
            for file in &selected_files {
                let _ = sqlx::query("UPDATE chat_files SET status = 'error' WHERE id = $1")
                    .bind(&file.id)
                    .execute(&state.db)
                    .await;
            }
            enforce_token_budget(&state.db, &session.id).await;
            clear_processing_flag(&state.db, &session.id).await;
            warn!(session_id = %session.id, "chat completion failed: {message}");
            let code = if message.contains("timed out") {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            return (code, Json(json!({ "error": message }))).into_response();
        }
    };

    // All-or-nothing processed marking, only after a successful response.
    for file in &selected_files {
        let _ = sqlx::query(
            "UPDATE chat_files SET status = 'processed', is_processed = TRUE WHERE id = $1",
        )
        .bind(&file.id)
        .execute(&state.db)
        .await;
    }

    let assistant_message = insert_chat_message(&state.db, &session.id, "assistant", &answer).await;
    let total_tokens = enforce_token_budget(&state.db, &session.id).await;
    clear_processing_flag(&state.db, &session.id).await;

    Json(json!({
        "success": true,
        "userMessage": user_message,
        "assistantMessage": assistant_message,
        "totalTokens": total_tokens
    }))
    .into_response()
}

async fn upload_session_file(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };

    let mut uploaded = Vec::<ChatFileRecord>::new();
    let mut sheet_names = Vec::<String>::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().unwrap_or("").to_string();
        if field_name == "sheetNames" {
            if let Ok(text) = field.text().await {
                sheet_names = serde_json::from_str(&text).unwrap_or_default();
            }
            continue;
        }
        if field_name != "file" && field_name != "files" {
            continue;
        }
        let original_name = field.file_name().unwrap_or("upload.bin").to_string();
        let mime_type = field
            .content_type()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = match field.bytes().await {
            Ok(b) if !b.is_empty() => b,
            _ => continue,
        };
        let stored_name = stored_file_name(&original_name);
        let path = state.upload_storage_dir.join(&stored_name);
        if let Err(err) = tokio::fs::write(&path, &bytes).await {
            error!("failed to store uploaded file: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to store uploaded file" })),
            )
                .into_response();
        }
        let record = ChatFileRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            original_name,
            stored_name,
            mime_type,
            size_bytes: bytes.len() as i64,
            status: "pending".to_string(),
            is_processed: false,
            sheet_names: sheet_names.clone(),
            created_at: now_iso(),
        };
        let result = sqlx::query(
            "INSERT INTO chat_files (id, session_id, original_name, stored_name, mime_type, \
             size_bytes, status, is_processed, sheet_names, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $9)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.original_name)
        .bind(&record.stored_name)
        .bind(&record.mime_type)
        .bind(record.size_bytes)
        .bind(&record.status)
        .bind(serde_json::to_value(&record.sheet_names).unwrap_or(Value::Array(vec![])))
        .bind(&record.created_at)
        .execute(&state.db)
        .await;
        if result.is_err() {
            remove_stored_file(&state, &record.stored_name).await;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to record uploaded file" })),
            )
                .into_response();
        }
        uploaded.push(record);
    }

    if uploaded.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing file field in multipart form" })),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(json!({ "files": uploaded }))).into_response()
}

async fn delete_session_file(
    State(state): State<Arc<AppState>>,
    Path((session_id, file_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(session) = fetch_session(&state.db, &session_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "session not found" })),
        )
            .into_response();
    };
    let row = sqlx::query("SELECT stored_name FROM chat_files WHERE id = $1 AND session_id = $2")
        .bind(&file_id)
        .bind(&session.id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "file not found" })),
        )
            .into_response();
    };
    let stored_name: String = row.get("stored_name");
    remove_stored_file(&state, &stored_name).await;
    let _ = sqlx::query("DELETE FROM chat_files WHERE id = $1")
        .bind(&file_id)
        .execute(&state.db)
        .await;
    Json(json!({ "success": true })).into_response()
}

// ---------------------------------------------------------------------------
// Prompt templates

fn parse_template_row(row: sqlx::postgres::PgRow) -> PromptTemplate {
    let variables: Value = row.get("variables");
    PromptTemplate {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        content: row.get("content"),
        variables: serde_json::from_value(variables).unwrap_or_default(),
        is_public: row.get("is_public"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn fetch_template_for_read(
    pool: &PgPool,
    template_id: &str,
    user_id: &str,
) -> Option<PromptTemplate> {
    sqlx::query(
        "SELECT id, user_id, name, content, variables, is_public, created_at, updated_at \
         FROM prompt_templates WHERE id = $1 AND (user_id = $2 OR is_public = TRUE)",
    )
    .bind(template_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .map(parse_template_row)
}

async fn list_templates(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let rows = sqlx::query(
        "SELECT id, user_id, name, content, variables, is_public, created_at, updated_at \
         FROM prompt_templates WHERE user_id = $1 OR is_public = TRUE ORDER BY updated_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let templates = rows.into_iter().map(parse_template_row).collect::<Vec<_>>();
    Json(json!({ "templates": templates })).into_response()
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name is required" })),
        )
            .into_response();
    }
    let template = PromptTemplate {
        id: Uuid::new_v4().to_string(),
        user_id: user.id,
        name,
        content: body.content,
        variables: body.variables,
        is_public: body.is_public,
        created_at: now_iso(),
        updated_at: now_iso(),
    };
    let result = sqlx::query(
        "INSERT INTO prompt_templates (id, user_id, name, content, variables, is_public, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&template.id)
    .bind(&template.user_id)
    .bind(&template.name)
    .bind(&template.content)
    .bind(serde_json::to_value(&template.variables).unwrap_or(Value::Array(vec![])))
    .bind(template.is_public)
    .bind(&template.created_at)
    .bind(&template.updated_at)
    .execute(&state.db)
    .await;
    if result.is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create template" })),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(json!({ "template": template }))).into_response()
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    match fetch_template_for_read(&state.db, &template_id, &user.id).await {
        Some(template) => Json(json!({ "template": template })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response(),
    }
}

async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateTemplateBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let existing = sqlx::query(
        "SELECT id, user_id, name, content, variables, is_public, created_at, updated_at \
         FROM prompt_templates WHERE id = $1 AND user_id = $2",
    )
    .bind(&template_id)
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .map(parse_template_row);
    let Some(mut template) = existing else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response();
    };
    if let Some(name) = body.name {
        let name = name.trim().to_string();
        if !name.is_empty() {
            template.name = name;
        }
    }
    if let Some(content) = body.content {
        template.content = content;
    }
    if let Some(variables) = body.variables {
        template.variables = variables;
    }
    if let Some(is_public) = body.is_public {
        template.is_public = is_public;
    }
    template.updated_at = now_iso();
    let result = sqlx::query(
        "UPDATE prompt_templates SET name = $2, content = $3, variables = $4, is_public = $5, updated_at = $6 \
         WHERE id = $1",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.content)
    .bind(serde_json::to_value(&template.variables).unwrap_or(Value::Array(vec![])))
    .bind(template.is_public)
    .bind(&template.updated_at)
    .execute(&state.db)
    .await;
    if result.is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to update template" })),
        )
            .into_response();
    }
    Json(json!({ "template": template })).into_response()
}

async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let result = sqlx::query("DELETE FROM prompt_templates WHERE id = $1 AND user_id = $2")
        .bind(&template_id)
        .bind(&user.id)
        .execute(&state.db)
        .await;
    match result {
        Ok(outcome) if outcome.rows_affected() > 0 => {
            Json(json!({ "success": true })).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response(),
    }
}

async fn render_template_endpoint(
    State(state): State<Arc<AppState>>,
    Path(template_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RenderTemplateBody>,
) -> impl IntoResponse {
    let user = match auth_user_from_headers(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let Some(template) = fetch_template_for_read(&state.db, &template_id, &user.id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response();
    };
    match render_template(&template.content, &template.variables, &body.values) {
        Ok(rendered) => Json(json!({ "rendered": rendered })).into_response(),
        Err(message) => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Auth

async fn register_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    if email.is_empty() || !email.contains('@') || body.password.len() < 8 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "valid email and a password of at least 8 characters are required" })),
        )
            .into_response();
    }
    let allow_list = env::var("ALLOWED_EMAIL_DOMAINS").unwrap_or_default();
    if !email_domain_allowed(&email, &allow_list) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "email domain is not allowed" })),
        )
            .into_response();
    }
    let Ok(password_hash) = hash(&body.password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to hash password" })),
        )
            .into_response();
    };
    let user_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&user_id)
    .bind(&email)
    .bind(body.name.trim())
    .bind(&password_hash)
    .bind(now_iso())
    .execute(&state.db)
    .await;
    if inserted.is_err() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "email already registered" })),
        )
            .into_response();
    }
    let token = issue_auth_token(&state.db, &user_id).await;
    (
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "user": { "id": user_id, "email": email, "name": body.name.trim() }
        })),
    )
        .into_response()
}

async fn issue_auth_token(pool: &PgPool, user_id: &str) -> String {
    let token = Uuid::new_v4().to_string();
    let result = sqlx::query("INSERT INTO auth_tokens (token, user_id, created_at) VALUES ($1, $2, $3)")
        .bind(&token)
        .bind(user_id)
        .bind(now_iso())
        .execute(pool)
        .await;
    if let Err(err) = result {
        error!(user_id, "failed to issue auth token: {err}");
    }
    token
}

async fn login_user(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let row = sqlx::query("SELECT id, email, name, password_hash FROM users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten();
    let Some(row) = row else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    };
    let password_hash: String = row.get("password_hash");
    if !verify(&body.password, &password_hash).unwrap_or(false) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }
    let user_id: String = row.get("id");
    let token = issue_auth_token(&state.db, &user_id).await;
    Json(json!({
        "token": token,
        "user": {
            "id": user_id,
            "email": row.get::<String, _>("email"),
            "name": row.get::<String, _>("name")
        }
    }))
    .into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    match auth_user_from_headers(&state, &headers).await {
        Ok(user) => Json(json!({ "user": user })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(register_user))
        .route("/api/auth/login", post(login_user))
        .route("/api/auth/me", get(get_me))
        .route("/api/jobs/{kind}", get(list_jobs).post(submit_job))
        .route("/api/jobs/{kind}/status", get(job_status_latest))
        .route("/api/jobs/{kind}/callback", post(job_callback))
        .route(
            "/api/jobs/{kind}/callback/{record_id}",
            post(job_callback_with_id),
        )
        .route(
            "/api/jobs/{kind}/{record_id}/status",
            get(job_status_by_id),
        )
        .route(
            "/api/jobs/{kind}/{record_id}",
            axum::routing::delete(delete_job),
        )
        .route("/api/chat/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/chat/sessions/{session_id}",
            get(get_session)
                .patch(rename_session)
                .delete(delete_session),
        )
        .route("/api/chat/sessions/{session_id}/reset", post(reset_session))
        .route(
            "/api/chat/sessions/{session_id}/message",
            post(send_chat_message),
        )
        .route(
            "/api/chat/sessions/{session_id}/files",
            post(upload_session_file),
        )
        .route(
            "/api/chat/sessions/{session_id}/files/{file_id}",
            axum::routing::delete(delete_session_file),
        )
        .route("/api/templates", get(list_templates).post(create_template))
        .route(
            "/api/templates/{template_id}",
            get(get_template)
                .put(update_template)
                .delete(delete_template),
        )
        .route(
            "/api/templates/{template_id}/render",
            post(render_template_endpoint),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketing_ops_server=info,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let upload_storage_dir = env::var("UPLOAD_STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./uploads"));
    let public_base_url = env::var("PUBLIC_BASE_URL")
        .or_else(|_| env::var("API_BASE_URL"))
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();
    let callback_secret = env::var("CALLBACK_SIGNING_SECRET")
        .unwrap_or_else(|_| "dev-callback-secret".to_string());

    if let Err(err) = tokio::fs::create_dir_all(&upload_storage_dir).await {
        panic!(
            "failed to create upload storage directory {}: {}",
            upload_storage_dir.display(),
            err
        );
    }
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        http_client: reqwest::Client::new(),
        upload_storage_dir,
        public_base_url,
        callback_secret,
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("marketing ops server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs_ago: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::seconds(secs_ago)
    }

    #[test]
    fn token_estimate_is_ceil_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn placeholder_detection() {
        assert!(content_is_placeholder(&Value::Null));
        assert!(content_is_placeholder(&json!("")));
        assert!(content_is_placeholder(&json!("  Processing...  ")));
        assert!(content_is_placeholder(&json!({})));
        assert!(!content_is_placeholder(&json!("<div>done</div>")));
        assert!(!content_is_placeholder(&json!({ "google_search_ad": "x" })));
    }

    #[test]
    fn completed_with_placeholder_reverts_to_processing() {
        let action = healing_action("completed", &json!("Processing..."), ts(10), Utc::now());
        assert_eq!(action, Some(HealAction::RevertToProcessing));
    }

    #[test]
    fn stale_processing_job_is_failed() {
        // 6 minutes old, still processing: flips to failed, never stays silent.
        let action = healing_action("processing", &json!("Processing..."), ts(360), Utc::now());
        assert_eq!(action, Some(HealAction::MarkFailed));
    }

    #[test]
    fn processing_with_real_content_completes() {
        let action = healing_action("processing", &json!("<div>result</div>"), ts(10), Utc::now());
        assert_eq!(action, Some(HealAction::MarkCompleted));
    }

    #[test]
    fn consistent_records_are_left_alone() {
        assert_eq!(
            healing_action("completed", &json!("<div>ok</div>"), ts(10), Utc::now()),
            None
        );
        assert_eq!(
            healing_action("processing", &json!("Processing..."), ts(10), Utc::now()),
            None
        );
        assert_eq!(
            healing_action("failed", &json!("Processing..."), ts(600), Utc::now()),
            None
        );
    }

    #[test]
    fn fresh_stale_boundary_uses_created_at() {
        // Just inside the window stays processing.
        assert_eq!(
            healing_action("processing", &json!("Processing..."), ts(JOB_STALENESS_SECS - 5), Utc::now()),
            None
        );
    }

    fn msgs(tokens: &[i64]) -> Vec<(String, i64)> {
        tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("m{i}"), *t))
            .collect()
    }

    #[test]
    fn eviction_removes_oldest_first() {
        let messages = msgs(&[5000, 3000, 2000, 1000]);
        let (evict, total) = plan_eviction(&messages, 8000, 2);
        assert_eq!(evict, vec!["m0".to_string()]);
        assert_eq!(total, 6000);
    }

    #[test]
    fn eviction_total_matches_remaining_sum() {
        let messages = msgs(&[4000, 4000, 4000, 500]);
        let (evict, total) = plan_eviction(&messages, 8000, 2);
        assert_eq!(evict, vec!["m0".to_string()]);
        let remaining: i64 = messages
            .iter()
            .filter(|(id, _)| !evict.contains(id))
            .map(|(_, t)| t)
            .sum();
        assert_eq!(total, remaining);
    }

    #[test]
    fn eviction_never_goes_below_floor() {
        let messages = msgs(&[9000, 9000, 9000]);
        let (evict, total) = plan_eviction(&messages, 8000, 2);
        assert_eq!(evict.len(), 1);
        assert_eq!(total, 18000);
        // Still over budget, but only two messages remain: no further eviction.
        let messages = msgs(&[9000, 9000]);
        let (evict, _) = plan_eviction(&messages, 8000, 2);
        assert!(evict.is_empty());
    }

    #[test]
    fn under_budget_evicts_nothing() {
        let messages = msgs(&[100, 200, 300]);
        let (evict, total) = plan_eviction(&messages, 8000, 2);
        assert!(evict.is_empty());
        assert_eq!(total, 600);
    }

    #[test]
    fn callback_token_roundtrip() {
        let token = sign_callback_token("secret", "record-1");
        assert!(verify_callback_token("secret", "record-1", &token));
        assert!(!verify_callback_token("secret", "record-2", &token));
        assert!(!verify_callback_token("other", "record-1", &token));
        assert!(!verify_callback_token("secret", "record-1", "not-hex"));
    }

    #[test]
    fn record_id_resolution_prefers_query_then_path_then_body() {
        let id = "9b2d6c1e-8f4a-4b6e-9d3c-2a1b0c9d8e7f";
        let query = CallbackQuery {
            record_id: Some("from-query".to_string()),
            analysis_id: None,
            conversation_id: None,
            token: None,
        };
        assert_eq!(
            resolve_callback_record_id(&query, Some("from-path"), "body").as_deref(),
            Some("from-query")
        );

        let empty = CallbackQuery {
            record_id: None,
            analysis_id: Some("from-analysis".to_string()),
            conversation_id: None,
            token: None,
        };
        assert_eq!(
            resolve_callback_record_id(&empty, Some("from-path"), "body").as_deref(),
            Some("from-analysis")
        );

        let none = CallbackQuery {
            record_id: None,
            analysis_id: None,
            conversation_id: None,
            token: None,
        };
        assert_eq!(
            resolve_callback_record_id(&none, Some("from-path"), "body").as_deref(),
            Some("from-path")
        );
        let body = format!(r#"<div data-record-id="{id}"></div>"#);
        assert_eq!(
            resolve_callback_record_id(&none, None, &body).as_deref(),
            Some(id)
        );
        assert_eq!(resolve_callback_record_id(&none, None, "nothing"), None);
    }

    #[test]
    fn ad_copy_callback_prefers_json_variations() {
        let body = r#"{"variations": {"google_search_ad": "<ad_copy>| A | B |</ad_copy>"}}"#;
        let shaped = shape_callback_content(JobKind::AdCopy, body);
        assert!(shaped.get("google_search_ad").is_some());

        let flat = r#"{"google_search_ad": "text"}"#;
        let shaped = shape_callback_content(JobKind::AdCopy, flat);
        assert!(shaped.get("google_search_ad").is_some());

        let shaped = shape_callback_content(JobKind::AdCopy, "plain text result");
        assert_eq!(shaped, json!("plain text result"));
    }

    #[test]
    fn linkedin_callback_extracts_sections_or_wraps() {
        let html = "<h2>Company Overview</h2><p>Acme.</p><h2>Audience</h2><p>Coyotes.</p>";
        let shaped = shape_callback_content(JobKind::LinkedinAnalysis, html);
        assert!(shaped["sections"].get("Company Overview").is_some());

        let shaped = shape_callback_content(JobKind::LinkedinAnalysis, "<p>no headings</p>");
        let text = shaped.as_str().expect("wrapped string");
        assert!(text.starts_with("<div class=\"analysis-content\">"));
    }

    #[test]
    fn report_callbacks_store_raw_text() {
        let shaped = shape_callback_content(JobKind::Ga4Report, " sessions: 1200 \n");
        assert_eq!(shaped, json!("sessions: 1200"));
    }

    #[test]
    fn placeholder_echo_would_be_rejected() {
        // A workflow echoing the unprocessed placeholder back must not complete
        // the record; the handler rejects before shaping.
        let shaped = shape_callback_content(JobKind::Ga4Report, "Processing...");
        assert!(content_is_placeholder(&shaped));
    }

    #[test]
    fn email_domain_allow_list() {
        assert!(email_domain_allowed("a@acme.com", "acme.com, example.org"));
        assert!(email_domain_allowed("a@EXAMPLE.ORG", "acme.com,example.org"));
        assert!(!email_domain_allowed("a@gmail.com", "acme.com"));
        // Unset allow-list admits everyone.
        assert!(email_domain_allowed("a@gmail.com", ""));
        assert!(!email_domain_allowed("not-an-email", "acme.com"));
    }

    #[test]
    fn missing_params_reported_per_kind() {
        let params = json!({ "campaign_name": "Acme Launch" });
        let missing = missing_required_params(JobKind::AdCopy, &params);
        assert_eq!(missing, vec!["landing_page_url"]);

        let params = json!({ "campaign_name": "Acme Launch", "landing_page_url": "https://acme.com" });
        assert!(missing_required_params(JobKind::AdCopy, &params).is_empty());

        let params = json!({ "keyword": "   " });
        assert_eq!(missing_required_params(JobKind::SeoBrief, &params), vec!["keyword"]);
    }

    #[test]
    fn stored_file_names_have_timestamp_random_ext() {
        let name = stored_file_name("report.XLSX");
        assert!(name.ends_with(".xlsx"));
        let stem = name.strip_suffix(".xlsx").expect("suffix");
        let (millis, random) = stem.split_once('-').expect("dash");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 12);

        assert!(stored_file_name("noext").ends_with(".bin"));
        assert!(stored_file_name("weird.tar.gz").ends_with(".gz"));
    }
}
