//! Management API: keys, safety policies, roles, tool governance and audit.
//!
//! Every handler runs behind identity resolution and checks its own
//! permission. Successful bodies are wrapped as `{"data": ...}`.

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use gateway_core::permission;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;

use super::router::AppState;
use crate::audit::{AuditFilter, ExportFormat};
use crate::identity::{NewApiKey, Principal};
use crate::rbac::{RoleInput, Scope};
use crate::safety::{DetectionFilter, PolicyInput};
use crate::tools::{
    ApprovalFilter, ApprovalRequest, Caller, ClassificationInput, GrantInput, ReviewInput,
};
use crate::{Error, Result};

type AppResult = Result<Response>;

fn data<T: Serialize>(value: T) -> Response {
    Json(json!({ "data": value })).into_response()
}

fn created<T: Serialize>(value: T) -> Response {
    (StatusCode::CREATED, Json(json!({ "data": value }))).into_response()
}

/// Parse an optional JSON body, treating an empty one as the default value
fn body_or_default<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

fn caller(p: &Principal) -> Caller<'_> {
    Caller {
        org_id: &p.org_id,
        subject: Some(p.subject()),
        team_id: p.team_id.as_deref(),
    }
}

/// Parse `global`, `org:<id>` or `team:<id>`
fn parse_scope(raw: &str) -> Result<Scope> {
    match raw.split_once(':') {
        None if raw == "global" => Ok(Scope::Global),
        Some(("org", id)) if !id.is_empty() => Ok(Scope::Org(id.to_string())),
        Some(("team", id)) if !id.is_empty() => Ok(Scope::Team(id.to_string())),
        _ => Err(Error::Validation(format!(
            "invalid scope '{raw}', expected global, org:<id> or team:<id>"
        ))),
    }
}

/// Management routes, to be mounted under the identity layer
pub fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/api-keys", post(create_key).get(list_keys))
        .route("/v1/api-keys/{id}", delete(revoke_key))
        .route("/v1/api-keys/{id}/rotate", post(rotate_key))
        .route("/v1/safety/policies", get(list_policies).post(create_policy))
        .route(
            "/v1/safety/policies/{id}",
            get(get_policy).put(update_policy).delete(delete_policy),
        )
        .route("/v1/safety/detections", get(list_detections))
        .route("/v1/safety/summary", get(safety_summary))
        .route("/v1/safety/test", post(test_safety))
        .route("/v1/roles", get(list_roles).post(create_role))
        .route("/v1/roles/{id}", get(get_role).put(update_role).delete(delete_role))
        .route("/v1/role-assignments", post(assign_role))
        .route("/v1/role-assignments/{id}", delete(revoke_assignment))
        .route("/v1/users/{id}/permissions", get(user_permissions))
        .route(
            "/v1/tools/classifications",
            get(list_classifications).put(set_classification),
        )
        .route(
            "/v1/tools/classifications/{server}/{tool}",
            delete(delete_classification),
        )
        .route("/v1/tools/approvals", get(list_approvals).post(request_approval))
        .route("/v1/tools/approvals/{id}", get(get_approval))
        .route("/v1/tools/approvals/{id}/approve", post(approve))
        .route("/v1/tools/approvals/{id}/deny", post(deny))
        .route("/v1/tools/permissions", get(list_grants).post(create_grant))
        .route("/v1/tools/permissions/{id}", delete(revoke_grant))
        .route("/v1/audit/logs", get(audit_logs))
        .route("/v1/audit/logs/{id}", get(audit_log))
        .route("/v1/audit/search", get(audit_search))
        .route("/v1/audit/stats", get(audit_stats))
        .route("/v1/audit/export", get(audit_export))
}

// ── API keys ──

async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(req): Json<NewApiKey>,
) -> AppResult {
    state.rbac.require(&p, permission::KEYS_CREATE).await?;
    // A key never carries more than its creator holds
    for perm in &req.permissions {
        if !state.rbac.principal_has(&p, perm).await? {
            return Err(Error::Forbidden(format!(
                "Cannot grant permission '{perm}' you do not hold"
            )));
        }
    }
    let issued = state
        .keys
        .create(&p.org_id, p.user_id.as_deref(), Some(p.subject()), req)
        .await?;
    Ok(created(issued))
}

async fn list_keys(State(state): State<Arc<AppState>>, Extension(p): Extension<Principal>) -> AppResult {
    state.rbac.require(&p, permission::KEYS_READ).await?;
    Ok(data(state.keys.store().list(&p.org_id).await?))
}

async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::KEYS_REVOKE).await?;
    Ok(data(state.keys.revoke(&p.org_id, &id).await?))
}

async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::KEYS_ROTATE).await?;
    Ok(created(state.keys.rotate(&p.org_id, &id, Some(p.subject())).await?))
}

// ── Safety ──

async fn list_policies(State(state): State<Arc<AppState>>, Extension(p): Extension<Principal>) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(state.safety.list_policies(&p.org_id).await?))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(state.safety.get_policy(&p.org_id, &id).await?))
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(input): Json<PolicyInput>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    Ok(created(
        state
            .safety
            .create_policy(&p.org_id, Some(p.subject()), input)
            .await?,
    ))
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
    Json(input): Json<PolicyInput>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    Ok(data(state.safety.update_policy(&p.org_id, &id, input).await?))
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    state.safety.delete_policy(&p.org_id, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_detections(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(mut filter): Query<DetectionFilter>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    filter.org_id = p.org_id.clone();
    Ok(data(state.safety.detections(&filter)))
}

async fn safety_summary(State(state): State<Arc<AppState>>, Extension(p): Extension<Principal>) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(state.safety.summary(&p.org_id)))
}

#[derive(Debug, Deserialize)]
struct SafetyTest {
    input: String,
    #[serde(default)]
    policy_id: Option<String>,
}

async fn test_safety(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(req): Json<SafetyTest>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(
        state
            .safety
            .test(&p.org_id, &req.input, req.policy_id.as_deref())
            .await?,
    ))
}

// ── Roles ──

async fn list_roles(State(state): State<Arc<AppState>>, Extension(p): Extension<Principal>) -> AppResult {
    state.rbac.require(&p, permission::RBAC_READ).await?;
    Ok(data(state.rbac.list_roles(&p.org_id).await?))
}

async fn get_role(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_READ).await?;
    Ok(data(state.rbac.get_role(&p.org_id, &id).await?))
}

async fn create_role(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(input): Json<RoleInput>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_ADMIN).await?;
    Ok(created(state.rbac.create_role(&p.org_id, input).await?))
}

async fn update_role(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
    Json(input): Json<RoleInput>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_ADMIN).await?;
    Ok(data(state.rbac.update_role(&p.org_id, &id, input).await?))
}

async fn delete_role(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_ADMIN).await?;
    Ok(data(state.rbac.delete_role(&p.org_id, &id).await?))
}

#[derive(Debug, Deserialize)]
struct AssignRole {
    user_id: String,
    role_id: String,
    #[serde(default)]
    scope: Scope,
}

async fn assign_role(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(req): Json<AssignRole>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_ADMIN).await?;
    Ok(created(
        state
            .rbac
            .assign_for(&p, &req.user_id, &req.role_id, req.scope)
            .await?,
    ))
}

async fn revoke_assignment(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_ADMIN).await?;
    Ok(data(state.rbac.revoke_assignment(&p.org_id, &id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScopeQuery {
    scope: Option<String>,
}

async fn user_permissions(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(user_id): Path<String>,
    Query(q): Query<ScopeQuery>,
) -> AppResult {
    state.rbac.require(&p, permission::RBAC_READ).await?;
    let scope = q.scope.as_deref().map(parse_scope).transpose()?;
    let permissions = state.rbac.user_permissions(&p.org_id, &user_id, scope.as_ref()).await?;
    Ok(data(json!({
        "user_id": user_id,
        "scope": scope.map(|s| s.to_string()),
        "permissions": permissions,
    })))
}

// ── Tool classifications ──

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerQuery {
    server: Option<String>,
}

async fn list_classifications(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(q): Query<ServerQuery>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(
        state
            .tools
            .list_classifications(&p.org_id, q.server.as_deref())
            .await?,
    ))
}

async fn set_classification(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(input): Json<ClassificationInput>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    Ok(data(
        state
            .tools
            .set_classification(&p.org_id, Some(p.subject()), input)
            .await?,
    ))
}

async fn delete_classification(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path((server, tool)): Path<(String, String)>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    state.tools.delete_classification(&p.org_id, &server, &tool).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Tool approvals ──

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(mut filter): Query<ApprovalFilter>,
) -> AppResult {
    state.rbac.require(&p, permission::APPROVALS_READ).await?;
    filter.org_id = p.org_id.clone();
    Ok(data(state.tools.list_approvals(&filter).await?))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::APPROVALS_READ).await?;
    Ok(data(state.tools.get_approval(&p.org_id, &id).await?))
}

async fn request_approval(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Extension(trace): Extension<super::trace::TraceContext>,
    Json(mut req): Json<ApprovalRequest>,
) -> AppResult {
    state.rbac.require(&p, permission::APPROVALS_REQUEST).await?;
    req.trace_id.get_or_insert(trace.trace_id);
    Ok(created(state.tools.request_approval(caller(&p), req).await?))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult {
    state.rbac.require(&p, permission::APPROVALS_REVIEW).await?;
    let review: ReviewInput = body_or_default(&body)?;
    Ok(data(state.tools.approve(&p.org_id, &id, p.subject(), review).await?))
}

async fn deny(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult {
    state.rbac.require(&p, permission::APPROVALS_REVIEW).await?;
    let review: ReviewInput = body_or_default(&body)?;
    Ok(data(state.tools.deny(&p.org_id, &id, p.subject(), review).await?))
}

// ── Tool permissions ──

async fn list_grants(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(q): Query<ServerQuery>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_READ).await?;
    Ok(data(
        state
            .tools
            .list_permissions(&p.org_id, q.server.as_deref())
            .await?,
    ))
}

async fn create_grant(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Json(input): Json<GrantInput>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    Ok(created(
        state.tools.grant(&p.org_id, Some(p.subject()), input).await?,
    ))
}

async fn revoke_grant(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::POLICIES_ADMIN).await?;
    state.tools.revoke(&p.org_id, &id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Audit ──

async fn audit_logs(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(mut filter): Query<AuditFilter>,
) -> AppResult {
    state.rbac.require(&p, permission::AUDIT_READ).await?;
    filter.org_id = p.org_id.clone();
    Ok(data(state.audit.store().query(&filter)))
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Path(id): Path<String>,
) -> AppResult {
    state.rbac.require(&p, permission::AUDIT_READ).await?;
    let log = state
        .audit
        .store()
        .get(&p.org_id, &id)
        .ok_or_else(|| Error::NotFound(format!("Audit log '{id}' not found")))?;
    Ok(data(log))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
}

async fn audit_search(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(search): Query<SearchQuery>,
    Query(mut filter): Query<AuditFilter>,
) -> AppResult {
    state.rbac.require(&p, permission::AUDIT_READ).await?;
    if search.q.trim().is_empty() {
        return Err(Error::Validation("q is required".to_string()));
    }
    filter.org_id = p.org_id.clone();
    Ok(data(state.audit.store().search(&search.q, &filter)))
}

async fn audit_stats(State(state): State<Arc<AppState>>, Extension(p): Extension<Principal>) -> AppResult {
    state.rbac.require(&p, permission::AUDIT_READ).await?;
    Ok(data(state.audit.store().stats(&p.org_id)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportQuery {
    format: ExportFormat,
}

async fn audit_export(
    State(state): State<Arc<AppState>>,
    Extension(p): Extension<Principal>,
    Query(export): Query<ExportQuery>,
    Query(mut filter): Query<AuditFilter>,
) -> AppResult {
    state.rbac.require(&p, permission::AUDIT_EXPORT).await?;
    filter.org_id = p.org_id.clone();
    let body = state.audit.store().export(&filter, export.format)?;
    let filename = match export.format {
        ExportFormat::Json => "audit-logs.json",
        ExportFormat::Csv => "audit-logs.csv",
    };
    Ok((
        [
            (header::CONTENT_TYPE, export.format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}
