//! End-to-end tests of tool governance
//!
//! Covers risk classification, the approval workflow and tool grants as
//! seen by a caller going through `POST /v1/mcp/{server}/tools/call`.

mod common;

use axum::http::StatusCode;
use common::{ADMIN_KEY, CALLER_KEY, OTHER_ORG_KEY, call_tool, gateway, send};
use pretty_assertions::assert_eq;
use serde_json::json;

// ── Classification ──

/// Dangerous tools are refused without a grant
#[tokio::test]
async fn test_dangerous_tool_is_denied() {
    let gw = gateway().await;

    let reply = call_tool(&gw, CALLER_KEY, "execute_command", json!({"cmd": "rm -rf /"})).await;

    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.error_code(), Some("tool_access_denied"));
    assert!(reply.header("x-mcp-server").is_none());
}

/// An org classification overrides the default table until it is deleted
#[tokio::test]
async fn test_classification_override_and_reset() {
    let gw = gateway().await;

    // GIVEN: write_file is sensitive by default and needs approval
    let denied = call_tool(&gw, CALLER_KEY, "write_file", json!({"path": "/tmp/x"})).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    // WHEN: the organization classifies it as safe
    let set = send(
        &gw,
        "PUT",
        "/v1/tools/classifications",
        Some(ADMIN_KEY),
        Some(json!({"server": "fs", "tool": "write_file", "risk": "safe"})),
    )
    .await;
    assert_eq!(set.status, StatusCode::OK);
    assert_eq!(set.body["data"]["requires_approval"], false);

    // THEN: the call goes through
    let allowed = call_tool(&gw, CALLER_KEY, "write_file", json!({"path": "/tmp/x"})).await;
    assert_eq!(allowed.status, StatusCode::OK);

    // AND: deleting the classification restores the default
    let deleted = send(
        &gw,
        "DELETE",
        "/v1/tools/classifications/fs/write_file",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    let denied = call_tool(&gw, CALLER_KEY, "write_file", json!({"path": "/tmp/x"})).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
}

/// Classifications are per organization
#[tokio::test]
async fn test_classification_does_not_leak_across_orgs() {
    let gw = gateway().await;

    let set = send(
        &gw,
        "PUT",
        "/v1/tools/classifications",
        Some(OTHER_ORG_KEY),
        Some(json!({"server": "fs", "tool": "write_file", "risk": "safe"})),
    )
    .await;
    assert_eq!(set.status, StatusCode::OK);

    let reply = call_tool(&gw, CALLER_KEY, "write_file", json!({})).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
}

// ── Approvals ──

/// Request, review and use of an approval for a sensitive tool
#[tokio::test]
async fn test_approval_workflow_unlocks_sensitive_tool() {
    let gw = gateway().await;

    // GIVEN: alice files a request for write_file
    let requested = send(
        &gw,
        "POST",
        "/v1/tools/approvals",
        Some(CALLER_KEY),
        Some(json!({"server": "fs", "tool": "write_file", "reason": "deploy config"})),
    )
    .await;
    assert_eq!(requested.status, StatusCode::CREATED);
    let approval = &requested.body["data"];
    assert_eq!(approval["status"], "pending");
    assert_eq!(approval["requested_by"], "alice");
    assert_eq!(approval["team_id"], "platform");
    assert!(approval["trace_id"].as_str().unwrap().starts_with("tr_"));
    let id = approval["id"].as_str().unwrap().to_string();

    // A pending request does not unlock anything
    let pending = call_tool(&gw, CALLER_KEY, "write_file", json!({})).await;
    assert_eq!(pending.status, StatusCode::FORBIDDEN);

    // Reviewing needs approvals:review
    let self_review = send(
        &gw,
        "POST",
        &format!("/v1/tools/approvals/{id}/approve"),
        Some(CALLER_KEY),
        None,
    )
    .await;
    assert_eq!(self_review.status, StatusCode::FORBIDDEN);

    // WHEN: an admin approves it for an hour
    let approved = send(
        &gw,
        "POST",
        &format!("/v1/tools/approvals/{id}/approve"),
        Some(ADMIN_KEY),
        Some(json!({"note": "ok for today", "expires_in": 3600})),
    )
    .await;
    assert_eq!(approved.status, StatusCode::OK);
    assert_eq!(approved.body["data"]["status"], "approved");
    assert_eq!(approved.body["data"]["reviewed_by"], "root");
    assert!(approved.body["data"]["expires_at"].is_string());

    // THEN: alice may call the tool
    let allowed = call_tool(&gw, CALLER_KEY, "write_file", json!({"path": "/tmp/x"})).await;
    assert_eq!(allowed.status, StatusCode::OK);

    // AND: the request cannot be reviewed twice
    let again = send(
        &gw,
        "POST",
        &format!("/v1/tools/approvals/{id}/deny"),
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(again.status, StatusCode::BAD_REQUEST);
}

/// Approvals are filtered by status and hidden from other organizations
#[tokio::test]
async fn test_approval_listing_and_isolation() {
    let gw = gateway().await;

    let requested = send(
        &gw,
        "POST",
        "/v1/tools/approvals",
        Some(CALLER_KEY),
        Some(json!({"server": "fs", "tool": "send_email"})),
    )
    .await;
    let id = requested.body["data"]["id"].as_str().unwrap().to_string();

    let pending = send(
        &gw,
        "GET",
        "/v1/tools/approvals?statuses=pending",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(pending.status, StatusCode::OK);
    assert_eq!(pending.body["data"]["total"], 1);
    assert_eq!(pending.body["data"]["approvals"][0]["id"], id.as_str());

    let approved = send(
        &gw,
        "GET",
        "/v1/tools/approvals?statuses=approved,denied",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(approved.body["data"]["total"], 0);

    let foreign = send(
        &gw,
        "GET",
        &format!("/v1/tools/approvals/{id}"),
        Some(OTHER_ORG_KEY),
        None,
    )
    .await;
    assert_eq!(foreign.status, StatusCode::NOT_FOUND);
}

// ── Grants ──

/// A team grant admits dangerous tools until its daily cap is used up
#[tokio::test]
async fn test_team_grant_with_daily_cap() {
    let gw = gateway().await;

    // GIVEN: a wildcard grant for alice's team, one use per day
    let granted = send(
        &gw,
        "POST",
        "/v1/tools/permissions",
        Some(ADMIN_KEY),
        Some(json!({"team_id": "platform", "server": "fs", "tool": "*", "max_uses_per_day": 1})),
    )
    .await;
    assert_eq!(granted.status, StatusCode::CREATED);
    let grant_id = granted.body["data"]["id"].as_str().unwrap().to_string();

    // WHEN: alice calls a dangerous tool twice
    let first = call_tool(&gw, CALLER_KEY, "execute_command", json!({"cmd": "ls"})).await;
    let second = call_tool(&gw, CALLER_KEY, "execute_command", json!({"cmd": "ls"})).await;

    // THEN: only the first call is admitted
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::FORBIDDEN);
    assert_eq!(second.error_code(), Some("tool_access_denied"));

    // AND: the grant can be revoked
    let revoked = send(
        &gw,
        "DELETE",
        &format!("/v1/tools/permissions/{grant_id}"),
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(revoked.status, StatusCode::NO_CONTENT);
}

/// A grant must name exactly one grantee
#[tokio::test]
async fn test_grant_requires_single_grantee() {
    let gw = gateway().await;

    let reply = send(
        &gw,
        "POST",
        "/v1/tools/permissions",
        Some(ADMIN_KEY),
        Some(json!({"server": "fs", "tool": "*"})),
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.error_code(), Some("validation_error"));
}
