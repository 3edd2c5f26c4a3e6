//! Policy evaluation and detection recording.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::detections::{
    DetectionFilter, DetectionLog, DetectionPage, DetectionSink, InjectionDetection,
    SafetySummary, truncate_input,
};
use super::extract::collect_text;
use super::matcher::{CompiledPolicy, PolicyVerdict};
use super::policy::{
    DEFAULT_POLICY_ID, DetectionType, PolicyInput, PolicyStore, SafetyMode, SafetyPolicy,
    Severity,
};
use crate::config::SafetyConfig;
use crate::worker::WorkerQueue;
use crate::{Error, Result};

/// Verdict of one detection run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Whether anything was detected
    pub detected: bool,
    /// Category
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DetectionType>,
    /// Severity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Pattern that matched (never returned to MCP callers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_matched: Option<String>,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Mode to apply
    pub action: SafetyMode,
    /// Human-readable summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Policy that produced the verdict
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

impl DetectionResult {
    fn clean(policy_id: Option<String>, message: Option<&str>) -> Self {
        Self {
            detected: false,
            kind: None,
            severity: None,
            pattern_matched: None,
            confidence: 0.0,
            action: SafetyMode::Log,
            message: message.map(ToString::to_string),
            policy_id,
        }
    }

    /// Whether the request must be rejected
    #[must_use]
    pub fn blocks(&self) -> bool {
        self.detected && self.action == SafetyMode::Block
    }
}

/// Request attributes stored alongside a detection
#[derive(Debug, Clone, Default)]
pub struct DetectContext {
    /// Organization
    pub org_id: String,
    /// MCP server
    pub server: Option<String>,
    /// Tool
    pub tool: Option<String>,
    /// Trace id
    pub trace_id: Option<String>,
    /// Span id
    pub span_id: Option<String>,
    /// API key
    pub key_id: Option<String>,
    /// Client IP
    pub ip_address: Option<String>,
}

/// Evaluates payloads against an organization's safety policies.
pub struct SafetyDetector {
    policies: Arc<dyn PolicyStore>,
    log: Arc<DetectionLog>,
    persist: WorkerQueue<InjectionDetection>,
    compiled: DashMap<String, Arc<CompiledPolicy>>,
    default_policy: Arc<CompiledPolicy>,
}

impl SafetyDetector {
    /// Create a detector. Detections are persisted to `sink` through a
    /// background queue; must be called within a Tokio runtime.
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        log: Arc<DetectionLog>,
        sink: Arc<dyn DetectionSink>,
        queue_capacity: usize,
    ) -> Self {
        let persist = WorkerQueue::spawn("detections", queue_capacity, move |d: InjectionDetection| {
            let sink = Arc::clone(&sink);
            async move {
                let id = d.id.clone();
                if let Err(e) = sink.record(d).await {
                    warn!(detection = %id, error = %e, "Failed to persist injection detection");
                }
            }
        });
        Self {
            policies,
            log,
            persist,
            compiled: DashMap::new(),
            default_policy: Arc::new(CompiledPolicy::compile(SafetyPolicy::builtin_default())),
        }
    }

    /// Detector persisting into its own in-memory log
    pub fn in_memory(policies: Arc<dyn PolicyStore>, config: &SafetyConfig) -> Self {
        let log = Arc::new(DetectionLog::new(config.max_detections));
        Self::new(
            policies,
            Arc::clone(&log),
            log as Arc<dyn DetectionSink>,
            config.queue_capacity,
        )
    }

    // ── Evaluation ──

    /// Evaluate `text` for `org_id` without recording anything.
    ///
    /// Enabled policies covering `server` run in creation order and the first
    /// one with a verdict wins. An organization without policies gets the
    /// built-in default.
    pub async fn evaluate(&self, org_id: &str, server: Option<&str>, text: &str) -> Result<DetectionResult> {
        if text.trim().is_empty() {
            return Ok(DetectionResult::clean(None, None));
        }
        let policies = self.policies.list(org_id).await?;
        if policies.is_empty() {
            return Ok(verdict(&self.default_policy, text));
        }
        for policy in policies.into_iter().filter(|p| p.enabled && p.applies_to(server)) {
            let compiled = self.compiled(policy);
            let result = verdict(&compiled, text);
            if result.detected || result.message.is_some() {
                return Ok(result);
            }
        }
        Ok(DetectionResult::clean(None, None))
    }

    /// Evaluate `text` and record a detection if one is found
    pub async fn detect(&self, ctx: &DetectContext, text: &str) -> Result<DetectionResult> {
        let result = self.evaluate(&ctx.org_id, ctx.server.as_deref(), text).await?;
        if result.detected {
            self.record(ctx, text, &result);
        }
        Ok(result)
    }

    /// [`detect`](Self::detect) over every string leaf of a JSON payload
    pub async fn detect_value(&self, ctx: &DetectContext, payload: &Value) -> Result<DetectionResult> {
        self.detect(ctx, &collect_text(payload)).await
    }

    /// Dry run against one policy (or the org's set when `policy_id` is absent)
    pub async fn test(&self, org_id: &str, input: &str, policy_id: Option<&str>) -> Result<DetectionResult> {
        match policy_id {
            None => self.evaluate(org_id, None, input).await,
            Some(DEFAULT_POLICY_ID) => Ok(verdict(&self.default_policy, input)),
            Some(id) => {
                let policy = self.get_policy(org_id, id).await?;
                Ok(verdict(&self.compiled(policy), input))
            }
        }
    }

    fn compiled(&self, policy: SafetyPolicy) -> Arc<CompiledPolicy> {
        if let Some(hit) = self.compiled.get(&policy.id) {
            if hit.version() == policy.updated_at {
                return Arc::clone(hit.value());
            }
        }
        let id = policy.id.clone();
        let compiled = Arc::new(CompiledPolicy::compile(policy));
        self.compiled.insert(id, Arc::clone(&compiled));
        compiled
    }

    fn record(&self, ctx: &DetectContext, text: &str, result: &DetectionResult) {
        let detection = InjectionDetection {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: ctx.org_id.clone(),
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
            policy_id: result.policy_id.clone(),
            kind: result.kind.unwrap_or_default(),
            severity: result.severity.unwrap_or(Severity::Medium),
            pattern_matched: result.pattern_matched.clone().unwrap_or_default(),
            input: truncate_input(text),
            action_taken: result.action,
            server: ctx.server.clone(),
            tool: ctx.tool.clone(),
            key_id: ctx.key_id.clone(),
            ip_address: ctx.ip_address.clone(),
            created_at: Utc::now(),
        };
        warn!(
            detection = %serde_json::to_string(&detection).unwrap_or_default(),
            severity = detection.severity.as_str(),
            action = detection.action_taken.as_str(),
            server = ?detection.server,
            tool = ?detection.tool,
            "Prompt injection detected"
        );
        self.persist.dispatch(detection);
    }

    // ── Policy management ──

    /// Policies of `org_id` in evaluation order
    pub async fn list_policies(&self, org_id: &str) -> Result<Vec<SafetyPolicy>> {
        self.policies.list(org_id).await
    }

    /// Policy by id; the built-in default is visible to every organization
    pub async fn get_policy(&self, org_id: &str, id: &str) -> Result<SafetyPolicy> {
        if id == DEFAULT_POLICY_ID {
            return Ok(self.default_policy.policy.clone());
        }
        match self.policies.get(id).await? {
            Some(p) if p.org_id.as_deref() == Some(org_id) => Ok(p),
            _ => Err(Error::NotFound(format!("Safety policy '{id}' not found"))),
        }
    }

    /// Create a policy in `org_id`
    pub async fn create_policy(
        &self,
        org_id: &str,
        created_by: Option<&str>,
        input: PolicyInput,
    ) -> Result<SafetyPolicy> {
        validate_input(&input)?;
        let now = Utc::now();
        let policy = SafetyPolicy {
            id: format!("pol_{}", uuid::Uuid::new_v4().simple()),
            org_id: Some(org_id.to_string()),
            name: input.name,
            description: input.description,
            sensitivity: input.sensitivity,
            mode: input.mode,
            patterns: input.patterns,
            servers: input.servers,
            enabled: input.enabled,
            created_by: created_by.map(ToString::to_string),
            created_at: now,
            updated_at: now,
        };
        self.policies.insert(policy.clone()).await?;
        info!(policy = %policy.id, org = %org_id, mode = policy.mode.as_str(), "Safety policy created");
        Ok(policy)
    }

    /// Replace a policy's settings
    pub async fn update_policy(&self, org_id: &str, id: &str, input: PolicyInput) -> Result<SafetyPolicy> {
        if id == DEFAULT_POLICY_ID {
            return Err(Error::Validation("The default policy cannot be modified".to_string()));
        }
        validate_input(&input)?;
        let mut policy = self.get_policy(org_id, id).await?;
        policy.name = input.name;
        policy.description = input.description;
        policy.sensitivity = input.sensitivity;
        policy.mode = input.mode;
        policy.patterns = input.patterns;
        policy.servers = input.servers;
        policy.enabled = input.enabled;
        policy.updated_at = Utc::now();
        if !self.policies.update(policy.clone()).await? {
            return Err(Error::NotFound(format!("Safety policy '{id}' not found")));
        }
        self.compiled.remove(id);
        info!(policy = %id, org = %org_id, "Safety policy updated");
        Ok(policy)
    }

    /// Delete a policy. The built-in default cannot be deleted.
    pub async fn delete_policy(&self, org_id: &str, id: &str) -> Result<()> {
        if id == DEFAULT_POLICY_ID {
            return Err(Error::Validation("The default policy cannot be deleted".to_string()));
        }
        self.get_policy(org_id, id).await?;
        self.policies.delete(id).await?;
        self.compiled.remove(id);
        info!(policy = %id, org = %org_id, "Safety policy deleted");
        Ok(())
    }

    // ── Detections ──

    /// Filtered page of recent detections
    #[must_use]
    pub fn detections(&self, filter: &DetectionFilter) -> DetectionPage {
        self.log.query(filter)
    }

    /// Aggregate view of an organization's recent detections
    #[must_use]
    pub fn summary(&self, org_id: &str) -> SafetySummary {
        self.log.summary(org_id)
    }
}

fn validate_input(input: &PolicyInput) -> Result<()> {
    if input.name.trim().is_empty() {
        return Err(Error::Validation("name is required".to_string()));
    }
    Ok(())
}

fn verdict(compiled: &CompiledPolicy, text: &str) -> DetectionResult {
    let policy = &compiled.policy;
    let policy_id = Some(policy.id.clone());
    match compiled.evaluate(text) {
        PolicyVerdict::Clean => DetectionResult::clean(None, None),
        PolicyVerdict::Allowed => DetectionResult::clean(policy_id, Some("Input matched allow pattern")),
        PolicyVerdict::Blocked(pattern) => DetectionResult {
            detected: true,
            kind: Some(DetectionType::PromptInjection),
            severity: Some(policy.sensitivity.severity()),
            pattern_matched: Some(pattern),
            confidence: policy.sensitivity.confidence(),
            action: policy.mode,
            message: Some("Potential prompt injection detected".to_string()),
            policy_id,
        },
        PolicyVerdict::Heuristic(h) => DetectionResult {
            detected: true,
            kind: Some(DetectionType::PromptInjection),
            severity: Some(h.severity),
            pattern_matched: Some(h.source.to_string()),
            confidence: 0.75,
            action: policy.mode,
            message: Some(h.message.to_string()),
            policy_id,
        },
    }
}
