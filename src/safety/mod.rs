//! Prompt-injection detection.
//!
//! Request payloads are flattened to their string leaves and run through the
//! caller organization's [`SafetyPolicy`] set. Each policy carries block and
//! allow patterns, a [`Sensitivity`] deciding how patterns match, and a
//! [`SafetyMode`] deciding what a match does to the request.
//!
//! Detections are recorded off the request path through a worker queue.

mod detections;
mod detector;
mod extract;
mod matcher;
mod policy;

pub use detections::{
    DetectionFilter, DetectionLog, DetectionPage, DetectionSink, InjectionDetection, PatternCount,
    SafetySummary, truncate_input,
};
pub use detector::{DetectContext, DetectionResult, SafetyDetector};
pub use extract::{collect_text, visit_strings};
pub use matcher::{CompiledPolicy, PatternMatcher};
pub use policy::{
    DEFAULT_ALLOW_PATTERNS, DEFAULT_BLOCK_PATTERNS, DEFAULT_POLICY_ID, DetectionType,
    InMemoryPolicyStore, PolicyInput, PolicyStore, SafetyMode, SafetyPatterns, SafetyPolicy,
    Sensitivity, Severity,
};

/// Response header set when a warn-mode policy matches
pub const WARNING_HEADER: &str = "x-gatewayops-warning";

/// Value of [`WARNING_HEADER`]
pub const WARNING_MESSAGE: &str = "Potential prompt injection detected";
