//! Sensitivity-dependent pattern matching.
//!
//! A policy's block and allow lists are compiled once into [`CompiledPolicy`]
//! and reused until the policy changes.
//!
//! - strict: case-insensitive substring anywhere in the text
//! - moderate: case-insensitive, bounded by word boundaries
//! - permissive: case-insensitive, delimited on both sides by the start or
//!   end of text, whitespace or punctuation (`.,;:!?"'()[]`)
//!
//! Every strict match of a pattern is a superset of its moderate matches,
//! which are a superset of its permissive matches.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::{SafetyPolicy, Sensitivity, Severity};

/// Characters that delimit a standalone phrase under permissive sensitivity
const PHRASE_DELIMITERS: &str = r#"\s.,;:!?"'()\[\]"#;

/// One compiled pattern
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    kind: MatcherKind,
}

#[derive(Debug, Clone)]
enum MatcherKind {
    Substring(String),
    Regex(Regex),
}

impl PatternMatcher {
    /// Compile `pattern` for `sensitivity`. Empty patterns compile to `None`.
    #[must_use]
    pub fn compile(pattern: &str, sensitivity: Sensitivity) -> Option<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return None;
        }
        let escaped = regex::escape(trimmed);
        let kind = match sensitivity {
            Sensitivity::Strict => MatcherKind::Substring(trimmed.to_lowercase()),
            Sensitivity::Moderate => {
                // \b only makes sense next to a word character
                let lead = if starts_with_word(trimmed) { r"\b" } else { "" };
                let tail = if ends_with_word(trimmed) { r"\b" } else { "" };
                MatcherKind::Regex(Regex::new(&format!("(?i){lead}{escaped}{tail}")).ok()?)
            }
            Sensitivity::Permissive => MatcherKind::Regex(
                Regex::new(&format!(
                    "(?i)(?:^|[{PHRASE_DELIMITERS}]){escaped}(?:$|[{PHRASE_DELIMITERS}])"
                ))
                .ok()?,
            ),
        };
        Some(Self {
            pattern: trimmed.to_string(),
            kind,
        })
    }

    /// Pattern text as configured
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match against text that has already been lower-cased
    fn is_match(&self, text: &str, lowered: &str) -> bool {
        match &self.kind {
            MatcherKind::Substring(needle) => lowered.contains(needle.as_str()),
            MatcherKind::Regex(re) => re.is_match(text),
        }
    }
}

fn starts_with_word(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_alphanumeric() || c == '_')
}

fn ends_with_word(s: &str) -> bool {
    s.chars().next_back().is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// A policy with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Source policy
    pub policy: SafetyPolicy,
    block: Vec<PatternMatcher>,
    allow: Vec<PatternMatcher>,
}

/// Result of running a compiled policy over one text
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    /// An allow pattern matched
    Allowed,
    /// A block pattern matched
    Blocked(String),
    /// A heuristic matched
    Heuristic(&'static Heuristic),
    /// Nothing matched
    Clean,
}

impl CompiledPolicy {
    /// Compile `policy`. Patterns that fail to compile are skipped.
    #[must_use]
    pub fn compile(policy: SafetyPolicy) -> Self {
        let compile_all = |patterns: &[String]| -> Vec<PatternMatcher> {
            patterns
                .iter()
                .filter_map(|p| PatternMatcher::compile(p, policy.sensitivity))
                .collect()
        };
        let block = compile_all(&policy.patterns.block);
        let allow = compile_all(&policy.patterns.allow);
        Self { policy, block, allow }
    }

    /// Timestamp of the policy version this was compiled from
    #[must_use]
    pub fn version(&self) -> DateTime<Utc> {
        self.policy.updated_at
    }

    /// Evaluate `text`: allow patterns first, then block patterns, then the
    /// heuristics when the sensitivity runs them.
    #[must_use]
    pub fn evaluate(&self, text: &str) -> PolicyVerdict {
        let lowered = text.to_lowercase();
        if self.allow.iter().any(|m| m.is_match(text, &lowered)) {
            return PolicyVerdict::Allowed;
        }
        if let Some(m) = self.block.iter().find(|m| m.is_match(text, &lowered)) {
            return PolicyVerdict::Blocked(m.pattern().to_string());
        }
        if self.policy.sensitivity.runs_heuristics() {
            if let Some(h) = heuristics().iter().find(|h| h.regex.is_match(text)) {
                return PolicyVerdict::Heuristic(h);
            }
        }
        PolicyVerdict::Clean
    }
}

/// Structural injection check applied after the pattern lists
#[derive(Debug)]
pub struct Heuristic {
    /// Regex source, reported as the matched pattern
    pub source: &'static str,
    /// Severity of a match
    pub severity: Severity,
    /// Human-readable description
    pub message: &'static str,
    regex: Regex,
}

impl PartialEq for Heuristic {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

const HEURISTIC_SOURCES: &[(&str, Severity, &str)] = &[
    (
        r"(?i)ignore\s+(all\s+)?(your|the|previous)\s+(instructions|rules|guidelines)",
        Severity::High,
        "Instruction override attempt",
    ),
    (
        r"(?i)(you\s+are|you're)\s+(now|going\s+to\s+be)\s+a",
        Severity::Medium,
        "Role manipulation attempt",
    ),
    (
        r"(?i)pretend\s+(to\s+be|that\s+you)",
        Severity::Medium,
        "Persona injection attempt",
    ),
    (r"(?i)from\s+now\s+on", Severity::Low, "Behavioral modification attempt"),
    (r"(?i)\[\s*system\s*\]", Severity::High, "System prompt injection"),
    (r"(?i)<\s*system\s*>", Severity::High, "System tag injection"),
    (r"(?i)assistant:\s*\n", Severity::Medium, "Role tag injection"),
    (r"(?i)human:\s*\n", Severity::Medium, "Role tag injection"),
];

/// The heuristic table, compiled on first use
pub fn heuristics() -> &'static [Heuristic] {
    static HEURISTICS: OnceLock<Vec<Heuristic>> = OnceLock::new();
    HEURISTICS.get_or_init(|| {
        HEURISTIC_SOURCES
            .iter()
            .filter_map(|(source, severity, message)| {
                Regex::new(source).ok().map(|regex| Heuristic {
                    source,
                    severity: *severity,
                    message,
                    regex,
                })
            })
            .collect()
    })
}
