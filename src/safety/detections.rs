//! Injection detection records.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{DetectionType, SafetyMode, Severity};
use crate::Result;

/// Characters of input kept on a detection record
pub const MAX_STORED_INPUT: usize = 500;

/// A recorded detection. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionDetection {
    /// Detection id
    pub id: String,
    /// Organization
    pub org_id: String,
    /// Trace id of the request
    pub trace_id: Option<String>,
    /// Span id of the request
    pub span_id: Option<String>,
    /// Policy that matched
    pub policy_id: Option<String>,
    /// Category
    #[serde(rename = "type")]
    pub kind: DetectionType,
    /// Severity
    pub severity: Severity,
    /// Pattern that matched
    pub pattern_matched: String,
    /// Input text, truncated
    pub input: String,
    /// Mode applied
    pub action_taken: SafetyMode,
    /// MCP server
    pub server: Option<String>,
    /// Tool
    pub tool: Option<String>,
    /// API key of the caller
    pub key_id: Option<String>,
    /// Client IP
    pub ip_address: Option<String>,
    /// Detection time
    pub created_at: DateTime<Utc>,
}

/// Truncate `input` to [`MAX_STORED_INPUT`] characters, marking the cut
#[must_use]
pub fn truncate_input(input: &str) -> String {
    match input.char_indices().nth(MAX_STORED_INPUT) {
        Some((cut, _)) => format!("{}...", &input[..cut]),
        None => input.to_string(),
    }
}

/// Detection query filter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DetectionFilter {
    /// Organization (set from the principal)
    #[serde(skip)]
    pub org_id: String,
    /// Categories
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub types: Vec<DetectionType>,
    /// Severities
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub severities: Vec<Severity>,
    /// Modes applied
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub actions: Vec<SafetyMode>,
    /// MCP server
    pub server: Option<String>,
    /// Not before
    pub start_time: Option<DateTime<Utc>>,
    /// Not after
    pub end_time: Option<DateTime<Utc>>,
    /// Page size (default 50)
    pub limit: Option<usize>,
    /// Page offset
    pub offset: Option<usize>,
}

impl DetectionFilter {
    fn matches(&self, d: &InjectionDetection) -> bool {
        d.org_id == self.org_id
            && (self.types.is_empty() || self.types.contains(&d.kind))
            && (self.severities.is_empty() || self.severities.contains(&d.severity))
            && (self.actions.is_empty() || self.actions.contains(&d.action_taken))
            && self.server.as_ref().is_none_or(|s| d.server.as_ref() == Some(s))
            && self.start_time.is_none_or(|t| d.created_at >= t)
            && self.end_time.is_none_or(|t| d.created_at <= t)
    }
}

/// One page of detections, newest first
#[derive(Debug, Clone, Serialize)]
pub struct DetectionPage {
    /// Detections
    pub detections: Vec<InjectionDetection>,
    /// Matches before paging
    pub total: usize,
    /// Page size
    pub limit: usize,
    /// Page offset
    pub offset: usize,
    /// Whether more pages follow
    pub has_more: bool,
}

/// A pattern and how often it matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternCount {
    /// Pattern
    pub pattern: String,
    /// Matches
    pub count: usize,
}

/// Aggregate view of an organization's detections
#[derive(Debug, Clone, Serialize)]
pub struct SafetySummary {
    /// Total detections held
    pub total_detections: usize,
    /// Counts by category
    pub by_type: HashMap<String, usize>,
    /// Counts by severity
    pub by_severity: HashMap<String, usize>,
    /// Counts by mode applied
    pub by_action: HashMap<String, usize>,
    /// Ten most frequent patterns
    pub top_patterns: Vec<PatternCount>,
}

/// Destination for detection records.
#[async_trait]
pub trait DetectionSink: Send + Sync + 'static {
    /// Persist a detection
    async fn record(&self, detection: InjectionDetection) -> Result<()>;
}

/// Bounded in-memory detection log; the oldest record is dropped first.
pub struct DetectionLog {
    capacity: usize,
    entries: RwLock<VecDeque<InjectionDetection>>,
}

impl DetectionLog {
    /// Create a log holding at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Append, evicting the oldest when full
    pub fn push(&self, detection: InjectionDetection) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(detection);
    }

    /// Records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Filtered page, newest first
    #[must_use]
    pub fn query(&self, filter: &DetectionFilter) -> DetectionPage {
        let matched: Vec<InjectionDetection> = self
            .entries
            .read()
            .iter()
            .rev()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        let total = matched.len();
        let limit = filter.limit.filter(|l| *l > 0).unwrap_or(50);
        let offset = filter.offset.unwrap_or(0).min(total);
        let detections: Vec<InjectionDetection> =
            matched.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + detections.len() < total;
        DetectionPage {
            detections,
            total,
            limit,
            offset,
            has_more,
        }
    }

    /// Summary over an organization's records
    #[must_use]
    pub fn summary(&self, org_id: &str) -> SafetySummary {
        let entries = self.entries.read();
        let mut summary = SafetySummary {
            total_detections: 0,
            by_type: HashMap::new(),
            by_severity: HashMap::new(),
            by_action: HashMap::new(),
            top_patterns: Vec::new(),
        };
        let mut patterns: HashMap<&str, usize> = HashMap::new();
        for d in entries.iter().filter(|d| d.org_id == org_id) {
            summary.total_detections += 1;
            *summary.by_type.entry(d.kind.as_str().to_string()).or_default() += 1;
            *summary.by_severity.entry(d.severity.as_str().to_string()).or_default() += 1;
            *summary.by_action.entry(d.action_taken.as_str().to_string()).or_default() += 1;
            if !d.pattern_matched.is_empty() {
                *patterns.entry(d.pattern_matched.as_str()).or_default() += 1;
            }
        }
        let mut top: Vec<PatternCount> = patterns
            .into_iter()
            .map(|(pattern, count)| PatternCount {
                pattern: pattern.to_string(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
        top.truncate(10);
        summary.top_patterns = top;
        summary
    }
}

#[async_trait]
impl DetectionSink for DetectionLog {
    async fn record(&self, detection: InjectionDetection) -> Result<()> {
        self.push(detection);
        Ok(())
    }
}
