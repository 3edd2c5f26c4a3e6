//! Queryable audit log storage.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::event::{AuditAction, AuditLog, AuditOutcome};
use crate::{Error, Result};

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Append a record
    async fn append(&self, entry: AuditLog) -> Result<()>;
}

/// Audit query filter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    /// Organization (set from the principal)
    #[serde(skip)]
    pub org_id: String,
    /// Team
    pub team_id: Option<String>,
    /// User
    pub user_id: Option<String>,
    /// API key
    pub key_id: Option<String>,
    /// Actions
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub actions: Vec<AuditAction>,
    /// Outcomes
    #[serde(deserialize_with = "crate::config::comma_list::deserialize")]
    pub outcomes: Vec<AuditOutcome>,
    /// Resource kind
    pub resource: Option<String>,
    /// Not before
    pub start_time: Option<DateTime<Utc>>,
    /// Not after
    pub end_time: Option<DateTime<Utc>>,
    /// Page size (default 50)
    pub limit: Option<usize>,
    /// Page offset
    pub offset: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, log: &AuditLog) -> bool {
        log.org_id.as_deref() == Some(self.org_id.as_str())
            && self.team_id.as_ref().is_none_or(|t| log.team_id.as_ref() == Some(t))
            && self.user_id.as_ref().is_none_or(|u| log.user_id.as_ref() == Some(u))
            && self.key_id.as_ref().is_none_or(|k| log.key_id.as_ref() == Some(k))
            && (self.actions.is_empty() || self.actions.contains(&log.action))
            && (self.outcomes.is_empty() || self.outcomes.contains(&log.outcome))
            && self.resource.as_ref().is_none_or(|r| &log.resource == r)
            && self.start_time.is_none_or(|t| log.created_at >= t)
            && self.end_time.is_none_or(|t| log.created_at <= t)
    }
}

/// One page of audit records, newest first
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    /// Records
    pub logs: Vec<AuditLog>,
    /// Matches before paging
    pub total: usize,
    /// Page size
    pub limit: usize,
    /// Page offset
    pub offset: usize,
    /// Whether more pages follow
    pub has_more: bool,
}

/// Aggregate counts over an organization's records
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    /// Records held
    pub total_logs: usize,
    /// Records created since midnight UTC
    pub today_logs: usize,
    /// Counts by action
    pub by_action: HashMap<String, usize>,
    /// Counts by outcome
    pub by_outcome: HashMap<String, usize>,
    /// Counts by resource
    pub by_resource: HashMap<String, usize>,
}

/// Export encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Pretty-printed JSON array
    #[default]
    Json,
    /// RFC 4180 CSV with a header row
    Csv,
}

impl ExportFormat {
    /// MIME type of the encoding
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

const CSV_HEADER: [&str; 11] = [
    "id",
    "timestamp",
    "action",
    "resource",
    "resource_id",
    "outcome",
    "status",
    "user_id",
    "key_id",
    "ip_address",
    "duration_ms",
];

/// Bounded in-memory audit log; the oldest record is dropped first.
pub struct AuditStore {
    capacity: usize,
    entries: RwLock<VecDeque<AuditLog>>,
}

impl AuditStore {
    /// Create a store holding at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Append, evicting the oldest record when full
    pub fn push(&self, entry: AuditLog) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Record by id within `org_id`
    #[must_use]
    pub fn get(&self, org_id: &str, id: &str) -> Option<AuditLog> {
        self.entries
            .read()
            .iter()
            .find(|l| l.id == id && l.org_id.as_deref() == Some(org_id))
            .cloned()
    }

    /// Filtered page, newest first
    #[must_use]
    pub fn query(&self, filter: &AuditFilter) -> AuditPage {
        self.page(filter, |_| true)
    }

    /// Filtered page of records containing `text` (case-insensitive) in the
    /// action, resource, resource id, IP address or details
    #[must_use]
    pub fn search(&self, text: &str, filter: &AuditFilter) -> AuditPage {
        let needle = text.to_lowercase();
        self.page(filter, |log| matches_text(log, &needle))
    }

    fn page(&self, filter: &AuditFilter, extra: impl Fn(&AuditLog) -> bool) -> AuditPage {
        let matched: Vec<AuditLog> = self
            .entries
            .read()
            .iter()
            .rev()
            .filter(|l| filter.matches(l) && extra(l))
            .cloned()
            .collect();
        let total = matched.len();
        let limit = filter.limit.filter(|l| *l > 0).unwrap_or(50);
        let offset = filter.offset.unwrap_or(0).min(total);
        let logs: Vec<AuditLog> = matched.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + logs.len() < total;
        AuditPage {
            logs,
            total,
            limit,
            offset,
            has_more,
        }
    }

    /// Encode one filtered page in `format`
    pub fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<String> {
        let page = self.query(filter);
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&page.logs)?),
            ExportFormat::Csv => encode_csv(&page.logs),
        }
    }

    /// Counts over `org_id`'s records
    #[must_use]
    pub fn stats(&self, org_id: &str) -> AuditStats {
        let today = Utc::now().date_naive();
        let mut stats = AuditStats::default();
        for log in self
            .entries
            .read()
            .iter()
            .filter(|l| l.org_id.as_deref() == Some(org_id))
        {
            stats.total_logs += 1;
            if log.created_at.date_naive() == today {
                stats.today_logs += 1;
            }
            *stats.by_action.entry(log.action.as_str().to_string()).or_default() += 1;
            *stats.by_outcome.entry(log.outcome.as_str().to_string()).or_default() += 1;
            *stats.by_resource.entry(log.resource.clone()).or_default() += 1;
        }
        stats
    }

    /// Drop records created before `cutoff`. Returns how many were dropped.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|l| l.created_at >= cutoff);
        before - entries.len()
    }
}

#[async_trait]
impl AuditSink for AuditStore {
    async fn append(&self, entry: AuditLog) -> Result<()> {
        self.push(entry);
        Ok(())
    }
}

fn matches_text(log: &AuditLog, needle: &str) -> bool {
    let contains = |s: &str| s.to_lowercase().contains(needle);
    contains(log.action.as_str())
        || contains(&log.resource)
        || log.resource_id.as_deref().is_some_and(contains)
        || log.ip_address.as_deref().is_some_and(contains)
        || (!log.details.is_empty()
            && serde_json::to_string(&log.details).is_ok_and(|json| contains(&json)))
}

fn csv_field(out: &mut String, value: &str) {
    if value.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&value.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(value);
    }
}

fn encode_csv(logs: &[AuditLog]) -> Result<String> {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");
    for log in logs {
        let row = [
            log.id.clone(),
            log.created_at.to_rfc3339(),
            log.action.as_str().to_string(),
            log.resource.clone(),
            log.resource_id.clone().unwrap_or_default(),
            log.outcome.as_str().to_string(),
            log.status.to_string(),
            log.user_id.clone().unwrap_or_default(),
            log.key_id.clone().unwrap_or_default(),
            log.ip_address.clone().unwrap_or_default(),
            log.duration_ms.to_string(),
        ];
        for (i, field) in row.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            csv_field(&mut out, field);
        }
        write!(out, "\r\n").map_err(|e| Error::Internal(format!("CSV encoding failed: {e}")))?;
    }
    Ok(out)
}
