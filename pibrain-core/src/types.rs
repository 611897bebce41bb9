//! Domain types for the knowledge graph: nodes and their child observations,
//! edges, jobs, and the aggregator's higher-order records.
//!
//! Every entity that has a JSON side-store keeps the full blob in `content`;
//! parsed columns are a convenience layer over it, following the lossless-
//! capture discipline used throughout this crate's storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Segment outcome, one of the analyzer's required output fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
    Abandoned,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
            Outcome::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "partial" => Ok(Outcome::Partial),
            "failed" => Ok(Outcome::Failed),
            "abandoned" => Ok(Outcome::Abandoned),
            other => Err(crate::error::Error::Validation(format!(
                "invalid outcome: {other}"
            ))),
        }
    }
}

/// Segment type. The analyzer's vocabulary is open-ended; common values are
/// named explicitly and anything else round-trips through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NodeType {
    Coding,
    Debugging,
    Planning,
    Review,
    Research,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Coding => "coding",
            NodeType::Debugging => "debugging",
            NodeType::Planning => "planning",
            NodeType::Review => "review",
            NodeType::Research => "research",
            NodeType::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "coding" => NodeType::Coding,
            "debugging" => NodeType::Debugging,
            "planning" => NodeType::Planning,
            "review" => NodeType::Review,
            "research" => NodeType::Research,
            other => NodeType::Other(other.to_string()),
        })
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> String {
        t.as_str().to_string()
    }
}

impl TryFrom<String> for NodeType {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A reference to a prior version of a node, accumulated in the JSON blob
/// across reanalysis passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVersionRef {
    pub version: i64,
    pub analyzed_at: DateTime<Utc>,
    pub summary: String,
}

/// A semantic segment of one session, the central entity of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// 16 hex chars, deterministic from `(sessionFile, segmentStart, segmentEnd)`.
    pub id: String,
    /// Monotonic, starts at 1; bumped on reanalysis.
    pub version: i64,
    pub session_file: String,
    pub segment_start: String,
    pub segment_end: String,
    pub segment_start_at: DateTime<Utc>,
    pub analyzed_at: DateTime<Utc>,
    pub project: Option<String>,
    pub node_type: NodeType,
    pub outcome: Outcome,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost_usd: f64,
    pub duration_ms: i64,
    pub prompt_version: String,
    pub summary: String,
    pub decisions: Vec<String>,
    pub tags: Vec<String>,
    pub topics: Vec<String>,
    pub previous_versions: Vec<NodeVersionRef>,
    /// The full analyzer output plus job/environment metadata, the
    /// authoritative content persisted at `nodes/YYYY/MM/<id>-v<version>.json`.
    pub content: Value,
}

impl Node {
    /// Joined text the FTS index and Jaccard similarity operate over.
    pub fn tag_topic_set(&self) -> std::collections::HashSet<String> {
        self.tags.iter().chain(self.topics.iter()).cloned().collect()
    }

    pub fn relative_json_path(&self) -> std::path::PathBuf {
        let year = self.segment_start_at.format("%Y").to_string();
        let month = self.segment_start_at.format("%m").to_string();
        std::path::PathBuf::from(year)
            .join(month)
            .join(format!("{}-v{}.json", self.id, self.version))
    }
}

/// Severity shared by lessons, quirks, and tool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Numeric weight used by the insight aggregator's confidence score.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(crate::error::Error::Validation(format!(
                "invalid severity: {other}"
            ))),
        }
    }
}

/// A free-form structured observation attached to a node. Lessons carry
/// `level` (e.g. "tactical", "strategic") and `tags`; lifecycle is bound to
/// the owning node via cascade delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: i64,
    pub node_id: String,
    pub level: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuirk {
    pub id: i64,
    pub node_id: String,
    pub model: String,
    pub frequency: i64,
    pub severity: Severity,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub id: i64,
    pub node_id: String,
    pub tool: String,
    pub error_type: String,
    pub model: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDecision {
    pub id: i64,
    pub node_id: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Who created an edge: a structural boundary link, a daemon-discovered
/// semantic link, or a user-authored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    Boundary,
    Daemon,
    User,
}

impl CreatedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreatedBy::Boundary => "boundary",
            CreatedBy::Daemon => "daemon",
            CreatedBy::User => "user",
        }
    }
}

impl std::str::FromStr for CreatedBy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boundary" => Ok(CreatedBy::Boundary),
            "daemon" => Ok(CreatedBy::Daemon),
            "user" => Ok(CreatedBy::User),
            other => Err(crate::error::Error::Validation(format!(
                "invalid createdBy: {other}"
            ))),
        }
    }
}

/// Edge type. `related_to`/`references`/`reinforces` are produced by the
/// connection discoverer; `prev_in_session`/`fork` are structural, produced
/// by `linkNodeToPredecessors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EdgeType {
    RelatedTo,
    References,
    Reinforces,
    PrevInSession,
    Fork,
    Other(String),
}

impl EdgeType {
    pub fn as_str(&self) -> &str {
        match self {
            EdgeType::RelatedTo => "related_to",
            EdgeType::References => "references",
            EdgeType::Reinforces => "reinforces",
            EdgeType::PrevInSession => "prev_in_session",
            EdgeType::Fork => "fork",
            EdgeType::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EdgeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "related_to" => EdgeType::RelatedTo,
            "references" => EdgeType::References,
            "reinforces" => EdgeType::Reinforces,
            "prev_in_session" => EdgeType::PrevInSession,
            "fork" => EdgeType::Fork,
            other => EdgeType::Other(other.to_string()),
        })
    }
}

impl From<EdgeType> for String {
    fn from(t: EdgeType) -> String {
        t.as_str().to_string()
    }
}

impl TryFrom<String> for EdgeType {
    type Error = std::convert::Infallible;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A directed typed link between two nodes. At most one edge exists per
/// `(source, target, edge_type)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub edge_type: EdgeType,
    pub metadata: Value,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
}

/// Direction for `getConnectedNodes` traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Job type; lower-priority values preempt higher ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Initial,
    Reanalysis,
    ConnectionDiscovery,
    Backfill,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Initial => "initial",
            JobType::Reanalysis => "reanalysis",
            JobType::ConnectionDiscovery => "connection_discovery",
            JobType::Backfill => "backfill",
        }
    }

    /// Default priority for jobs of this type, per the enumerated priority
    /// levels (`INITIAL`, `REANALYSIS`, `CONNECTION_DISCOVERY`, `BACKFILL`).
    pub fn default_priority(&self) -> i64 {
        match self {
            JobType::Initial => 0,
            JobType::Reanalysis => 10,
            JobType::ConnectionDiscovery => 20,
            JobType::Backfill => 30,
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(JobType::Initial),
            "reanalysis" => Ok(JobType::Reanalysis),
            "connection_discovery" => Ok(JobType::ConnectionDiscovery),
            "backfill" => Ok(JobType::Backfill),
            other => Err(crate::error::Error::Validation(format!(
                "invalid job type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::error::Error::Validation(format!(
                "invalid job status: {other}"
            ))),
        }
    }
}

/// A queued unit of work. The payload is a free-form JSON blob (session
/// path, segment range, prior-node context, reanalysis hints, ...); the
/// worker interprets it by `job_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub queued_at: DateTime<Utc>,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Input to `enqueue`; id/priority/retry bound are defaulted if omitted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub priority: Option<i64>,
    pub payload: Value,
    pub max_retries: Option<u32>,
}

/// A higher-order pattern produced by the pattern aggregator, keyed on a
/// stable fingerprint so re-runs upsert rather than duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub id: i64,
    pub fingerprint: String,
    pub tool: String,
    pub error_type: String,
    pub model: String,
    pub occurrences: i64,
    pub node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonPattern {
    pub id: i64,
    pub fingerprint: String,
    pub error_fingerprint: String,
    pub model: String,
    pub occurrences: i64,
    pub node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the insight aggregator's clustering pass: a group of
/// semantically similar observations with a computed confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedInsight {
    pub id: i64,
    pub fingerprint: String,
    pub model: String,
    pub insight_type: String,
    pub node_ids: Vec<String>,
    pub confidence: f64,
    pub prompt_included: bool,
    pub prompt_version: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cluster of nodes/observations produced by the embedding-based
/// clustering path (§4.7's K-means++/HDBSCAN-like pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub label: String,
    pub node_ids: Vec<String>,
    pub centroid: Option<Vec<f64>>,
    pub is_noise: bool,
    pub created_at: DateTime<Utc>,
}

/// Before/after measurement of an insight's effect on session outcomes,
/// keyed by `(insightId, promptVersion)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEffectiveness {
    pub insight_id: i64,
    pub prompt_version: String,
    pub before_count: i64,
    pub after_count: i64,
    pub session_count: i64,
    pub significant: bool,
    pub improvement_pct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_known_and_unknown_values() {
        let coding: NodeType = "coding".parse().unwrap();
        assert_eq!(coding, NodeType::Coding);
        let custom: NodeType = "brainstorm".parse().unwrap();
        assert_eq!(custom.as_str(), "brainstorm");
    }

    #[test]
    fn job_type_has_ascending_default_priority() {
        assert!(JobType::Initial.default_priority() < JobType::Reanalysis.default_priority());
        assert!(JobType::Reanalysis.default_priority() < JobType::ConnectionDiscovery.default_priority());
        assert!(JobType::ConnectionDiscovery.default_priority() < JobType::Backfill.default_priority());
    }

    #[test]
    fn severity_weight_is_monotonic() {
        assert!(Severity::Low.weight() < Severity::Medium.weight());
        assert!(Severity::Medium.weight() < Severity::High.weight());
        assert!(Severity::High.weight() < Severity::Critical.weight());
    }
}
