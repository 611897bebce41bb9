//! Analysis worker: `claim → process → complete|fail`.

pub mod analyzer;
pub mod parse;
pub mod prompt;

use crate::config::Config;
use crate::db::StorageEngine;
use crate::discovery::ConnectionDiscoverer;
use crate::error::{ClassifiedError, Reason};
use crate::ids::{generate_deterministic_node_id, generate_edge_id};
use crate::types::{CreatedBy, Edge, EdgeType, JobType, Node, NodeType, NewJob, Outcome};
use chrono::Utc;
use prompt::JobContext;
use serde_json::Value;

/// One worker's view of the shared daemon state. Each worker thread owns one
/// of these; all fields are references into state shared across the pool.
pub struct Worker<'a> {
    pub engine: &'a StorageEngine,
    pub config: &'a Config,
    pub prompt_template: &'a str,
}

impl<'a> Worker<'a> {
    /// Runs the full per-job pipeline per the analysis worker's eight steps.
    /// On success, enqueues nothing further (connection discovery and
    /// predecessor linking happen inline); on failure the caller is
    /// responsible for calling `JobQueue::fail`.
    pub fn process(&self, payload: &Value, job_type: JobType, max_retries: u32) -> Result<Node, ClassifiedError> {
        analyzer::validate_environment(&self.config.analyzer)?;

        let context = JobContext::from_payload(payload).ok_or_else(|| {
            ClassifiedError::permanent(Reason::VALIDATION, "job payload missing sessionFile/segmentStart/segmentEnd")
        })?;

        let skills: Vec<String> = self
            .config
            .analyzer
            .required_skills
            .iter()
            .chain(self.config.analyzer.optional_skills.iter())
            .cloned()
            .collect();

        let rendered_prompt = prompt::build_prompt(self.prompt_template, &context, &skills);

        let output = analyzer::invoke(&self.config.analyzer, &rendered_prompt, &skills)?;

        let parsed = parse::extract_json_object(&output.stdout)?;
        let validated = validate_schema(&parsed)?;

        let node = agent_output_to_node(
            &validated,
            &context,
            job_type,
            self.current_prompt_version(),
            output.duration_ms,
            rendered_prompt,
        )?;

        let stored = self.persist(node)?;

        if let Err(e) = self.link_predecessors(&stored) {
            tracing::warn!(node_id = %stored.id, error = %e.message, "predecessor linking failed");
        }

        if let Err(e) = self.discover_connections(&stored) {
            tracing::warn!(node_id = %stored.id, error = %e.message, "connection discovery failed");
        }

        let _ = max_retries;
        Ok(stored)
    }

    fn current_prompt_version(&self) -> String {
        self.config
            .prompt
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "v1".to_string())
    }

    fn persist(&self, node: Node) -> Result<Node, ClassifiedError> {
        let (stored, _created) = self.engine.upsert_node(node).map_err(|e| infra_to_classified(&e))?;
        Ok(stored)
    }

    /// Creates a `prev_in_session` structural edge from this node to the most
    /// recently analyzed node of the same session file, idempotently.
    fn link_predecessors(&self, node: &Node) -> Result<(), ClassifiedError> {
        let conn = self.engine.connection();
        let predecessor_id: Option<String> = conn
            .query_row(
                "SELECT id FROM nodes WHERE session_file = ?1 AND id != ?2 AND is_current = 1
                 ORDER BY segment_start_at DESC LIMIT 1",
                rusqlite::params![node.session_file, node.id],
                |row| row.get(0),
            )
            .ok();
        drop(conn);

        if let Some(predecessor_id) = predecessor_id {
            if !self
                .engine
                .edge_exists(&predecessor_id, &node.id, &EdgeType::PrevInSession)
                .map_err(|e| infra_to_classified(&e))?
            {
                let edge = Edge {
                    id: generate_edge_id(),
                    source: predecessor_id,
                    target: node.id.clone(),
                    edge_type: EdgeType::PrevInSession,
                    metadata: Value::Null,
                    created_by: CreatedBy::Boundary,
                    created_at: Utc::now(),
                };
                self.engine.create_edge(&edge).map_err(|e| infra_to_classified(&e))?;
            }
        }
        Ok(())
    }

    fn discover_connections(&self, node: &Node) -> Result<(), ClassifiedError> {
        let discoverer = ConnectionDiscoverer::new(self.engine, &self.config.discovery);
        discoverer.discover_for_node(node).map_err(|e| infra_to_classified(&e))
    }
}

fn infra_to_classified(e: &crate::error::Error) -> ClassifiedError {
    ClassifiedError::classify(&e.to_string())
}

/// Structural validation of the analyzer's JSON output: required fields,
/// enum constraints on `type`/`outcome`, type-correct arrays.
fn validate_schema(value: &Value) -> Result<Value, ClassifiedError> {
    let missing = |field: &str| {
        ClassifiedError::permanent(Reason::SCHEMA, format!("analyzer output missing required field `{field}`"))
    };

    let summary = value.get("summary").and_then(|v| v.as_str()).ok_or_else(|| missing("summary"))?;
    let node_type = value.get("type").and_then(|v| v.as_str()).ok_or_else(|| missing("type"))?;
    let outcome = value.get("outcome").and_then(|v| v.as_str()).ok_or_else(|| missing("outcome"))?;
    let decisions = value.get("decisions").and_then(|v| v.as_array()).ok_or_else(|| missing("decisions"))?;
    value.get("lessonsByLevel").and_then(|v| v.as_object()).ok_or_else(|| missing("lessonsByLevel"))?;

    if outcome.parse::<Outcome>().is_err() {
        return Err(ClassifiedError::permanent(Reason::SCHEMA, format!("invalid outcome: {outcome}")));
    }
    if !decisions.iter().all(|d| d.is_string()) {
        return Err(ClassifiedError::permanent(Reason::SCHEMA, "decisions must be an array of strings"));
    }

    let _ = summary;
    let _ = node_type;
    Ok(value.clone())
}

/// Folds analyzer output, job context, and environment metadata into a full
/// `Node`, per the `agentOutputToNode` contract.
fn agent_output_to_node(
    output: &Value,
    context: &JobContext,
    _job_type: JobType,
    prompt_version: String,
    duration_ms: u64,
    rendered_prompt: String,
) -> Result<Node, ClassifiedError> {
    let id = generate_deterministic_node_id(context.session_file, context.segment_start, context.segment_end);

    let node_type: NodeType = output["type"].as_str().unwrap_or("other").parse().unwrap_or(NodeType::Other("other".into()));
    let outcome: Outcome = output["outcome"].as_str().unwrap_or("partial").parse().unwrap_or(Outcome::Partial);

    let decisions: Vec<String> = output["decisions"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let tags: Vec<String> = output["tags"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let topics: Vec<String> = output["topics"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let now = Utc::now();

    let content = serde_json::json!({
        "analyzerOutput": output,
        "prompt": rendered_prompt,
        "durationMs": duration_ms,
    });

    Ok(Node {
        id,
        version: 1,
        session_file: context.session_file.to_string(),
        segment_start: context.segment_start.to_string(),
        segment_end: context.segment_end.to_string(),
        segment_start_at: now,
        analyzed_at: now,
        project: output.get("project").and_then(|v| v.as_str()).map(String::from),
        node_type,
        outcome,
        model: output.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string(),
        tokens_in: output.get("tokensIn").and_then(|v| v.as_i64()).unwrap_or(0),
        tokens_out: output.get("tokensOut").and_then(|v| v.as_i64()).unwrap_or(0),
        cost_usd: output.get("costUsd").and_then(|v| v.as_f64()).unwrap_or(0.0),
        duration_ms: duration_ms as i64,
        prompt_version,
        summary: output["summary"].as_str().unwrap_or_default().to_string(),
        decisions,
        tags,
        topics,
        previous_versions: vec![],
        content,
    })
}

/// Builds the `initial` job payload the watcher/daemon glue enqueues for a
/// newly segmented boundary.
pub fn build_initial_job(session_file: &str, segment_start: &str, segment_end: &str) -> NewJob {
    NewJob {
        job_type: JobType::Initial,
        priority: None,
        payload: serde_json::json!({
            "sessionFile": session_file,
            "segmentStart": segment_start,
            "segmentEnd": segment_end,
        }),
        max_retries: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_schema_rejects_missing_fields() {
        let value = json!({"summary": "x"});
        let err = validate_schema(&value).unwrap_err();
        assert_eq!(err.reason.0, Reason::SCHEMA);
    }

    #[test]
    fn validate_schema_rejects_invalid_outcome() {
        let value = json!({
            "summary": "x", "type": "coding", "outcome": "maybe",
            "decisions": [], "lessonsByLevel": {}
        });
        assert!(validate_schema(&value).is_err());
    }

    #[test]
    fn agent_output_to_node_is_deterministic_across_calls() {
        let payload = json!({"sessionFile": "sess/abc.jsonl", "segmentStart": "e1", "segmentEnd": "e5"});
        let context = JobContext::from_payload(&payload).unwrap();
        let output = json!({"summary": "did X", "type": "coding", "outcome": "success", "decisions": []});

        let a = agent_output_to_node(&output, &context, JobType::Initial, "v1".into(), 10, "p".into()).unwrap();
        let b = agent_output_to_node(&output, &context, JobType::Initial, "v1".into(), 10, "p".into()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.node_type, NodeType::Coding);
    }
}
