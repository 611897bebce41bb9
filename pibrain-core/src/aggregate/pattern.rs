//! Pattern aggregation: groups tool errors and lessons by stable
//! fingerprints and upserts deduplicated pattern rows (§4.7).

use crate::db::StorageEngine;
use crate::error::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Minimum occurrences a fingerprint group needs before it is promoted to a
/// persisted pattern row. Not exposed in configuration (spec.md's enumerated
/// config list omits it); small enough that a daemon with modest session
/// volume still surfaces repeated patterns quickly.
pub const MIN_PATTERN_OCCURRENCES: i64 = 3;

pub struct PatternAggregator<'a> {
    engine: &'a StorageEngine,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PatternAggregationResult {
    pub failure_patterns_upserted: usize,
    pub lesson_patterns_upserted: usize,
}

impl<'a> PatternAggregator<'a> {
    pub fn new(engine: &'a StorageEngine) -> Self {
        PatternAggregator { engine }
    }

    /// Runs both grouping passes over the full current observation set.
    /// Aggregation is deterministic given its inputs: re-running with the
    /// same data upserts the same rows rather than duplicating them.
    pub fn run(&self, min_occurrences: i64) -> Result<PatternAggregationResult> {
        let mut result = PatternAggregationResult::default();
        let now = Utc::now();

        result.failure_patterns_upserted = self.aggregate_failure_patterns(min_occurrences, now)?;
        result.lesson_patterns_upserted = self.aggregate_lesson_patterns(min_occurrences, now)?;
        Ok(result)
    }

    fn aggregate_failure_patterns(&self, min_occurrences: i64, now: chrono::DateTime<Utc>) -> Result<usize> {
        let mut groups: HashMap<String, (String, String, String, Vec<String>)> = HashMap::new();
        for error in self.engine.all_tool_errors()? {
            let key = fingerprint(&[&error.tool, &error.error_type, &error.model]);
            let entry = groups
                .entry(key)
                .or_insert_with(|| (error.tool.clone(), error.error_type.clone(), error.model.clone(), Vec::new()));
            entry.3.push(error.node_id);
        }

        let mut upserted = 0;
        for (fp, (tool, error_type, model, node_ids)) in groups {
            if node_ids.len() as i64 >= min_occurrences {
                self.engine.upsert_failure_pattern(&fp, &tool, &error_type, &model, &node_ids, now)?;
                upserted += 1;
            }
        }
        Ok(upserted)
    }

    fn aggregate_lesson_patterns(&self, min_occurrences: i64, now: chrono::DateTime<Utc>) -> Result<usize> {
        let mut groups: HashMap<String, (String, String, Vec<String>)> = HashMap::new();
        for (lesson, model) in self.engine.all_lessons_with_model()? {
            let normalized = normalize_text(&lesson.summary);
            if normalized.is_empty() {
                continue;
            }
            let fp = fingerprint(&[&normalized, &model]);
            let error_fingerprint = self
                .engine
                .tool_errors_for_node(&lesson.node_id)?
                .first()
                .map(|e| fingerprint(&[&e.tool, &e.error_type, &e.model]))
                .unwrap_or_default();

            let entry = groups.entry(fp).or_insert_with(|| (error_fingerprint, model.clone(), Vec::new()));
            entry.2.push(lesson.node_id);
        }

        let mut upserted = 0;
        for (fp, (error_fingerprint, model, node_ids)) in groups {
            if node_ids.len() as i64 >= min_occurrences {
                self.engine.upsert_lesson_pattern(&fp, &error_fingerprint, &model, &node_ids, now)?;
                upserted += 1;
            }
        }
        Ok(upserted)
    }
}

/// Joins fields with `|` and truncates a SHA-256 hex digest to 16 characters
/// — the same deterministic-fingerprint shape used for node ids, so pattern
/// rows and node rows read as one family of identifiers.
pub(crate) fn fingerprint(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorageEngine;
    use crate::types::{Node, NodeType, Outcome, ToolError};
    use chrono::Utc as ChronoUtc;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            version: 1,
            session_file: "s.jsonl".into(),
            segment_start: "e1".into(),
            segment_end: "e5".into(),
            segment_start_at: ChronoUtc::now(),
            analyzed_at: ChronoUtc::now(),
            project: None,
            node_type: NodeType::Coding,
            outcome: Outcome::Failed,
            model: "claude".into(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            prompt_version: "v1".into(),
            summary: "hit a timeout".into(),
            decisions: vec![],
            tags: vec![],
            topics: vec![],
            previous_versions: vec![],
            content: serde_json::json!({}),
        }
    }

    #[test]
    fn groups_tool_errors_above_min_occurrences() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        engine.create_node(&node("n1")).unwrap();
        engine.create_node(&node("n2")).unwrap();

        for id in ["n1", "n2"] {
            engine
                .insert_tool_error(&ToolError {
                    id: 0,
                    node_id: id.to_string(),
                    tool: "bash".into(),
                    error_type: "timeout".into(),
                    model: "claude".into(),
                    summary: "command hung".into(),
                    created_at: ChronoUtc::now(),
                })
                .unwrap();
        }

        let aggregator = PatternAggregator::new(&engine);
        let result = aggregator.run(2).unwrap();
        assert_eq!(result.failure_patterns_upserted, 1);

        let conn = engine.connection();
        let occurrences: i64 = conn.query_row("SELECT occurrences FROM failure_patterns", [], |r| r.get(0)).unwrap();
        assert_eq!(occurrences, 2);
    }

    #[test]
    fn rerun_does_not_duplicate_pattern_rows() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        engine.create_node(&node("n1")).unwrap();
        engine.create_node(&node("n2")).unwrap();
        for id in ["n1", "n2"] {
            engine
                .insert_tool_error(&ToolError {
                    id: 0,
                    node_id: id.to_string(),
                    tool: "bash".into(),
                    error_type: "timeout".into(),
                    model: "claude".into(),
                    summary: "command hung".into(),
                    created_at: ChronoUtc::now(),
                })
                .unwrap();
        }

        let aggregator = PatternAggregator::new(&engine);
        aggregator.run(2).unwrap();
        aggregator.run(2).unwrap();

        let conn = engine.connection();
        let count: i64 = conn.query_row("SELECT count(*) FROM failure_patterns", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
