//! Insight aggregation: clusters semantically similar observations per
//! `(model, insightType)` and promotes clusters meeting `minSupport` to
//! `aggregated_insight` rows (§4.7).

use super::pattern::fingerprint;
use crate::db::StorageEngine;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::types::{AggregatedInsight, Cluster, Severity};
use chrono::{DateTime, Utc};
use hdbscan::{Hdbscan, HdbscanHyperParams};
use std::collections::{HashMap, HashSet};

/// Minimum cluster size before a grouping becomes an `aggregated_insight`
/// row rather than staying noise. Mirrors `MIN_PATTERN_OCCURRENCES`'s
/// rationale for not being configuration-exposed.
pub const MIN_CLUSTER_SUPPORT: usize = 3;

pub struct InsightAggregator<'a> {
    engine: &'a StorageEngine,
    embedding: Option<&'a dyn EmbeddingProvider>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InsightAggregationResult {
    pub insights_upserted: usize,
    pub clusters_written: usize,
}

/// A single observation feeding the clusterer, stripped of its source
/// table's identity so model quirks, lessons, and tool errors can be
/// clustered through the same code path per `(model, insightType)`.
struct Observation {
    node_id: String,
    summary: String,
    severity: Severity,
    created_at: DateTime<Utc>,
}

/// One clustered group of observations, prior to the min-support filter.
struct ObservationCluster {
    node_ids: Vec<String>,
    severities: Vec<Severity>,
    latest_seen: DateTime<Utc>,
    summary: String,
    centroid: Option<Vec<f64>>,
}

impl<'a> InsightAggregator<'a> {
    pub fn new(engine: &'a StorageEngine, embedding: Option<&'a dyn EmbeddingProvider>) -> Self {
        InsightAggregator { engine, embedding }
    }

    /// Clusters observations grouped by `(model, insightType)` across all
    /// three child-observation kinds (model quirks, lessons, tool errors),
    /// then upserts an `aggregated_insight` for every cluster with at least
    /// `min_support` members, and overwrites the `clusters` table with this
    /// run's raw grouping for observability.
    pub fn run(&self, min_support: usize, similarity_threshold: f64) -> Result<InsightAggregationResult> {
        let mut grouped: HashMap<(String, &'static str), Vec<Observation>> = HashMap::new();

        for quirk in self.engine.all_model_quirks()? {
            grouped.entry((quirk.model, "quirk")).or_default().push(Observation {
                node_id: quirk.node_id,
                summary: quirk.summary,
                severity: quirk.severity,
                created_at: quirk.created_at,
            });
        }
        for (lesson, model) in self.engine.all_lessons_with_model()? {
            // Lessons carry no severity of their own; weight them as Medium
            // so they can still surface as insights without a fabricated
            // low/high rating.
            grouped.entry((model, "lesson")).or_default().push(Observation {
                node_id: lesson.node_id,
                summary: lesson.summary,
                severity: Severity::Medium,
                created_at: lesson.created_at,
            });
        }
        for error in self.engine.all_tool_errors()? {
            grouped.entry((error.model, "tool_error")).or_default().push(Observation {
                node_id: error.node_id,
                summary: error.summary,
                severity: Severity::Medium,
                created_at: error.created_at,
            });
        }

        let now = Utc::now();
        let mut all_clusters: Vec<Cluster> = Vec::new();
        let mut result = InsightAggregationResult::default();

        for ((model, insight_type), observations) in grouped {
            let clusters = self.cluster_observations(&observations, similarity_threshold)?;
            for (label_idx, cluster) in clusters.iter().enumerate() {
                all_clusters.push(Cluster {
                    id: 0,
                    label: format!("{model}-{insight_type}-{label_idx}"),
                    node_ids: cluster.node_ids.clone(),
                    centroid: cluster.centroid.clone(),
                    is_noise: cluster.node_ids.len() < min_support,
                    created_at: now,
                });

                if cluster.node_ids.len() < min_support {
                    continue;
                }

                let mean_severity = cluster.severities.iter().map(|s| s.weight()).sum::<f64>() / cluster.severities.len() as f64;
                let decay = recency_decay(cluster.latest_seen, now);
                let confidence = (cluster.node_ids.len() as f64 * mean_severity * decay).clamp(0.0, 1.0);

                let mut sorted_ids = cluster.node_ids.clone();
                sorted_ids.sort();
                let fp = fingerprint(&[&model, insight_type, &sorted_ids.join(",")]);

                let insight = AggregatedInsight {
                    id: 0,
                    fingerprint: fp,
                    model: model.clone(),
                    insight_type: insight_type.to_string(),
                    node_ids: sorted_ids,
                    confidence,
                    prompt_included: false,
                    prompt_version: None,
                    summary: cluster.summary.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.engine.upsert_aggregated_insight(&insight, now)?;
                result.insights_upserted += 1;
            }
        }

        self.engine.replace_clusters(&all_clusters, now)?;
        result.clusters_written = all_clusters.len();
        Ok(result)
    }

    fn cluster_observations(&self, observations: &[Observation], threshold: f64) -> Result<Vec<ObservationCluster>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        match self.embedding {
            Some(provider) => {
                let texts: Vec<String> = observations.iter().map(|o| o.summary.clone()).collect();
                let vectors = provider.embed(&texts)?;
                Ok(cluster_by_embedding(observations, &vectors))
            }
            None => Ok(cluster_by_token_jaccard(observations, threshold)),
        }
    }
}

/// Density clustering over embedding vectors via HDBSCAN, carried in from
/// the `cortex` example repo's clustering stack. Noise points (label `-1`)
/// are dropped rather than promoted to singleton clusters.
fn cluster_by_embedding(observations: &[Observation], vectors: &[Vec<f64>]) -> Vec<ObservationCluster> {
    if vectors.len() < 2 {
        return Vec::new();
    }

    let hyper_params = HdbscanHyperParams::builder().min_cluster_size(2).build();
    let clusterer = Hdbscan::new(vectors, hyper_params);
    let labels = match clusterer.cluster() {
        Ok(labels) => labels,
        Err(_) => return Vec::new(),
    };

    let mut groups: HashMap<i32, Vec<usize>> = HashMap::new();
    for (idx, label) in labels.iter().enumerate() {
        if *label >= 0 {
            groups.entry(*label).or_default().push(idx);
        }
    }

    groups
        .into_values()
        .map(|indices| {
            let node_ids: Vec<String> = indices.iter().map(|&i| observations[i].node_id.clone()).collect();
            let severities: Vec<Severity> = indices.iter().map(|&i| observations[i].severity).collect();
            let latest_seen = indices.iter().map(|&i| observations[i].created_at).max().unwrap();
            let summary = observations[indices[0]].summary.clone();
            let dims = vectors[indices[0]].len();
            let mut centroid = vec![0.0; dims];
            for &i in &indices {
                for (d, value) in vectors[i].iter().enumerate() {
                    centroid[d] += value / indices.len() as f64;
                }
            }
            ObservationCluster { node_ids, severities, latest_seen, summary, centroid: Some(centroid) }
        })
        .collect()
}

/// Greedy single-link clustering over token-Jaccard similarity: the
/// deterministic fallback path when no embedding provider is configured.
fn cluster_by_token_jaccard(observations: &[Observation], threshold: f64) -> Vec<ObservationCluster> {
    let token_sets: Vec<HashSet<String>> = observations.iter().map(|o| tokenize(&o.summary)).collect();
    let mut assigned: Vec<Option<usize>> = vec![None; observations.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..observations.len() {
        if assigned[i].is_some() {
            continue;
        }
        let cluster_idx = clusters.len();
        clusters.push(vec![i]);
        assigned[i] = Some(cluster_idx);

        for j in (i + 1)..observations.len() {
            if assigned[j].is_some() {
                continue;
            }
            if jaccard(&token_sets[i], &token_sets[j]) >= threshold {
                clusters[cluster_idx].push(j);
                assigned[j] = Some(cluster_idx);
            }
        }
    }

    clusters
        .into_iter()
        .map(|indices| {
            let node_ids: Vec<String> = indices.iter().map(|&i| observations[i].node_id.clone()).collect();
            let severities: Vec<Severity> = indices.iter().map(|&i| observations[i].severity).collect();
            let latest_seen = indices.iter().map(|&i| observations[i].created_at).max().unwrap();
            let summary = observations[indices[0]].summary.clone();
            ObservationCluster { node_ids, severities, latest_seen, summary, centroid: None }
        })
        .collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(String::from).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Exponential recency decay with a 30-day half-life: an observation last
/// seen 30 days ago contributes half the confidence weight of one seen now.
fn recency_decay(latest_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - latest_seen).num_seconds().max(0) as f64 / 86_400.0;
    0.5_f64.powf(age_days / 30.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(node_id: &str, summary: &str, severity: Severity, created_at: DateTime<Utc>) -> Observation {
        Observation { node_id: node_id.to_string(), summary: summary.to_string(), severity, created_at }
    }

    #[test]
    fn token_jaccard_clusters_near_duplicate_summaries() {
        let now = Utc::now();
        let observations = vec![
            observation("n1", "over explains every diff", Severity::Low, now),
            observation("n2", "over explains every single diff", Severity::Low, now),
            observation("n3", "refuses to run destructive commands", Severity::High, now),
        ];
        let clusters = cluster_by_token_jaccard(&observations, 0.5);
        assert!(clusters.iter().any(|c| c.node_ids.len() == 2));
        assert!(clusters.iter().any(|c| c.node_ids == vec!["n3".to_string()]));
    }

    #[test]
    fn run_clusters_lessons_and_tool_errors_not_just_quirks() {
        use crate::types::{Lesson, ModelQuirk, NodeType, Outcome, ToolError};

        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let now = Utc::now();

        let node = crate::types::Node {
            id: crate::ids::generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5"),
            version: 1,
            session_file: "sessions/a.jsonl".into(),
            segment_start: "e1".into(),
            segment_end: "e5".into(),
            segment_start_at: now,
            analyzed_at: now,
            project: Some("pi-brain".into()),
            node_type: NodeType::Coding,
            outcome: Outcome::Success,
            model: "claude".into(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            prompt_version: "v1".into(),
            summary: "did X".into(),
            decisions: vec![],
            tags: vec![],
            topics: vec![],
            previous_versions: vec![],
            content: serde_json::json!({}),
        };
        engine.create_node(&node).unwrap();

        for i in 0..3 {
            engine
                .insert_lesson(&Lesson {
                    id: 0,
                    node_id: node.id.clone(),
                    level: "tactical".into(),
                    summary: format!("always check the lock before writing entry {i}"),
                    tags: vec![],
                    created_at: now,
                })
                .unwrap();
            engine
                .insert_tool_error(&ToolError {
                    id: 0,
                    node_id: node.id.clone(),
                    tool: "bash".into(),
                    error_type: "timeout".into(),
                    model: "claude".into(),
                    summary: format!("command timed out waiting for output entry {i}"),
                    created_at: now,
                })
                .unwrap();
            engine
                .insert_model_quirk(&ModelQuirk {
                    id: 0,
                    node_id: node.id.clone(),
                    model: "claude".into(),
                    frequency: 1,
                    severity: Severity::Low,
                    summary: format!("over explains every diff entry {i}"),
                    created_at: now,
                })
                .unwrap();
        }

        let aggregator = InsightAggregator::new(&engine, None);
        let result = aggregator.run(3, 0.1).unwrap();
        assert_eq!(result.insights_upserted, 3);

        let conn = engine.connection();
        let mut stmt = conn.prepare("SELECT DISTINCT insight_type FROM aggregated_insights").unwrap();
        let types: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<HashSet<_>>>()
            .unwrap();
        assert!(types.contains("quirk"));
        assert!(types.contains("lesson"));
        assert!(types.contains("tool_error"));
    }

    #[test]
    fn recency_decay_halves_at_thirty_days() {
        let now = Utc::now();
        let thirty_days_ago = now - chrono::Duration::days(30);
        let decay = recency_decay(thirty_days_ago, now);
        assert!((decay - 0.5).abs() < 0.01);
    }

    #[test]
    fn recency_decay_is_one_for_just_seen() {
        let now = Utc::now();
        assert!((recency_decay(now, now) - 1.0).abs() < 1e-9);
    }
}
