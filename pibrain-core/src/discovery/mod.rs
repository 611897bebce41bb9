//! Connection discoverer: finds semantic edges between a freshly analyzed
//! node and the rest of the graph via tag/topic overlap, explicit node-id
//! references, and lesson reinforcement, per §4.6.

use crate::config::DiscoveryConfig;
use crate::db::StorageEngine;
use crate::error::Result;
use crate::ids::generate_edge_id;
use crate::types::{CreatedBy, Edge, EdgeType, Node};
use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Matches an explicit node reference like `a1b2c3d4e5f6` or
/// `a1b2c3d4e5f6@v2` — a 6-to-16 hex-char id prefix, optionally followed by
/// `@v<version>`. The version suffix is recognized but not otherwise used:
/// connections are made to the node's current row regardless of the version
/// named, since edges reference node ids, not specific versions.
fn node_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b[0-9a-f]{6,16}(?:@v\d+)?\b").unwrap())
}

pub struct ConnectionDiscoverer<'a> {
    engine: &'a StorageEngine,
    config: &'a DiscoveryConfig,
}

impl<'a> ConnectionDiscoverer<'a> {
    pub fn new(engine: &'a StorageEngine, config: &'a DiscoveryConfig) -> Self {
        ConnectionDiscoverer { engine, config }
    }

    /// Runs all three discovery heuristics for `node` against the rest of
    /// the graph. Each heuristic is independently idempotent via
    /// `edge_exists`, so re-running discovery for the same node never
    /// produces duplicate edges.
    pub fn discover_for_node(&self, node: &Node) -> Result<()> {
        self.discover_tag_topic_overlap(node)?;
        self.discover_references(node)?;
        self.discover_lesson_reinforcement(node)?;
        Ok(())
    }

    /// Tag/topic overlap: candidates are nodes sharing any tag or topic with
    /// `node` (found via an FTS OR-query over the `tags`/`topics` columns),
    /// scored by Jaccard similarity over the union of tags and topics.
    fn discover_tag_topic_overlap(&self, node: &Node) -> Result<()> {
        let own = node.tag_topic_set();
        if own.is_empty() {
            return Ok(());
        }

        let terms: Vec<String> = own.iter().map(|t| fts_quote(t)).collect();
        let match_expr = format!("tags:({}) OR topics:({})", terms.join(" OR "), terms.join(" OR "));

        let candidates = self.engine.search_nodes_advanced(&match_expr, None, 200)?;
        for candidate in candidates {
            if candidate.id == node.id {
                continue;
            }
            let other = candidate.tag_topic_set();
            let similarity = jaccard(&own, &other);
            if similarity >= self.config.jaccard_threshold {
                self.link(
                    node,
                    &candidate.id,
                    EdgeType::RelatedTo,
                    serde_json::json!({"similarity": similarity, "via": "tags"}),
                )?;
            }
        }
        Ok(())
    }

    /// Explicit references: scans the node's summary, decisions, and lesson
    /// text for node-ref tokens, resolves each against the store by id
    /// prefix, and links to the resolved target.
    fn discover_references(&self, node: &Node) -> Result<()> {
        let mut haystack = String::new();
        haystack.push_str(&node.summary);
        haystack.push(' ');
        for decision in &node.decisions {
            haystack.push_str(decision);
            haystack.push(' ');
        }
        for lesson in self.engine.lessons_for_node(&node.id)? {
            haystack.push_str(&lesson.summary);
            haystack.push(' ');
        }

        let mut resolved: HashSet<String> = HashSet::new();
        for capture in node_ref_pattern().find_iter(&haystack) {
            let token = capture.as_str();
            let prefix = token.split('@').next().unwrap_or(token);
            if prefix == node.id || prefix.len() > node.id.len() {
                continue;
            }
            if let Some(target) = self.resolve_reference(prefix)? {
                if target != node.id && resolved.insert(target.clone()) {
                    self.link(node, &target, EdgeType::References, serde_json::json!({"token": token}))?;
                }
            }
        }
        Ok(())
    }

    /// Resolves an id prefix to a single node, applying the documented
    /// tie-break when more than one current node shares the prefix: most
    /// recent `analyzedAt`, then lexicographically greatest full id.
    fn resolve_reference(&self, prefix: &str) -> Result<Option<String>> {
        let mut candidates = self.engine.find_nodes_by_id_prefix(prefix)?;
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at).then_with(|| b.id.cmp(&a.id)));
        Ok(Some(candidates.remove(0).id))
    }

    /// Lesson reinforcement: for each lesson attached to `node`, compares
    /// against every other node's lessons via tri-gram Jaccard on the
    /// summary text and links near-duplicates.
    fn discover_lesson_reinforcement(&self, node: &Node) -> Result<()> {
        let own_lessons = self.engine.lessons_for_node(&node.id)?;
        if own_lessons.is_empty() {
            return Ok(());
        }
        let other_lessons = self.engine.lessons_excluding_node(&node.id)?;

        for own in &own_lessons {
            let own_grams = trigrams(&own.summary);
            if own_grams.is_empty() {
                continue;
            }
            for other in &other_lessons {
                let other_grams = trigrams(&other.summary);
                if other_grams.is_empty() {
                    continue;
                }
                let similarity = jaccard(&own_grams, &other_grams);
                if similarity >= self.config.lesson_similarity_threshold {
                    self.link(
                        node,
                        &other.node_id,
                        EdgeType::Reinforces,
                        serde_json::json!({"lessonId": own.id, "similarity": similarity}),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn link(&self, node: &Node, target: &str, edge_type: EdgeType, metadata: serde_json::Value) -> Result<()> {
        if self.engine.edge_exists(&node.id, target, &edge_type)? {
            return Ok(());
        }
        let edge = Edge {
            id: generate_edge_id(),
            source: node.id.clone(),
            target: target.to_string(),
            edge_type,
            metadata,
            created_by: CreatedBy::Daemon,
            created_at: Utc::now(),
        };
        self.engine.create_edge(&edge)
    }
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Lowercased, whitespace-collapsed character tri-grams of `text`, used for
/// near-duplicate lesson-summary comparison.
fn trigrams(text: &str) -> HashSet<String> {
    let normalized: String = text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = normalized.chars().collect();
    if chars.len() < 3 {
        return HashSet::new();
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// Escapes an FTS5 bareword query term by wrapping it in double quotes,
/// since tags/topics may contain characters FTS5 would otherwise treat as
/// query syntax (hyphens, colons).
fn fts_quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::db::StorageEngine;
    use crate::ids::generate_deterministic_node_id;
    use crate::types::{NodeType, Outcome};

    fn node(id: &str, session: &str, tags: Vec<&str>, topics: Vec<&str>, summary: &str) -> Node {
        Node {
            id: id.to_string(),
            version: 1,
            session_file: session.to_string(),
            segment_start: "e1".into(),
            segment_end: "e5".into(),
            segment_start_at: Utc::now(),
            analyzed_at: Utc::now(),
            project: Some("pi-brain".into()),
            node_type: NodeType::Coding,
            outcome: Outcome::Success,
            model: "claude".into(),
            tokens_in: 10,
            tokens_out: 10,
            cost_usd: 0.0,
            duration_ms: 10,
            prompt_version: "v1".into(),
            summary: summary.to_string(),
            decisions: vec![],
            tags: tags.into_iter().map(String::from).collect(),
            topics: topics.into_iter().map(String::from).collect(),
            previous_versions: vec![],
            content: serde_json::json!({}),
        }
    }

    #[test]
    fn tag_topic_overlap_links_nodes_above_threshold() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let config = DiscoveryConfig { jaccard_threshold: 0.3, lesson_similarity_threshold: 0.5 };

        let id1 = generate_deterministic_node_id("s1.jsonl", "e1", "e5");
        let id2 = generate_deterministic_node_id("s2.jsonl", "e1", "e5");
        let n1 = node(&id1, "s1.jsonl", vec!["db", "sqlite"], vec![], "worked on the db layer");
        let n2 = node(&id2, "s2.jsonl", vec!["sqlite", "fts"], vec![], "added full text search");
        engine.create_node(&n1).unwrap();
        engine.create_node(&n2).unwrap();

        let discoverer = ConnectionDiscoverer::new(&engine, &config);
        discoverer.discover_for_node(&n1).unwrap();

        assert!(engine.edge_exists(&id1, &id2, &EdgeType::RelatedTo).unwrap());

        discoverer.discover_for_node(&n1).unwrap();
        let conn = engine.connection();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM edges WHERE source = ?1 AND target = ?2", rusqlite::params![id1, id2], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn explicit_reference_resolves_by_id_prefix() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let config = DiscoveryConfig::default();

        let target_id = generate_deterministic_node_id("s1.jsonl", "e1", "e5");
        let target = node(&target_id, "s1.jsonl", vec![], vec![], "fixed the claim loop bug");
        engine.create_node(&target).unwrap();

        let source_id = generate_deterministic_node_id("s2.jsonl", "e1", "e5");
        let prefix = &target_id[..8];
        let mut source = node(&source_id, "s2.jsonl", vec![], vec![], &format!("followed up on {prefix}@v1"));
        source.decisions = vec![];
        engine.create_node(&source).unwrap();

        let discoverer = ConnectionDiscoverer::new(&engine, &config);
        discoverer.discover_for_node(&source).unwrap();

        assert!(engine.edge_exists(&source_id, &target_id, &EdgeType::References).unwrap());
    }

    #[test]
    fn lesson_reinforcement_links_near_duplicate_lessons() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let config = DiscoveryConfig { jaccard_threshold: 0.3, lesson_similarity_threshold: 0.3 };

        let id1 = generate_deterministic_node_id("s1.jsonl", "e1", "e5");
        let mut n1 = node(&id1, "s1.jsonl", vec![], vec![], "summary one");
        n1.content = serde_json::json!({"analyzerOutput": {"lessonsByLevel": {"session": ["always retry on transient errors"]}}});
        engine.create_node(&n1).unwrap();

        let id2 = generate_deterministic_node_id("s2.jsonl", "e1", "e5");
        let mut n2 = node(&id2, "s2.jsonl", vec![], vec![], "summary two");
        n2.content = serde_json::json!({"analyzerOutput": {"lessonsByLevel": {"session": ["always retry transient errors quickly"]}}});
        engine.create_node(&n2).unwrap();

        let discoverer = ConnectionDiscoverer::new(&engine, &config);
        discoverer.discover_for_node(&n1).unwrap();

        assert!(engine.edge_exists(&id1, &id2, &EdgeType::Reinforces).unwrap());
    }

    #[test]
    fn trigrams_of_short_strings_is_empty() {
        assert!(trigrams("ab").is_empty());
        assert!(!trigrams("abcd").is_empty());
    }
}
