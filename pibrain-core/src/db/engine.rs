//! Storage engine: the dual-write (SQLite + JSON file) persistence layer for
//! nodes, edges, jobs, and the aggregator's higher-order records.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use petgraph::graphmap::DiGraphMap;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The storage engine. Holds the SQLite connection and the root of the node
/// JSON store; every node write touches both.
pub struct StorageEngine {
    conn: Mutex<Connection>,
    nodes_dir: PathBuf,
}

impl StorageEngine {
    /// Opens or creates a database at `path`, with the JSON node store rooted
    /// at `path`'s parent directory under `nodes/`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            ",
        )?;

        let nodes_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("nodes");

        Ok(Self {
            conn: Mutex::new(conn),
            nodes_dir,
        })
    }

    /// Opens an in-memory database for testing. The JSON store is rooted at a
    /// throwaway temp directory so dual-write tests still exercise file I/O.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let nodes_dir = std::env::temp_dir().join(format!("pi-brain-test-nodes-{}", uuid::Uuid::new_v4()));
        Ok(Self {
            conn: Mutex::new(conn),
            nodes_dir,
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn nodes_dir(&self) -> &Path {
        &self.nodes_dir
    }

    // ============================================
    // Node operations
    // ============================================

    /// Writes a node's JSON file and its relational row/FTS entry in one
    /// pass. The JSON write happens first; if the SQLite transaction then
    /// fails, the orphaned file is harmless (the next `rebuildIndex` call, or
    /// a future write to the same id/version, will overwrite it).
    pub fn create_node(&self, node: &Node) -> Result<()> {
        self.write_node_json(node)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_node_row(&tx, node)?;
        insert_node_fts(&tx, node)?;
        insert_child_rows(&tx, node)?;
        tx.commit()?;
        Ok(())
    }

    /// Applies a reanalysis: bumps `version`, appends the prior summary to
    /// `previous_versions`, writes the new JSON file, and marks the new row
    /// current while demoting the old one.
    pub fn update_node(&self, mut node: Node) -> Result<Node> {
        let current = self.get_node(&node.id)?.ok_or_else(|| Error::NotFound(node.id.clone()))?;

        node.version = current.version + 1;
        let mut previous = current.previous_versions.clone();
        previous.push(NodeVersionRef {
            version: current.version,
            analyzed_at: current.analyzed_at,
            summary: current.summary.clone(),
        });
        node.previous_versions = previous;

        self.write_node_json(&node)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE nodes SET is_current = 0 WHERE id = ?1 AND is_current = 1",
            params![node.id],
        )?;
        insert_node_row(&tx, &node)?;
        tx.execute("DELETE FROM nodes_fts WHERE node_id = ?1", params![node.id])?;
        insert_node_fts(&tx, &node)?;
        delete_child_rows(&tx, &node.id)?;
        insert_child_rows(&tx, &node)?;
        tx.commit()?;
        Ok(node)
    }

    fn write_node_json(&self, node: &Node) -> Result<()> {
        let rel = node.relative_json_path();
        let full = self.nodes_dir.join(&rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&node.content)?;
        std::fs::write(&full, body)?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM nodes WHERE id = ?1 AND is_current = 1",
            params![id],
            row_to_node,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_node_version(&self, id: &str, version: i64) -> Result<Option<Node>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM nodes WHERE id = ?1 AND version = ?2",
            params![id, version],
            row_to_node,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_node_versions(&self, id: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM nodes WHERE id = ?1 ORDER BY version ASC")?;
        let rows = stmt.query_map(params![id], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// FTS5 search with an optional project/outcome filter, returning nodes
    /// ranked by BM25.
    pub fn search_nodes_advanced(&self, query: &str, project: Option<&str>, limit: usize) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let sql = "
            SELECT n.* FROM nodes n
            JOIN nodes_fts f ON f.node_id = n.id
            WHERE n.is_current = 1 AND nodes_fts MATCH ?1
              AND (?2 IS NULL OR n.project = ?2)
            ORDER BY rank
            LIMIT ?3
        ";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![query, project, limit as i64], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Re-derives `nodes_fts` from the current rows of `nodes`. Used after a
    /// bulk JSON import or to recover from a corrupted index.
    pub fn rebuild_index(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM nodes_fts", [])?;
        {
            let mut stmt = tx.prepare("SELECT * FROM nodes WHERE is_current = 1")?;
            let nodes = stmt.query_map([], row_to_node)?.collect::<rusqlite::Result<Vec<_>>>()?;
            for node in &nodes {
                insert_node_fts(&tx, node)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Edge operations
    // ============================================

    pub fn create_edge(&self, edge: &Edge) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO edges (id, source, target, edge_type, metadata, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source, target, edge_type) DO NOTHING",
            params![
                edge.id,
                edge.source,
                edge.target,
                edge.edge_type.as_str(),
                edge.metadata.to_string(),
                edge.created_by.as_str(),
                edge.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn edge_exists(&self, source: &str, target: &str, edge_type: &EdgeType) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM edges WHERE source = ?1 AND target = ?2 AND edge_type = ?3",
            params![source, target, edge_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn load_edges(&self) -> Result<Vec<Edge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, source, target, edge_type, metadata, created_by, created_at FROM edges")?;
        let rows = stmt.query_map([], row_to_edge)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Breadth-first traversal bounded by `max_depth` (clamped to spec's
    /// ceiling of 5 hops), following edges in `direction` and optionally
    /// restricted to `edge_types` (empty means "any type").
    pub fn get_connected_nodes(
        &self,
        start: &str,
        direction: Direction,
        max_depth: usize,
        edge_types: &[EdgeType],
    ) -> Result<Vec<String>> {
        let max_depth = max_depth.min(5);
        let edges = self.load_edges()?;
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for edge in &edges {
            if !edge_types.is_empty() && !edge_types.iter().any(|t| t == &edge.edge_type) {
                continue;
            }
            graph.add_edge(edge.source.as_str(), edge.target.as_str(), ());
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.to_string(), 0usize));
        visited.insert(start.to_string());

        let mut result = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let neighbors: Vec<&str> = match direction {
                Direction::Outgoing => graph.neighbors_directed(node.as_str(), petgraph::Direction::Outgoing).collect(),
                Direction::Incoming => graph.neighbors_directed(node.as_str(), petgraph::Direction::Incoming).collect(),
                Direction::Both => graph
                    .neighbors_directed(node.as_str(), petgraph::Direction::Outgoing)
                    .chain(graph.neighbors_directed(node.as_str(), petgraph::Direction::Incoming))
                    .collect(),
            };
            for neighbor in neighbors {
                if visited.insert(neighbor.to_string()) {
                    result.push(neighbor.to_string());
                    queue.push_back((neighbor.to_string(), depth + 1));
                }
            }
        }
        Ok(result)
    }

    /// Shortest path between two nodes, ignoring edge direction, via
    /// unweighted BFS bounded to `max_depth` hops; `None` if no path of
    /// length `≤ max_depth` exists.
    pub fn find_path(&self, source: &str, target: &str, max_depth: usize) -> Result<Option<Vec<String>>> {
        if source == target {
            return Ok(Some(vec![source.to_string()]));
        }
        if max_depth == 0 {
            return Ok(None);
        }
        let edges = self.load_edges()?;
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for edge in &edges {
            graph.add_edge(edge.source.as_str(), edge.target.as_str(), ());
            graph.add_edge(edge.target.as_str(), edge.source.as_str(), ());
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut parent: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        queue.push_back((source.to_string(), 0usize));
        visited.insert(source.to_string());

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for neighbor in graph.neighbors(node.as_str()) {
                if visited.insert(neighbor.to_string()) {
                    parent.insert(neighbor.to_string(), node.clone());
                    if neighbor == target {
                        let mut path = vec![target.to_string()];
                        let mut cur = target.to_string();
                        while let Some(p) = parent.get(&cur) {
                            path.push(p.clone());
                            cur = p.clone();
                        }
                        path.reverse();
                        return Ok(Some(path));
                    }
                    queue.push_back((neighbor.to_string(), depth + 1));
                }
            }
        }
        Ok(None)
    }

    // ============================================
    // Child observation inserts
    // ============================================

    pub fn insert_lesson(&self, lesson: &Lesson) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO lessons (node_id, level, summary, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lesson.node_id,
                lesson.level,
                lesson.summary,
                serde_json::to_string(&lesson.tags)?,
                lesson.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_model_quirk(&self, quirk: &ModelQuirk) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO model_quirks (node_id, model, frequency, severity, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                quirk.node_id,
                quirk.model,
                quirk.frequency,
                quirk.severity.as_str(),
                quirk.summary,
                quirk.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_tool_error(&self, err: &ToolError) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tool_errors (node_id, tool, error_type, model, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                err.node_id,
                err.tool,
                err.error_type,
                err.model,
                err.summary,
                err.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_daemon_decision(&self, decision: &DaemonDecision) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO daemon_decisions (node_id, summary, created_at) VALUES (?1, ?2, ?3)",
            params![decision.node_id, decision.summary, decision.created_at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn lessons_for_node(&self, node_id: &str) -> Result<Vec<Lesson>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, node_id, level, summary, tags, created_at FROM lessons WHERE node_id = ?1")?;
        let rows = stmt.query_map(params![node_id], row_to_lesson)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// All lessons attached to a node other than `exclude_node_id`, the
    /// candidate pool for lesson-reinforcement discovery.
    pub fn lessons_excluding_node(&self, exclude_node_id: &str) -> Result<Vec<Lesson>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, level, summary, tags, created_at FROM lessons WHERE node_id != ?1",
        )?;
        let rows = stmt.query_map(params![exclude_node_id], row_to_lesson)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn model_quirks_for_node(&self, node_id: &str) -> Result<Vec<ModelQuirk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, model, frequency, severity, summary, created_at FROM model_quirks WHERE node_id = ?1",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            let severity: String = row.get("severity")?;
            Ok(ModelQuirk {
                id: row.get("id")?,
                node_id: row.get("node_id")?,
                model: row.get("model")?,
                frequency: row.get("frequency")?,
                severity: severity.parse().unwrap_or(Severity::Low),
                summary: row.get("summary")?,
                created_at: parse_rfc3339_col(row, "created_at")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn all_tool_errors(&self) -> Result<Vec<ToolError>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, node_id, tool, error_type, model, summary, created_at FROM tool_errors")?;
        let rows = stmt.query_map([], |row| {
            Ok(ToolError {
                id: row.get(0)?,
                node_id: row.get(1)?,
                tool: row.get(2)?,
                error_type: row.get(3)?,
                model: row.get(4)?,
                summary: row.get(5)?,
                created_at: parse_rfc3339_col(row, "created_at")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    pub fn all_model_quirks(&self) -> Result<Vec<ModelQuirk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, node_id, model, frequency, severity, summary, created_at FROM model_quirks")?;
        let rows = stmt.query_map([], |row| {
            let severity: String = row.get("severity")?;
            Ok(ModelQuirk {
                id: row.get("id")?,
                node_id: row.get("node_id")?,
                model: row.get("model")?,
                frequency: row.get("frequency")?,
                severity: severity.parse().unwrap_or(Severity::Low),
                summary: row.get("summary")?,
                created_at: parse_rfc3339_col(row, "created_at")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Nodes whose id starts with `prefix`, most-recently-analyzed first.
    /// Used to resolve explicit `<nodeId>` references that may be truncated.
    pub fn find_nodes_by_id_prefix(&self, prefix: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM nodes WHERE id LIKE ?1 || '%' AND is_current = 1 ORDER BY analyzed_at DESC",
        )?;
        let rows = stmt.query_map(params![prefix], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Nodes created/analyzed at or after `since`, used by the scheduler's
    /// connection-discovery pass to scope re-runs to new nodes only.
    pub fn nodes_analyzed_since(&self, since: DateTime<Utc>) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM nodes WHERE is_current = 1 AND analyzed_at >= ?1 ORDER BY analyzed_at ASC")?;
        let rows = stmt.query_map(params![since.to_rfc3339()], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// All current nodes, used when discovery/aggregation is configured to
    /// re-run over full history rather than only newly written nodes.
    pub fn all_current_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM nodes WHERE is_current = 1 ORDER BY analyzed_at ASC")?;
        let rows = stmt.query_map([], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Nodes whose `prompt_version` is not `current_version`, the candidate
    /// set for the scheduler's reanalysis pass.
    pub fn nodes_with_stale_prompt_version(&self, current_version: &str) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM nodes WHERE is_current = 1 AND prompt_version != ?1 ORDER BY analyzed_at ASC")?;
        let rows = stmt.query_map(params![current_version], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// `upsertNode`: creates the node if absent. If a row already exists for
    /// this id and its content is byte-identical to the incoming node (the
    /// same job re-run after a crash, or a retried attempt that produced the
    /// same analyzer output), the store is left untouched and `created:
    /// false` is returned without bumping the version — this is what makes
    /// ingestion idempotent (§8 invariant 2). Only a genuine content change
    /// (a real reanalysis) triggers `update_node`'s version bump.
    pub fn upsert_node(&self, node: Node) -> Result<(Node, bool)> {
        match self.get_node(&node.id)? {
            Some(current) if current.content == node.content => Ok((current, false)),
            Some(_) => Ok((self.update_node(node)?, false)),
            None => {
                self.create_node(&node)?;
                Ok((node, true))
            }
        }
    }

    /// All current-node lessons joined with their owning node's model, the
    /// candidate pool for the pattern aggregator's lesson-pattern pass.
    pub fn all_lessons_with_model(&self) -> Result<Vec<(Lesson, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT l.id, l.node_id, l.level, l.summary, l.tags, l.created_at, n.model
             FROM lessons l JOIN nodes n ON n.id = l.node_id AND n.is_current = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            let lesson = row_to_lesson(row)?;
            let model: String = row.get(6)?;
            Ok((lesson, model))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Upserts a `failure_pattern` row keyed on `fingerprint`: on conflict,
    /// bumps `occurrences` and merges `node_ids`.
    pub fn upsert_failure_pattern(
        &self,
        fingerprint: &str,
        tool: &str,
        error_type: &str,
        model: &str,
        node_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row("SELECT node_ids FROM failure_patterns WHERE fingerprint = ?1", params![fingerprint], |row| row.get(0))
            .optional()?;
        let merged = merge_node_ids(existing.as_deref(), node_ids);
        conn.execute(
            "INSERT INTO failure_patterns (fingerprint, tool, error_type, model, occurrences, node_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(fingerprint) DO UPDATE SET
               occurrences = occurrences + excluded.occurrences,
               node_ids = ?6,
               updated_at = excluded.updated_at",
            params![fingerprint, tool, error_type, model, node_ids.len() as i64, merged, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Upserts a `lesson_pattern` row keyed on `fingerprint`.
    pub fn upsert_lesson_pattern(
        &self,
        fingerprint: &str,
        error_fingerprint: &str,
        model: &str,
        node_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row("SELECT node_ids FROM lesson_patterns WHERE fingerprint = ?1", params![fingerprint], |row| row.get(0))
            .optional()?;
        let merged = merge_node_ids(existing.as_deref(), node_ids);
        conn.execute(
            "INSERT INTO lesson_patterns (fingerprint, error_fingerprint, model, occurrences, node_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET
               occurrences = occurrences + excluded.occurrences,
               node_ids = ?5,
               updated_at = excluded.updated_at",
            params![fingerprint, error_fingerprint, model, node_ids.len() as i64, merged, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Upserts an `aggregated_insight` row keyed on `fingerprint`.
    pub fn upsert_aggregated_insight(&self, insight: &AggregatedInsight, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO aggregated_insights
                (fingerprint, model, insight_type, node_ids, confidence, prompt_included, prompt_version, summary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(fingerprint) DO UPDATE SET
               node_ids = excluded.node_ids,
               confidence = excluded.confidence,
               summary = excluded.summary,
               updated_at = excluded.updated_at",
            params![
                insight.fingerprint,
                insight.model,
                insight.insight_type,
                serde_json::to_string(&insight.node_ids).unwrap_or_default(),
                insight.confidence,
                insight.prompt_included as i64,
                insight.prompt_version,
                insight.summary,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Replaces the full `clusters` table with a fresh clustering pass's
    /// output. Clustering is not incremental — each run recomputes every
    /// cluster from the current candidate set, so a wholesale replace is
    /// simpler and cheaper than diffing against the prior run.
    pub fn replace_clusters(&self, clusters: &[Cluster], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM clusters", [])?;
        for cluster in clusters {
            tx.execute(
                "INSERT INTO clusters (label, node_ids, centroid, is_noise, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cluster.label,
                    serde_json::to_string(&cluster.node_ids).unwrap_or_default(),
                    cluster.centroid.as_ref().map(|c| serde_json::to_string(c).unwrap_or_default()),
                    cluster.is_noise as i64,
                    now.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn upsert_prompt_effectiveness(&self, effectiveness: &PromptEffectiveness) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO prompt_effectiveness
                (insight_id, prompt_version, before_count, after_count, session_count, significant, improvement_pct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(insight_id, prompt_version) DO UPDATE SET
               before_count = excluded.before_count,
               after_count = excluded.after_count,
               session_count = excluded.session_count,
               significant = excluded.significant,
               improvement_pct = excluded.improvement_pct",
            params![
                effectiveness.insight_id,
                effectiveness.prompt_version,
                effectiveness.before_count,
                effectiveness.after_count,
                effectiveness.session_count,
                effectiveness.significant as i64,
                effectiveness.improvement_pct,
            ],
        )?;
        Ok(())
    }

    pub fn tool_errors_for_node(&self, node_id: &str) -> Result<Vec<ToolError>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, tool, error_type, model, summary, created_at FROM tool_errors WHERE node_id = ?1",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            Ok(ToolError {
                id: row.get(0)?,
                node_id: row.get(1)?,
                tool: row.get(2)?,
                error_type: row.get(3)?,
                model: row.get(4)?,
                summary: row.get(5)?,
                created_at: parse_rfc3339_col(row, "created_at")?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }
}

fn parse_rfc3339_col(row: &Row, col: &'static str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn insert_node_row(conn: &Connection, node: &Node) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO nodes (
            id, version, session_file, segment_start, segment_end, segment_start_at,
            analyzed_at, project, node_type, outcome, model, tokens_in, tokens_out,
            cost_usd, duration_ms, prompt_version, summary, decisions, tags, topics,
            previous_versions, content, json_path, is_current
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,1)",
        params![
            node.id,
            node.version,
            node.session_file,
            node.segment_start,
            node.segment_end,
            node.segment_start_at.to_rfc3339(),
            node.analyzed_at.to_rfc3339(),
            node.project,
            node.node_type.as_str(),
            node.outcome.as_str(),
            node.model,
            node.tokens_in,
            node.tokens_out,
            node.cost_usd,
            node.duration_ms,
            node.prompt_version,
            node.summary,
            serde_json::to_string(&node.decisions).unwrap_or_default(),
            serde_json::to_string(&node.tags).unwrap_or_default(),
            serde_json::to_string(&node.topics).unwrap_or_default(),
            serde_json::to_string(&node.previous_versions).unwrap_or_default(),
            node.content.to_string(),
            node.relative_json_path().to_string_lossy().to_string(),
        ],
    )?;
    Ok(())
}

fn insert_node_fts(conn: &Connection, node: &Node) -> rusqlite::Result<()> {
    let lessons_text = node
        .content
        .get("analyzerOutput")
        .unwrap_or(&node.content)
        .get("lessonsByLevel")
        .and_then(|v| v.as_object())
        .map(|by_level| {
            by_level
                .values()
                .filter_map(|v| v.as_array())
                .flatten()
                .filter_map(|entry| match entry {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => entry.get("summary").and_then(|v| v.as_str()).map(String::from),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    conn.execute(
        "INSERT INTO nodes_fts (node_id, summary, decisions, lessons, tags, topics) VALUES (?1,?2,?3,?4,?5,?6)",
        params![
            node.id,
            node.summary,
            node.decisions.join(" "),
            lessons_text,
            node.tags.join(" "),
            node.topics.join(" "),
        ],
    )?;
    Ok(())
}

/// Parses the analyzer's free-form `lessonsByLevel`/`modelQuirks`/
/// `toolErrors`/`daemonDecisions` fields out of a node's content blob and
/// inserts them as child rows. Best-effort: a malformed or absent field is
/// silently skipped rather than failing the whole node write, since these
/// are convenience columns over the lossless `content` blob.
fn insert_child_rows(conn: &Connection, node: &Node) -> rusqlite::Result<()> {
    let analyzer_output = node.content.get("analyzerOutput").unwrap_or(&node.content);

    if let Some(by_level) = analyzer_output.get("lessonsByLevel").and_then(|v| v.as_object()) {
        for (level, entries) in by_level {
            let Some(entries) = entries.as_array() else { continue };
            for entry in entries {
                let (summary, tags) = match entry {
                    Value::String(s) => (s.clone(), Vec::<String>::new()),
                    Value::Object(_) => (
                        entry.get("summary").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                        entry
                            .get("tags")
                            .and_then(|v| v.as_array())
                            .map(|arr| arr.iter().filter_map(|t| t.as_str().map(String::from)).collect())
                            .unwrap_or_default(),
                    ),
                    _ => continue,
                };
                if summary.is_empty() {
                    continue;
                }
                conn.execute(
                    "INSERT INTO lessons (node_id, level, summary, tags, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![node.id, level, summary, serde_json::to_string(&tags).unwrap_or_default(), node.analyzed_at.to_rfc3339()],
                )?;
            }
        }
    }

    if let Some(quirks) = analyzer_output.get("modelQuirks").and_then(|v| v.as_array()) {
        for quirk in quirks {
            let model = quirk.get("model").and_then(|v| v.as_str()).unwrap_or(&node.model);
            let frequency = quirk.get("frequency").and_then(|v| v.as_i64()).unwrap_or(1);
            let severity = quirk.get("severity").and_then(|v| v.as_str()).unwrap_or("low");
            let summary = quirk.get("summary").and_then(|v| v.as_str()).unwrap_or_default();
            if summary.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT INTO model_quirks (node_id, model, frequency, severity, summary, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![node.id, model, frequency, severity, summary, node.analyzed_at.to_rfc3339()],
            )?;
        }
    }

    if let Some(errors) = analyzer_output.get("toolErrors").and_then(|v| v.as_array()) {
        for error in errors {
            let tool = error.get("tool").and_then(|v| v.as_str()).unwrap_or("unknown");
            let error_type = error.get("errorType").and_then(|v| v.as_str()).unwrap_or("unknown");
            let model = error.get("model").and_then(|v| v.as_str()).unwrap_or(&node.model);
            let summary = error.get("summary").and_then(|v| v.as_str()).unwrap_or_default();
            if summary.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT INTO tool_errors (node_id, tool, error_type, model, summary, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![node.id, tool, error_type, model, summary, node.analyzed_at.to_rfc3339()],
            )?;
        }
    }

    if let Some(decisions) = analyzer_output.get("daemonDecisions").and_then(|v| v.as_array()) {
        for decision in decisions {
            let summary = match decision {
                Value::String(s) => s.clone(),
                Value::Object(_) => decision.get("summary").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                _ => continue,
            };
            if summary.is_empty() {
                continue;
            }
            conn.execute(
                "INSERT INTO daemon_decisions (node_id, summary, created_at) VALUES (?1, ?2, ?3)",
                params![node.id, summary, node.analyzed_at.to_rfc3339()],
            )?;
        }
    }

    Ok(())
}

/// Unions a pattern row's existing `node_ids` JSON array with a fresh batch,
/// deduplicating while preserving first-seen order.
fn merge_node_ids(existing: Option<&str>, fresh: &[String]) -> String {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged: Vec<String> = Vec::new();
    if let Some(existing) = existing {
        if let Ok(ids) = serde_json::from_str::<Vec<String>>(existing) {
            for id in ids {
                if seen.insert(id.clone()) {
                    merged.push(id);
                }
            }
        }
    }
    for id in fresh {
        if seen.insert(id.clone()) {
            merged.push(id.clone());
        }
    }
    serde_json::to_string(&merged).unwrap_or_default()
}

fn delete_child_rows(conn: &Connection, node_id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM lessons WHERE node_id = ?1", params![node_id])?;
    conn.execute("DELETE FROM model_quirks WHERE node_id = ?1", params![node_id])?;
    conn.execute("DELETE FROM tool_errors WHERE node_id = ?1", params![node_id])?;
    conn.execute("DELETE FROM daemon_decisions WHERE node_id = ?1", params![node_id])?;
    Ok(())
}

fn row_to_node(row: &Row) -> rusqlite::Result<Node> {
    let decisions: String = row.get("decisions")?;
    let tags: String = row.get("tags")?;
    let topics: String = row.get("topics")?;
    let previous_versions: String = row.get("previous_versions")?;
    let content: String = row.get("content")?;

    let node_type_str: String = row.get("node_type")?;
    let outcome_str: String = row.get("outcome")?;

    Ok(Node {
        id: row.get("id")?,
        version: row.get("version")?,
        session_file: row.get("session_file")?,
        segment_start: row.get("segment_start")?,
        segment_end: row.get("segment_end")?,
        segment_start_at: parse_rfc3339_col(row, "segment_start_at")?,
        analyzed_at: parse_rfc3339_col(row, "analyzed_at")?,
        project: row.get("project")?,
        node_type: node_type_str.parse().unwrap_or(NodeType::Other(node_type_str)),
        outcome: outcome_str.parse().unwrap_or(Outcome::Partial),
        model: row.get("model")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        cost_usd: row.get("cost_usd")?,
        duration_ms: row.get("duration_ms")?,
        prompt_version: row.get("prompt_version")?,
        summary: row.get("summary")?,
        decisions: serde_json::from_str(&decisions).unwrap_or_default(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        topics: serde_json::from_str(&topics).unwrap_or_default(),
        previous_versions: serde_json::from_str(&previous_versions).unwrap_or_default(),
        content: serde_json::from_str::<Value>(&content).unwrap_or(Value::Null),
    })
}

fn row_to_lesson(row: &Row) -> rusqlite::Result<Lesson> {
    let tags: String = row.get("tags")?;
    Ok(Lesson {
        id: row.get("id")?,
        node_id: row.get("node_id")?,
        level: row.get("level")?,
        summary: row.get("summary")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: parse_rfc3339_col(row, "created_at")?,
    })
}

fn row_to_edge(row: &Row) -> rusqlite::Result<Edge> {
    let metadata: String = row.get("metadata")?;
    let edge_type_str: String = row.get("edge_type")?;
    let created_by_str: String = row.get("created_by")?;
    Ok(Edge {
        id: row.get("id")?,
        source: row.get("source")?,
        target: row.get("target")?,
        edge_type: edge_type_str.parse().unwrap_or(EdgeType::Other(edge_type_str)),
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_by: created_by_str.parse().unwrap_or(CreatedBy::Daemon),
        created_at: parse_rfc3339_col(row, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::generate_deterministic_node_id;

    fn sample_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            version: 1,
            session_file: "sessions/a.jsonl".into(),
            segment_start: "e1".into(),
            segment_end: "e5".into(),
            segment_start_at: Utc::now(),
            analyzed_at: Utc::now(),
            project: Some("pi-brain".into()),
            node_type: NodeType::Coding,
            outcome: Outcome::Success,
            model: "claude".into(),
            tokens_in: 100,
            tokens_out: 200,
            cost_usd: 0.01,
            duration_ms: 1000,
            prompt_version: "v1".into(),
            summary: "fixed a bug in the queue claim loop".into(),
            decisions: vec!["use optimistic locking".into()],
            tags: vec!["queue".into(), "sqlite".into()],
            topics: vec!["concurrency".into()],
            previous_versions: vec![],
            content: serde_json::json!({"raw": true}),
        }
    }

    #[test]
    fn create_and_get_node_round_trips() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");
        let node = sample_node(&id);
        engine.create_node(&node).unwrap();

        let fetched = engine.get_node(&id).unwrap().unwrap();
        assert_eq!(fetched.summary, node.summary);
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn update_node_bumps_version_and_records_history() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");
        engine.create_node(&sample_node(&id)).unwrap();

        let mut next = sample_node(&id);
        next.summary = "revised after reanalysis".into();
        let updated = engine.update_node(next).unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.previous_versions.len(), 1);
        assert_eq!(engine.get_node(&id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn search_finds_node_by_summary_text() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");
        engine.create_node(&sample_node(&id)).unwrap();

        let results = engine.search_nodes_advanced("queue", None, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
    }

    #[test]
    fn edge_is_unique_per_source_target_type() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let edge = Edge {
            id: crate::ids::generate_edge_id(),
            source: "a".into(),
            target: "b".into(),
            edge_type: EdgeType::RelatedTo,
            metadata: serde_json::json!({}),
            created_by: CreatedBy::Daemon,
            created_at: Utc::now(),
        };
        engine.create_edge(&edge).unwrap();
        engine.create_edge(&edge).unwrap();
        assert!(engine.edge_exists("a", "b", &EdgeType::RelatedTo).unwrap());

        let conn = engine.connection();
        let count: i64 = conn.query_row("SELECT count(*) FROM edges", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn find_path_returns_shortest_route() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        for (s, t) in [("a", "b"), ("b", "c"), ("a", "c")] {
            engine
                .create_edge(&Edge {
                    id: crate::ids::generate_edge_id(),
                    source: s.into(),
                    target: t.into(),
                    edge_type: EdgeType::RelatedTo,
                    metadata: serde_json::json!({}),
                    created_by: CreatedBy::Daemon,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let path = engine.find_path("a", "c", 5).unwrap().unwrap();
        assert_eq!(path, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn find_path_respects_max_depth_cutoff() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        // Only the long route a-b-c-d exists; no direct a-d edge.
        for (s, t) in [("a", "b"), ("b", "c"), ("c", "d")] {
            engine
                .create_edge(&Edge {
                    id: crate::ids::generate_edge_id(),
                    source: s.into(),
                    target: t.into(),
                    edge_type: EdgeType::RelatedTo,
                    metadata: serde_json::json!({}),
                    created_by: CreatedBy::Daemon,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        assert!(engine.find_path("a", "d", 2).unwrap().is_none());
        let path = engine.find_path("a", "d", 3).unwrap().unwrap();
        assert_eq!(path, vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()]);
    }

    #[test]
    fn get_connected_nodes_respects_direction_and_depth() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        for (s, t) in [("a", "b"), ("b", "c")] {
            engine
                .create_edge(&Edge {
                    id: crate::ids::generate_edge_id(),
                    source: s.into(),
                    target: t.into(),
                    edge_type: EdgeType::RelatedTo,
                    metadata: serde_json::json!({}),
                    created_by: CreatedBy::Daemon,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let out = engine.get_connected_nodes("a", Direction::Outgoing, 5, &[]).unwrap();
        assert_eq!(out, vec!["b".to_string(), "c".to_string()]);

        let incoming = engine.get_connected_nodes("c", Direction::Incoming, 5, &[]).unwrap();
        assert_eq!(incoming, vec!["b".to_string(), "a".to_string()]);

        let bounded = engine.get_connected_nodes("a", Direction::Outgoing, 1, &[]).unwrap();
        assert_eq!(bounded, vec!["b".to_string()]);

        let filtered = engine.get_connected_nodes("a", Direction::Outgoing, 5, &[EdgeType::References]).unwrap();
        assert!(filtered.is_empty());
    }

    #[test]
    fn upsert_node_is_idempotent_on_unchanged_content() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");

        let (created, was_created) = engine.upsert_node(sample_node(&id)).unwrap();
        assert!(was_created);
        assert_eq!(created.version, 1);

        let (unchanged, was_created_again) = engine.upsert_node(sample_node(&id)).unwrap();
        assert!(!was_created_again);
        assert_eq!(unchanged.version, 1);
        assert_eq!(engine.get_node(&id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn upsert_node_bumps_version_on_changed_content() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");
        engine.upsert_node(sample_node(&id)).unwrap();

        let mut changed = sample_node(&id);
        changed.content = serde_json::json!({"raw": false});
        let (updated, was_created) = engine.upsert_node(changed).unwrap();
        assert!(!was_created);
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn create_node_populates_child_rows_from_analyzer_output() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");

        let mut node = sample_node(&id);
        node.content = serde_json::json!({
            "analyzerOutput": {
                "lessonsByLevel": {
                    "session": ["always lock before checking status"],
                    "project": [{"summary": "queue claims need optimistic locking", "tags": ["queue"]}],
                },
                "modelQuirks": [{"model": "claude", "frequency": 3, "severity": "medium", "summary": "over-explains diffs"}],
                "toolErrors": [{"tool": "bash", "errorType": "timeout", "model": "claude", "summary": "command hung"}],
                "daemonDecisions": ["skipped reanalysis, prompt version unchanged"],
            }
        });
        engine.create_node(&node).unwrap();

        let lessons = engine.lessons_for_node(&id).unwrap();
        assert_eq!(lessons.len(), 2);
        assert!(lessons.iter().any(|l| l.level == "project" && l.tags == vec!["queue".to_string()]));

        let quirks = engine.model_quirks_for_node(&id).unwrap();
        assert_eq!(quirks.len(), 1);
        assert_eq!(quirks[0].severity, Severity::Medium);

        let errors = engine.tool_errors_for_node(&id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tool, "bash");

        let conn = engine.connection();
        let decision_count: i64 =
            conn.query_row("SELECT count(*) FROM daemon_decisions WHERE node_id = ?1", params![id], |row| row.get(0)).unwrap();
        assert_eq!(decision_count, 1);
        drop(conn);

        let results = engine.search_nodes_advanced("optimistic", None, 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn update_node_replaces_child_rows_rather_than_accumulating() {
        let engine = StorageEngine::open_in_memory().unwrap();
        engine.migrate().unwrap();
        let id = generate_deterministic_node_id("sessions/a.jsonl", "e1", "e5");

        let mut first = sample_node(&id);
        first.content = serde_json::json!({
            "analyzerOutput": {"lessonsByLevel": {"session": ["first lesson"]}}
        });
        engine.create_node(&first).unwrap();
        assert_eq!(engine.lessons_for_node(&id).unwrap().len(), 1);

        let mut second = sample_node(&id);
        second.content = serde_json::json!({
            "analyzerOutput": {"lessonsByLevel": {"session": ["second lesson", "third lesson"]}}
        });
        engine.update_node(second).unwrap();

        let lessons = engine.lessons_for_node(&id).unwrap();
        assert_eq!(lessons.len(), 2);
        assert!(lessons.iter().all(|l| l.summary != "first lesson"));
    }
}
