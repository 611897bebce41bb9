//! Content-addressed and random id generation.

use sha2::{Digest, Sha256};

/// `generateDeterministicNodeId`: 16 hex chars from a length-prefixed
/// SHA-256 of `(sessionFile, segmentStart, segmentEnd)`.
///
/// Length-prefixing each field defeats delimiter collisions: `"a:b" + "c"`
/// and `"a" + "b:c"` hash to different digests even though a naive
/// `join(":")` would not distinguish them.
pub fn generate_deterministic_node_id(session_file: &str, segment_start: &str, segment_end: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [session_file, segment_start, segment_end] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Random 16-hex-char id for jobs, drawn from the same shape as node ids but
/// not content-addressed. Node and job ids never collide in practice since
/// lookups are typed (a job id is never looked up in the nodes table).
pub fn generate_job_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(uuid.as_bytes())[..16].to_string()
}

/// Random edge id, prefixed to make edge ids visually distinct in logs.
pub fn generate_edge_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    format!("edg_{}", hex::encode(&uuid.as_bytes()[..8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        let a = generate_deterministic_node_id("sess/abc.jsonl", "e1", "e5");
        let b = generate_deterministic_node_id("sess/abc.jsonl", "e1", "e5");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn node_id_distinguishes_delimiter_collisions() {
        let a = generate_deterministic_node_id("a:b", "c", "x");
        let b = generate_deterministic_node_id("a", "b:c", "x");
        assert_ne!(a, b);
    }

    #[test]
    fn job_and_edge_ids_vary_per_call() {
        assert_ne!(generate_job_id(), generate_job_id());
        assert_ne!(generate_edge_id(), generate_edge_id());
    }
}
