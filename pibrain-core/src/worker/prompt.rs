//! Analysis prompt assembly from job context.

use serde_json::Value;

/// The fields a worker pulls out of a job's JSON payload to build a prompt.
pub struct JobContext<'a> {
    pub session_file: &'a str,
    pub segment_start: &'a str,
    pub segment_end: &'a str,
    pub prior_node_summary: Option<&'a str>,
    pub reanalysis_hint: Option<&'a str>,
}

impl<'a> JobContext<'a> {
    pub fn from_payload(payload: &'a Value) -> Option<Self> {
        Some(JobContext {
            session_file: payload.get("sessionFile")?.as_str()?,
            segment_start: payload.get("segmentStart")?.as_str()?,
            segment_end: payload.get("segmentEnd")?.as_str()?,
            prior_node_summary: payload.get("priorNodeSummary").and_then(|v| v.as_str()),
            reanalysis_hint: payload.get("reanalysisHint").and_then(|v| v.as_str()),
        })
    }
}

/// Renders the analysis prompt, with prompt text captured alongside the node
/// (callers persist the returned string as part of the node's content blob).
pub fn build_prompt(prompt_template: &str, context: &JobContext, skills: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(prompt_template);
    prompt.push_str("\n\n");
    prompt.push_str(&format!("Session file: {}\n", context.session_file));
    prompt.push_str(&format!("Segment: [{}, {}]\n", context.segment_start, context.segment_end));
    if !skills.is_empty() {
        prompt.push_str(&format!("Skills: {}\n", skills.join(", ")));
    }
    if let Some(prior) = context.prior_node_summary {
        prompt.push_str(&format!("\nPrior analysis summary:\n{prior}\n"));
    }
    if let Some(hint) = context.reanalysis_hint {
        prompt.push_str(&format!("\nReanalysis hint:\n{hint}\n"));
    }
    prompt.push_str("\nReturn only one JSON object with fields: summary, type, outcome, decisions, lessonsByLevel, tags, topics.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_prompt_with_segment_and_skills() {
        let payload = json!({
            "sessionFile": "sess/abc.jsonl",
            "segmentStart": "e1",
            "segmentEnd": "e5",
        });
        let context = JobContext::from_payload(&payload).unwrap();
        let prompt = build_prompt("base instructions", &context, &["rust".to_string()]);
        assert!(prompt.contains("sess/abc.jsonl"));
        assert!(prompt.contains("[e1, e5]"));
        assert!(prompt.contains("rust"));
    }

    #[test]
    fn includes_prior_summary_when_present() {
        let payload = json!({
            "sessionFile": "sess/abc.jsonl",
            "segmentStart": "e1",
            "segmentEnd": "e5",
            "priorNodeSummary": "previously fixed X",
        });
        let context = JobContext::from_payload(&payload).unwrap();
        let prompt = build_prompt("base", &context, &[]);
        assert!(prompt.contains("previously fixed X"));
    }
}
