//! Subprocess invocation of the external analyzer binary.

use crate::config::AnalyzerConfig;
use crate::error::{ClassifiedError, Reason};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Captured result of one analyzer invocation.
pub struct AnalyzerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Confirms the analyzer binary is resolvable and required skills are
/// declared. A missing binary is a permanent environment failure — retrying
/// won't fix a misconfigured daemon.
pub fn validate_environment(config: &AnalyzerConfig) -> Result<(), ClassifiedError> {
    let resolvable = which(&config.binary).is_some() || std::path::Path::new(&config.binary).is_file();
    if !resolvable {
        return Err(ClassifiedError::permanent(
            Reason::ENVIRONMENT,
            format!("analyzer binary not found: {}", config.binary),
        ));
    }
    Ok(())
}

fn which(binary: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Pipes `prompt` on stdin, waits on a dedicated thread with a bounded
/// timeout via `recv_timeout` (the core is synchronous/thread-pool based, so
/// this avoids pulling tokio onto the worker's hot path).
pub fn invoke(config: &AnalyzerConfig, prompt: &str, skills: &[String]) -> Result<AnalyzerOutput, ClassifiedError> {
    let started = Instant::now();
    let mut command = Command::new(&config.binary);
    command
        .arg("--skills")
        .arg(skills.join(","))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| {
        ClassifiedError::transient(Reason::IO, format!("failed to spawn analyzer: {e}"))
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(prompt.as_bytes());
    }

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = child.wait_with_output();
        let _ = tx.send(result);
    });

    let timeout = Duration::from_millis(config.timeout_ms);
    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let duration_ms = started.elapsed().as_millis() as u64;
            classify_exit(output.status.code(), &stdout, &stderr, duration_ms)
        }
        Ok(Err(e)) => Err(ClassifiedError::transient(Reason::IO, format!("analyzer wait failed: {e}"))),
        Err(_) => Err(ClassifiedError::transient(
            Reason::TIMEOUT,
            format!("analyzer exceeded {}ms timeout", config.timeout_ms),
        )),
    }
}

fn classify_exit(exit_code: Option<i32>, stdout: &str, stderr: &str, duration_ms: u64) -> Result<AnalyzerOutput, ClassifiedError> {
    match exit_code {
        Some(0) => Ok(AnalyzerOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
            duration_ms,
        }),
        _ if stderr.to_ascii_lowercase().contains("rate limit") => {
            Err(ClassifiedError::transient(Reason::RATE_LIMIT, "analyzer reported rate limit"))
        }
        _ => Err(ClassifiedError::transient(
            Reason::ANALYZER_FAILED,
            format!("analyzer exited with {:?}: {stderr}", exit_code),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_exit_success_passes_through_output() {
        let result = classify_exit(Some(0), "{}", "", 12).unwrap();
        assert_eq!(result.stdout, "{}");
    }

    #[test]
    fn classify_exit_rate_limit_is_transient() {
        let err = classify_exit(Some(1), "", "error: rate limit exceeded", 5).unwrap_err();
        assert_eq!(err.reason.0, Reason::RATE_LIMIT);
    }

    #[test]
    fn classify_exit_other_failure_is_transient_analyzer_failed() {
        let err = classify_exit(Some(2), "", "boom", 5).unwrap_err();
        assert_eq!(err.reason.0, Reason::ANALYZER_FAILED);
    }

    #[test]
    fn validate_environment_rejects_missing_binary() {
        let config = AnalyzerConfig {
            binary: "definitely-not-a-real-analyzer-binary".to_string(),
            timeout_ms: 1000,
            required_skills: vec![],
            optional_skills: vec![],
        };
        let err = validate_environment(&config).unwrap_err();
        assert_eq!(err.reason.0, Reason::ENVIRONMENT);
    }
}
