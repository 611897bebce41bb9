//! Session log watcher: debounced filesystem watching over configured glob
//! patterns, emitting typed lifecycle events instead of raw filesystem
//! notifications.

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle event for one watched session file.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// First observed write to a path not previously tracked.
    New(PathBuf),
    /// A tracked file grew or was touched again.
    Changed(PathBuf),
    /// No writes observed for `idle_threshold_ms`; ready for boundary
    /// segmentation and analysis.
    Idle(PathBuf),
    /// The file disappeared from disk.
    Removed(PathBuf),
    /// The initial scan of pre-existing files under `sessionsDir` has
    /// completed and the watcher is now live.
    Ready,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub path: Option<PathBuf>,
    pub message: String,
}

struct FileState {
    last_seen: Instant,
    last_len: u64,
    idle_emitted: bool,
}

/// Watches `sessionsDir` for files matching the configured globs, tracking
/// per-file state and emitting debounced lifecycle events on `events`.
///
/// Idle detection does not depend solely on the next filesystem event for a
/// file: a background thread re-scans tracked file state on its own timer,
/// so a file that simply stops being written still crosses the idle
/// threshold and gets reported.
pub struct SessionWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    events_rx: Receiver<SessionEvent>,
    errors_rx: Receiver<ErrorEvent>,
    shutdown: Arc<AtomicBool>,
}

impl SessionWatcher {
    pub fn start(sessions_dir: &Path, config: &WatcherConfig) -> Result<Self> {
        let (events_tx, events_rx) = std::sync::mpsc::channel();
        let (errors_tx, errors_rx) = std::sync::mpsc::channel();

        let globs = config.globs.clone();
        let idle_threshold = Duration::from_millis(config.idle_threshold_ms);
        let sessions_dir_owned = sessions_dir.to_path_buf();
        let state: Arc<Mutex<HashMap<PathBuf, FileState>>> = Arc::new(Mutex::new(HashMap::new()));

        scan_existing_files(sessions_dir, &globs, &state, &events_tx);
        let _ = events_tx.send(SessionEvent::Ready);

        let debounce_state = Arc::clone(&state);
        let debounce_events_tx = events_tx.clone();
        let debounce_errors_tx = errors_tx.clone();
        let debounce_globs = globs.clone();
        let debounce_sessions_dir = sessions_dir_owned.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(500),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let mut state = debounce_state.lock().unwrap();
                    for event in events {
                        let path = event.path;
                        if !path_matches_globs(&path, &debounce_sessions_dir, &debounce_globs) {
                            continue;
                        }
                        handle_path_event(&path, &mut state, idle_threshold, &debounce_events_tx);
                    }
                }
                Err(errors) => {
                    for err in errors {
                        let _ = debounce_errors_tx.send(ErrorEvent {
                            path: None,
                            message: err.to_string(),
                        });
                    }
                }
            },
        )
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        debouncer
            .watcher()
            .watch(sessions_dir, RecursiveMode::Recursive)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        spawn_idle_poller(Arc::clone(&state), idle_threshold, events_tx, Arc::clone(&shutdown));

        Ok(SessionWatcher {
            _debouncer: debouncer,
            events_rx,
            errors_rx,
            shutdown,
        })
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events_rx
    }

    pub fn errors(&self) -> &Receiver<ErrorEvent> {
        &self.errors_rx
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Walks `root` once at startup and registers every pre-existing file
/// matching `globs` as a tracked `New` entry, so the watcher's idle clock
/// starts from process launch rather than waiting for a filesystem event
/// that may never come for an already-idle file.
fn scan_existing_files(
    root: &Path,
    globs: &[String],
    state: &Mutex<HashMap<PathBuf, FileState>>,
    tx: &Sender<SessionEvent>,
) {
    let mut stack = vec![root.to_path_buf()];
    let mut state = state.lock().unwrap();
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            if !path_matches_globs(&path, root, globs) {
                continue;
            }
            let Ok(metadata) = std::fs::metadata(&path) else { continue };
            state.insert(
                path.clone(),
                FileState {
                    last_seen: Instant::now(),
                    last_len: metadata.len(),
                    idle_emitted: false,
                },
            );
            let _ = tx.send(SessionEvent::New(path));
        }
    }
}

/// Background thread that re-checks tracked file state on its own clock,
/// independent of the debouncer's filesystem events, so idle detection
/// fires for a file that simply stops being written.
fn spawn_idle_poller(
    state: Arc<Mutex<HashMap<PathBuf, FileState>>>,
    idle_threshold: Duration,
    tx: Sender<SessionEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let poll_interval = (idle_threshold / 4).max(Duration::from_millis(250));
    std::thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(poll_interval);
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut state = state.lock().unwrap();
            scan_idle(&mut state, idle_threshold, &tx);
        }
    });
}

/// Emits `Idle` for every tracked file that has crossed `idle_threshold`
/// since its last observed write and hasn't already been reported idle.
fn scan_idle(state: &mut HashMap<PathBuf, FileState>, idle_threshold: Duration, tx: &Sender<SessionEvent>) {
    let now = Instant::now();
    for (path, entry) in state.iter_mut() {
        if !entry.idle_emitted && now.duration_since(entry.last_seen) >= idle_threshold {
            entry.idle_emitted = true;
            let _ = tx.send(SessionEvent::Idle(path.clone()));
        }
    }
}

fn path_matches_globs(path: &Path, root: &Path, globs: &[String]) -> bool {
    let Ok(relative) = path.strip_prefix(root) else { return false };
    let relative_str = relative.to_string_lossy();
    globs.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(&relative_str))
            .unwrap_or(false)
    })
}

fn handle_path_event(
    path: &Path,
    state: &mut HashMap<PathBuf, FileState>,
    idle_threshold: Duration,
    tx: &Sender<SessionEvent>,
) {
    let Ok(metadata) = std::fs::metadata(path) else {
        if state.remove(path).is_some() {
            let _ = tx.send(SessionEvent::Removed(path.to_path_buf()));
        }
        return;
    };

    let len = metadata.len();
    let now = Instant::now();

    match state.get_mut(path) {
        None => {
            state.insert(
                path.to_path_buf(),
                FileState {
                    last_seen: now,
                    last_len: len,
                    idle_emitted: false,
                },
            );
            let _ = tx.send(SessionEvent::New(path.to_path_buf()));
        }
        Some(entry) => {
            if len != entry.last_len {
                entry.last_len = len;
                entry.last_seen = now;
                entry.idle_emitted = false;
                let _ = tx.send(SessionEvent::Changed(path.to_path_buf()));
            } else if !entry.idle_emitted && now.duration_since(entry.last_seen) >= idle_threshold {
                entry.idle_emitted = true;
                let _ = tx.send(SessionEvent::Idle(path.to_path_buf()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_nested_jsonl_under_sessions_dir() {
        let root = Path::new("/data/sessions");
        let path = Path::new("/data/sessions/2026/07/abc.jsonl");
        assert!(path_matches_globs(path, root, &["**/*.jsonl".to_string()]));
    }

    #[test]
    fn glob_rejects_non_matching_extension() {
        let root = Path::new("/data/sessions");
        let path = Path::new("/data/sessions/notes.txt");
        assert!(!path_matches_globs(path, root, &["**/*.jsonl".to_string()]));
    }

    #[test]
    fn new_file_then_growth_then_idle_emits_expected_sequence() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut state = HashMap::new();
        let dir = std::env::temp_dir().join(format!("pi-brain-watch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("s.jsonl");
        std::fs::write(&file, "line one\n").unwrap();

        handle_path_event(&file, &mut state, Duration::from_millis(0), &tx);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::New(_)));

        std::fs::write(&file, "line one\nline two\n").unwrap();
        handle_path_event(&file, &mut state, Duration::from_millis(0), &tx);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Changed(_)));

        std::thread::sleep(Duration::from_millis(5));
        handle_path_event(&file, &mut state, Duration::from_millis(0), &tx);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Idle(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn scan_idle_fires_without_a_new_filesystem_event() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut state = HashMap::new();
        let dir = std::env::temp_dir().join(format!("pi-brain-watch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("s.jsonl");
        std::fs::write(&file, "line one\n").unwrap();

        handle_path_event(&file, &mut state, Duration::from_secs(3600), &tx);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::New(_)));
        assert!(rx.try_recv().is_err());

        std::thread::sleep(Duration::from_millis(5));
        scan_idle(&mut state, Duration::from_millis(0), &tx);
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Idle(_)));

        scan_idle(&mut state, Duration::from_millis(0), &tx);
        assert!(rx.try_recv().is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
