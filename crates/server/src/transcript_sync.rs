//! Transcript synchronizer.
//!
//! Tails the assistant's per-session JSONL transcript and turns it into an
//! ordered, deduplicated stream of entries. Every pass re-reads the whole
//! file; the seen-id set decides what is new. Passes run on debounced
//! filesystem notifications and on a fallback timer.

use std::collections::HashSet;
use std::future::pending;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use switchyard_protocol::{LineParse, TranscriptEntry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SyncTiming {
    pub debounce: Duration,
    pub fallback: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            fallback: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Entry(TranscriptEntry),
    /// A pass forwarded at least one assistant entry.
    Idle,
}

/// Where the assistant keeps the transcript for `session_id` started in `cwd`.
pub fn transcript_path(root: &Path, cwd: &Path, session_id: &str) -> PathBuf {
    let project: String = cwd
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    root.join(project).join(format!("{session_id}.jsonl"))
}

/// Result of one sync pass.
#[derive(Debug, Default)]
pub struct SyncPass {
    pub entries: Vec<TranscriptEntry>,
    pub saw_assistant: bool,
    pub skipped: usize,
}

/// Dedup state for the whole session. Survives retargeting and mode switches,
/// so neither a resumed transcript nor a second local run replays old records.
#[derive(Debug, Default)]
pub struct TranscriptCursor {
    seen: Mutex<HashSet<String>>,
}

impl TranscriptCursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an id relayed by another path. Returns false if it was known.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.seen().insert(id.to_string())
    }

    pub fn sync(&self, contents: &str) -> SyncPass {
        let mut seen = self.seen();
        let mut pass = SyncPass::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match TranscriptEntry::parse_line(line) {
                LineParse::Entry(entry) => {
                    if !seen.insert(entry.id.clone()) {
                        continue;
                    }
                    pass.saw_assistant |= entry.is_assistant();
                    pass.entries.push(entry);
                }
                LineParse::Internal => {}
                LineParse::Invalid(reason) => {
                    pass.skipped += 1;
                    debug!(
                        component = "transcript_sync",
                        event = "transcript_sync.line.skipped",
                        reason = %reason,
                        "Skipping unparseable transcript line"
                    );
                }
            }
        }
        pass
    }

    /// Read `path` and sync it. A missing file is an empty pass.
    pub async fn sync_file(&self, path: &Path) -> io::Result<SyncPass> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(self.sync(&contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(SyncPass::default()),
            Err(err) => Err(err),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen().len()
    }
}

/// Where to tail and how often.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub root: PathBuf,
    pub cwd: PathBuf,
    pub timing: SyncTiming,
}

/// Start tailing. The target follows `session_ids`; entries not yet in
/// `cursor` go to `events`.
pub fn spawn_transcript_sync(
    target: SyncTarget,
    cursor: Arc<TranscriptCursor>,
    session_ids: watch::Receiver<Option<String>>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let SyncTarget { root, cwd, timing } = target;
    let runtime = SyncRuntime {
        root,
        cwd,
        timing,
        cursor,
        target: None,
        watcher: None,
        events,
    };
    tokio::spawn(runtime.run(session_ids, cancel))
}

struct SyncRuntime {
    root: PathBuf,
    cwd: PathBuf,
    timing: SyncTiming,
    cursor: Arc<TranscriptCursor>,
    target: Option<PathBuf>,
    watcher: Option<RecommendedWatcher>,
    events: mpsc::UnboundedSender<TranscriptEvent>,
}

impl SyncRuntime {
    async fn run(
        mut self,
        mut session_ids: watch::Receiver<Option<String>>,
        cancel: CancellationToken,
    ) {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<()>();
        let mut ids_open = true;
        let mut fallback = tokio::time::interval(self.timing.fallback);
        let mut debounce_at: Option<Instant> = None;

        let initial = session_ids.borrow_and_update().clone();
        if let Some(id) = initial {
            self.retarget(&id, &fs_tx).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = session_ids.changed(), if ids_open => {
                    if changed.is_err() {
                        ids_open = false;
                        continue;
                    }
                    let id = session_ids.borrow_and_update().clone();
                    if let Some(id) = id {
                        self.retarget(&id, &fs_tx).await;
                    }
                }
                Some(()) = fs_rx.recv() => {
                    debounce_at = Some(Instant::now() + self.timing.debounce);
                }
                _ = sleep_until_opt(debounce_at), if debounce_at.is_some() => {
                    debounce_at = None;
                    self.pass().await;
                }
                _ = fallback.tick() => {
                    if self.watcher.is_none() && self.target.is_some() {
                        self.watch_target(&fs_tx);
                    }
                    self.pass().await;
                }
            }
        }

        debug!(
            component = "transcript_sync",
            event = "transcript_sync.stopped",
            seen = self.cursor.seen_count(),
            "Transcript sync stopped"
        );
    }

    async fn retarget(&mut self, session_id: &str, fs_tx: &mpsc::UnboundedSender<()>) {
        let path = transcript_path(&self.root, &self.cwd, session_id);
        if self.target.as_ref() == Some(&path) {
            return;
        }
        info!(
            component = "transcript_sync",
            event = "transcript_sync.retarget",
            path = %path.display(),
            "Following transcript"
        );
        self.target = Some(path);
        self.watcher = None;
        self.watch_target(fs_tx);
        self.pass().await;
    }

    /// Watch the transcript's directory; the file itself may not exist yet.
    fn watch_target(&mut self, fs_tx: &mpsc::UnboundedSender<()>) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let Some(dir) = target.parent().map(Path::to_path_buf) else {
            return;
        };
        if !dir.is_dir() {
            return;
        }

        let tx = fs_tx.clone();
        let file = target.clone();
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches_change(&event.kind) && event.paths.iter().any(|p| p == &file) {
                        let _ = tx.send(());
                    }
                }
                Err(err) => {
                    warn!(
                        component = "transcript_sync",
                        event = "transcript_sync.fs_event_error",
                        error = %err,
                        "Transcript watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )
        .and_then(|mut watcher| {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        match watcher {
            Ok(watcher) => self.watcher = Some(watcher),
            Err(err) => warn!(
                component = "transcript_sync",
                event = "transcript_sync.watch_failed",
                path = %dir.display(),
                error = %err,
                "Falling back to timer-only sync"
            ),
        }
    }

    async fn pass(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let pass = match self.cursor.sync_file(&target).await {
            Ok(pass) => pass,
            Err(err) => {
                warn!(
                    component = "transcript_sync",
                    event = "transcript_sync.read_failed",
                    path = %target.display(),
                    error = %err,
                    "Failed to read transcript"
                );
                return;
            }
        };

        if !pass.entries.is_empty() {
            debug!(
                component = "transcript_sync",
                event = "transcript_sync.pass",
                forwarded = pass.entries.len(),
                skipped = pass.skipped,
                "Forwarding new transcript entries"
            );
        }
        for entry in pass.entries {
            let _ = self.events.send(TranscriptEvent::Entry(entry));
        }
        if pass.saw_assistant {
            let _ = self.events.send(TranscriptEvent::Idle);
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

fn matches_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}
