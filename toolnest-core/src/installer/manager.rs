//! Installation orchestrator.
//!
//! The `InstallOrchestrator` is the main entry point for installing tools.
//! It runs one pipeline per tool on the Tokio runtime:
//!
//! Pending -> Downloading -> Extracting -> Normalizing -> Registering -> Completed
//!
//! A job may also end early in Failed or Cancelled. Every state change is sent
//! as an [`InstallEvent`] to a single consumer. Once all jobs of a run
//! are terminal, one `AllDone` event closes the run.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::downloader::{Downloader, HttpTransport, RetryPolicy, Transport};
use super::error::{InstallError, InstallResult};
use super::env::{system_path_store, MemoryPathStore, PathRegistrar, PathStore};
use super::events::{EventSender, InstallEvent, RunSummary};
use super::extractor::extract_archive;
use super::layout::{normalize, resolve_bin_dir};
use super::manifest::{load_manifest_from, save_manifest_to};
use super::paths::{manifest_path, ToolPaths};
use super::types::{Completion, InstallJob, Stage, ToolSpec};
use crate::config::{PathStoreKind, Settings};

// ============================================================================
// Shared State
// ============================================================================

/// Collaborators shared by every pipeline.
struct Shared {
    downloader: Downloader,
    registrar: PathRegistrar,
    events: EventSender,
    /// Serializes read-modify-write of the install manifest.
    manifest_lock: tokio::sync::Mutex<()>,
}

/// One batch of jobs sharing a cancellation token and an `AllDone` event.
struct Run {
    cancel: CancellationToken,
    tally: Mutex<RunTally>,
}

#[derive(Default)]
struct RunTally {
    /// Jobs of this run that are not yet terminal.
    remaining: usize,
    summary: RunSummary,
}

impl Run {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            tally: Mutex::new(RunTally::default()),
        })
    }

    /// Counts a finished job and closes the run after its last job.
    fn finish_job(&self, events: &EventSender, outcome: Stage) {
        let mut tally = lock(&self.tally);
        match outcome {
            Stage::Completed => tally.summary.completed += 1,
            Stage::Cancelled => tally.summary.cancelled += 1,
            _ => tally.summary.failed += 1,
        }
        tally.remaining = tally.remaining.saturating_sub(1);

        if tally.remaining == 0 {
            let summary = tally.summary;
            info!(
                "All installs finished: {} completed, {} failed, {} cancelled",
                summary.completed, summary.failed, summary.cancelled
            );
            let _ = events.send(InstallEvent::AllDone(summary));
        }
    }
}

/// Jobs and tasks known to the orchestrator.
struct RunState {
    /// Jobs in start order. Older runs that are still unwinding stay listed.
    jobs: Vec<(String, Arc<Mutex<InstallJob>>)>,
    handles: Vec<JoinHandle<()>>,
    current: Arc<Run>,
}

impl RunState {
    fn new() -> Self {
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            current: Run::new(),
        }
    }

    fn is_running(&self, tool: &str) -> bool {
        self.jobs
            .iter()
            .any(|(name, job)| name == tool && !lock(job).is_terminal())
    }

    /// Replaces a finished or cancelled run with a fresh one.
    fn begin_run_if_needed(&mut self) {
        let finished = lock(&self.current.tally).remaining == 0;
        if !finished && !self.current.cancel.is_cancelled() {
            return;
        }
        if !finished {
            debug!("Previous run is still unwinding after a cancel, starting a new run");
        }
        self.current = Run::new();
        self.jobs.retain(|(_, job)| !lock(job).is_terminal());
        self.handles.retain(|handle| !handle.is_finished());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives concurrent tool installations and reports their progress.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct InstallOrchestrator {
    shared: Arc<Shared>,
    state: Arc<Mutex<RunState>>,
}

impl InstallOrchestrator {
    /// Creates an orchestrator that reports to `events`.
    pub fn new(downloader: Downloader, registrar: PathRegistrar, events: EventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                downloader,
                registrar,
                events,
                manifest_lock: tokio::sync::Mutex::new(()),
            }),
            state: Arc::new(Mutex::new(RunState::new())),
        }
    }

    /// Creates an orchestrator wired to the HTTP transport and the path store
    /// selected in `settings`.
    pub fn from_settings(settings: &Settings, events: EventSender) -> InstallResult<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(Duration::from_secs(
            settings.request_timeout_secs,
        ))?);
        let retry = RetryPolicy {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.backoff_base_ms),
        };
        let store: Arc<dyn PathStore> = match settings.path_store {
            PathStoreKind::System => system_path_store()?,
            PathStoreKind::Memory => Arc::new(MemoryPathStore::default()),
        };

        Ok(Self::new(
            Downloader::new(transport, retry),
            PathRegistrar::new(store, settings.dedupe_path_entries),
            events,
        ))
    }

    /// Starts a pipeline for every tool that has no running job.
    ///
    /// Returns immediately. When no job is running, or the current run was
    /// cancelled, this begins a new run with a fresh cancellation token and its
    /// own `AllDone`. Finished jobs of earlier runs are forgotten. Jobs of a
    /// cancelled run that are still unwinding stay listed and are not restarted.
    /// Must be called from within a Tokio runtime.
    pub fn start_all(&self, tools: &[ToolSpec], target_root: &Path) {
        let mut state = lock(&self.state);
        state.begin_run_if_needed();

        let run = Arc::clone(&state.current);
        // Held for the whole batch so the run cannot close halfway through.
        let mut tally = lock(&run.tally);
        let mut started = 0;

        for spec in tools {
            if state.is_running(&spec.name) {
                debug!("{} is already being installed, skipping", spec.name);
                continue;
            }
            state.jobs.retain(|(name, _)| name != &spec.name);

            let job = Arc::new(Mutex::new(InstallJob::new(spec.name.clone())));
            state.jobs.push((spec.name.clone(), Arc::clone(&job)));
            tally.remaining += 1;
            started += 1;

            let handle = JobHandle {
                tool: spec.name.clone(),
                job,
                events: self.shared.events.clone(),
            };
            handle.emit(InstallEvent::Status {
                tool: spec.name.clone(),
                stage: Stage::Pending,
            });

            let pipeline = Pipeline {
                shared: Arc::clone(&self.shared),
                spec: spec.clone(),
                target_root: target_root.to_path_buf(),
                cancel: run.cancel.clone(),
                handle: handle.clone(),
            };
            let run = Arc::clone(&run);
            let events = self.shared.events.clone();

            state.handles.push(tokio::spawn(async move {
                // A panicking pipeline still has to close its job.
                let outcome = match tokio::spawn(pipeline.run()).await {
                    Ok(outcome) => outcome,
                    Err(e) => handle.failed(format!("Install task panicked: {}", e)),
                };
                run.finish_job(&events, outcome);
            }));
        }

        info!(
            "Installing {} tool(s) into {}",
            started,
            target_root.display()
        );
    }

    /// Asks every running job to stop at its next check point.
    ///
    /// Jobs already in Registering or Completed are unaffected. The next
    /// `start_all` begins a new run even while cancelled jobs are unwinding.
    pub fn cancel_all(&self) {
        let state = lock(&self.state);
        let remaining = lock(&state.current.tally).remaining;
        if remaining > 0 {
            info!("Cancelling {} running install(s)", remaining);
        }
        state.current.cancel.cancel();
    }

    /// True when every job is terminal (also when no job was started).
    pub fn is_all_done(&self) -> bool {
        lock(&self.state)
            .jobs
            .iter()
            .all(|(_, job)| lock(job).is_terminal())
    }

    /// Waits until every spawned pipeline has returned.
    pub async fn wait(&self) {
        loop {
            let handles = std::mem::take(&mut lock(&self.state).handles);
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!("Install task panicked: {}", e);
                }
            }
        }
    }

    /// Snapshot of all job records, in start order.
    pub fn jobs(&self) -> Vec<InstallJob> {
        lock(&self.state)
            .jobs
            .iter()
            .map(|(_, job)| lock(job).clone())
            .collect()
    }

    /// Snapshot of one job record.
    pub fn job(&self, tool: &str) -> Option<InstallJob> {
        lock(&self.state)
            .jobs
            .iter()
            .find(|(name, _)| name == tool)
            .map(|(_, job)| lock(job).clone())
    }

    /// Counts of the current run's jobs that have finished so far.
    pub fn summary(&self) -> RunSummary {
        let state = lock(&self.state);
        let summary = lock(&state.current.tally).summary;
        summary
    }
}

// ============================================================================
// Job Handle
// ============================================================================

/// Owned handle through which a pipeline updates its job and reports events.
#[derive(Clone)]
struct JobHandle {
    tool: String,
    job: Arc<Mutex<InstallJob>>,
    events: EventSender,
}

impl JobHandle {
    fn emit(&self, event: InstallEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.events.send(event);
    }

    /// Moves the job to `stage` and reports it.
    fn enter(&self, stage: Stage) -> bool {
        let moved = lock(&self.job).transition(stage);
        if moved {
            info!("{}: {}", self.tool, stage.label());
            self.emit(InstallEvent::Status {
                tool: self.tool.clone(),
                stage,
            });
        } else {
            warn!("{}: refused transition to {}", self.tool, stage);
        }
        moved
    }

    /// Records stage-local progress, reporting at most once per percent.
    fn progress(&self, stage: Stage, fraction: f64) {
        let (before, after, overall) = {
            let mut job = lock(&self.job);
            let before = job.stage_progress(stage);
            let overall = job.record_progress(stage, fraction);
            (before, job.stage_progress(stage), overall)
        };

        let step = (after * 100.0).floor() > (before * 100.0).floor();
        let first = before == 0.0 && after > 0.0;
        if step || first {
            self.emit(InstallEvent::Progress {
                tool: self.tool.clone(),
                stage,
                fraction: after,
                overall,
            });
        }
    }

    fn cancelled(&self) -> Stage {
        self.enter(Stage::Cancelled);
        info!("{}: installation cancelled", self.tool);
        Stage::Cancelled
    }

    fn failed(&self, err: impl Display) -> Stage {
        let message = err.to_string();
        let stage = {
            let mut job = lock(&self.job);
            let stage = job.stage();
            if !job.fail(message.clone()) {
                return job.stage();
            }
            stage
        };

        error!("{}: failed during {}: {}", self.tool, stage, message);
        self.emit(InstallEvent::Status {
            tool: self.tool.clone(),
            stage: Stage::Failed,
        });
        self.emit(InstallEvent::Failed {
            tool: self.tool.clone(),
            stage,
            message,
        });
        Stage::Failed
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// One tool's installation, run on its own task.
struct Pipeline {
    shared: Arc<Shared>,
    spec: ToolSpec,
    target_root: PathBuf,
    cancel: CancellationToken,
    handle: JobHandle,
}

impl Pipeline {
    /// Runs every stage and returns the terminal stage reached.
    async fn run(self) -> Stage {
        let paths = match ToolPaths::for_tool(&self.spec, &self.target_root) {
            Ok(paths) => paths,
            Err(e) => return self.handle.failed(e),
        };

        // Downloading
        if self.cancel.is_cancelled() {
            return self.handle.cancelled();
        }
        self.handle.enter(Stage::Downloading);
        let archive_size = match self.download(&paths).await {
            Ok(Completion::Finished(size)) => size,
            Ok(Completion::Cancelled) => return self.handle.cancelled(),
            Err(e) => return self.handle.failed(e),
        };

        // Extracting
        if self.cancel.is_cancelled() {
            return self.handle.cancelled();
        }
        self.handle.enter(Stage::Extracting);
        match self.extract(&paths).await {
            Ok(Completion::Finished(_)) => {}
            Ok(Completion::Cancelled) => return self.handle.cancelled(),
            Err(e) => return self.handle.failed(e),
        }

        // Normalizing
        if self.cancel.is_cancelled() {
            return self.handle.cancelled();
        }
        self.handle.enter(Stage::Normalizing);
        let bin_dir = match self.normalize(&paths).await {
            Ok(bin_dir) => bin_dir,
            Err(e) => return self.handle.failed(e),
        };

        // Registering is not interruptible once entered.
        if self.cancel.is_cancelled() {
            return self.handle.cancelled();
        }
        self.handle.enter(Stage::Registering);
        let registrar_shared = Arc::clone(&self.shared);
        let dir = bin_dir.clone();
        let registration =
            tokio::task::spawn_blocking(move || registrar_shared.registrar.register(&dir)).await;
        let registration = match registration {
            Ok(Ok(registration)) => registration,
            Ok(Err(e)) => return self.handle.failed(e),
            Err(e) => return self.handle.failed(format!("Registration task failed: {}", e)),
        };
        self.handle.progress(Stage::Registering, 1.0);

        self.handle.enter(Stage::Completed);
        info!(
            "{} installed successfully, {} is on the search path",
            self.spec.name,
            registration.dir.display()
        );

        self.record_install(archive_size, registration.dir).await;
        Stage::Completed
    }

    async fn download(&self, paths: &ToolPaths) -> InstallResult<Completion<u64>> {
        if let Ok(metadata) = tokio::fs::metadata(&paths.archive).await {
            if metadata.is_file() {
                info!(
                    "{}: using existing archive {}",
                    self.spec.name,
                    paths.archive.display()
                );
                self.handle.progress(Stage::Downloading, 1.0);
                return Ok(Completion::Finished(metadata.len()));
            }
        }

        let handle = &self.handle;
        self.shared
            .downloader
            .fetch(
                &self.spec.url,
                &paths.archive,
                |fraction| handle.progress(Stage::Downloading, fraction),
                &self.cancel,
            )
            .await
    }

    async fn extract(&self, paths: &ToolPaths) -> InstallResult<Completion<usize>> {
        let archive = paths.archive.clone();
        let install_dir = paths.install_dir.clone();
        let format = paths.format;
        let cancel = self.cancel.clone();
        let handle = self.handle.clone();

        tokio::task::spawn_blocking(move || {
            extract_archive(
                &archive,
                &install_dir,
                format,
                &|fraction| handle.progress(Stage::Extracting, fraction),
                &cancel,
            )
        })
        .await
        .unwrap_or_else(|e| {
            Err(InstallError::extract(
                &paths.archive,
                format!("Extraction task failed: {}", e),
            ))
        })
    }

    async fn normalize(&self, paths: &ToolPaths) -> Result<PathBuf, String> {
        let install_dir = paths.install_dir.clone();
        let bin_subdir = self.spec.bin_subdir.clone();
        let single = self.spec.single_executable;

        tokio::task::spawn_blocking(move || {
            let base = normalize(&install_dir, &bin_subdir, single);
            resolve_bin_dir(&base, &bin_subdir, single)
        })
        .await
        .map_err(|e| format!("Normalization task failed: {}", e))
    }

    async fn record_install(&self, archive_size: u64, bin_dir: PathBuf) {
        let _guard = self.shared.manifest_lock.lock().await;
        let path = manifest_path(&self.target_root);

        let result = load_manifest_from(&path).and_then(|mut manifest| {
            manifest.mark_installed(
                &self.spec.name,
                self.spec.version.clone(),
                archive_size,
                bin_dir,
            );
            save_manifest_to(&manifest, &path)
        });

        if let Err(e) = result {
            warn!(
                "{}: installed but failed to update manifest: {:#}",
                self.spec.name, e
            );
        }
    }
}
