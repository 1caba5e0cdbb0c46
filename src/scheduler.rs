//! The orchestration core.
//!
//! [`LintEngine`] owns the per-document scheduling state machine:
//! document events arm a debounce timer (modify only), the timer fires
//! into a dispatch that snapshots the document, matches linters, and
//! fans out one bounded-concurrency task per applicable linter. Each
//! task runs settings resolution, command construction, the subprocess
//! and output parsing on its own, so units of the same document complete
//! in any order; the result store's revision watermark is what keeps the
//! published diagnostics from ever going backwards.
//!
//! A single linter failing (crash, timeout, vanished executable) is
//! isolated to its (document, linter) slot and never aborts sibling
//! units or the scheduler itself.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, broadcast, watch};

use crate::command;
use crate::diagnostics::Diagnostic;
use crate::document::{DocumentId, DocumentSnapshot, LintMode, Revision, TriggerReason};
use crate::matcher;
use crate::parser;
use crate::process::{self, ProcessError};
use crate::settings::{EffectiveSettings, RcFileProvider, SettingsProvider, SettingsSnapshot};
use crate::spec::LinterRegistry;
use crate::store::{AcceptOutcome, EngineEvent, ResultStore, ViewDiagnosticSet};

/// Floor for the debounce delay; anything lower just burns dispatches.
const MIN_DEBOUNCE_DELAY: Duration = Duration::from_millis(5);
/// Cap on the runtime-derived automatic delay.
const MAX_AUTOMATIC_DELAY: Duration = Duration::from_secs(2);
/// How many recent run times feed the adaptive delay.
const RUNTIME_WINDOW: usize = 10;

/// One unit of work: a linter to run on some regions of a snapshot,
/// fully owned so it can cross into a spawned task.
struct RunUnit {
    linter: String,
    effective: EffectiveSettings,
    regions: Vec<std::ops::Range<usize>>,
    mode: LintMode,
}

struct PendingRequest {
    snapshot: DocumentSnapshot,
    reason: TriggerReason,
    only: Option<Vec<String>>,
}

struct DocumentState {
    /// Bumped on every (re)arm of the debounce timer; a timer that
    /// wakes up with an old generation lost the race and goes away.
    generation: u64,
    /// Strictly increasing per dispatched request.
    sequence: u64,
    latest_revision: Revision,
    pending: Option<PendingRequest>,
    /// Cancellation signal for the currently in-flight request.
    cancel: watch::Sender<bool>,
    /// Linters with a configuration failure, keyed to the settings
    /// version that produced it; a settings change re-validates.
    deactivated: HashMap<String, u64>,
    assigned: Vec<String>,
}

impl DocumentState {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            generation: 0,
            sequence: 0,
            latest_revision: Revision(0),
            pending: None,
            cancel,
            deactivated: HashMap::new(),
            assigned: Vec::new(),
        }
    }
}

struct EngineInner {
    registry: LinterRegistry,
    providers: Vec<Box<dyn SettingsProvider>>,
    settings: RwLock<Arc<SettingsSnapshot>>,
    store: ResultStore,
    permits: Arc<Semaphore>,
    documents: Mutex<HashMap<DocumentId, DocumentState>>,
    runtimes: Mutex<VecDeque<Duration>>,
}

/// The lint scheduling and execution pipeline. Cheap to clone; all
/// clones share one engine.
#[derive(Clone)]
pub struct LintEngine {
    inner: Arc<EngineInner>,
}

impl LintEngine {
    pub fn new(registry: LinterRegistry, settings: SettingsSnapshot) -> Self {
        let mut providers: Vec<Box<dyn SettingsProvider>> = Vec::new();
        if settings.global.support_rc_files {
            providers.push(Box::new(RcFileProvider::new(settings.global.rc_search_limit)));
        }

        let permits = Arc::new(Semaphore::new(settings.global.max_concurrent_tasks.max(1)));
        // seed so the adaptive delay has something to chew on before the
        // first few runs complete
        let runtimes = VecDeque::from(vec![Duration::from_millis(600); 3]);

        Self {
            inner: Arc::new(EngineInner {
                registry,
                providers,
                settings: RwLock::new(Arc::new(settings)),
                store: ResultStore::new(),
                permits,
                documents: Mutex::new(HashMap::new()),
                runtimes: Mutex::new(runtimes),
            }),
        }
    }

    /// Add a settings provider (rc files, shebang readers, ...).
    pub fn with_provider(mut self, provider: Box<dyn SettingsProvider>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("providers must be added before the engine is shared")
            .providers
            .push(provider);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.store.subscribe()
    }

    pub fn diagnostics(&self, document: DocumentId) -> Option<ViewDiagnosticSet> {
        self.inner.store.diagnostics(document)
    }

    /// Swap in a fresh settings snapshot. Configuration-deactivated
    /// linters get re-validated on their next run because deactivation
    /// is keyed to the snapshot version.
    pub fn update_settings(&self, settings: SettingsSnapshot) {
        let mut guard = self.inner.settings.write().expect("settings lock poisoned");
        log::info!(
            "settings updated: version {} -> {}",
            guard.version,
            settings.version
        );
        *guard = Arc::new(settings);
    }

    fn settings(&self) -> Arc<SettingsSnapshot> {
        self.inner.settings.read().expect("settings lock poisoned").clone()
    }

    /// A document event arrived. Re-arms the per-document debounce timer
    /// for modify events; load/save/manual dispatch immediately.
    /// Per-linter lint modes are honored at dispatch time.
    pub fn notify(&self, snapshot: DocumentSnapshot, reason: TriggerReason) {
        let settings = self.settings();
        let id = snapshot.id;

        if reason == TriggerReason::Modify {
            self.clear_non_background(&snapshot, &settings);
        }

        let delay = if reason == TriggerReason::Modify {
            self.debounce_delay(Duration::from_millis(settings.global.delay))
        } else {
            Duration::ZERO
        };

        let generation = {
            let mut documents = self.inner.documents.lock().expect("documents lock poisoned");
            let state = documents.entry(id).or_insert_with(DocumentState::new);
            state.latest_revision = state.latest_revision.max(snapshot.revision);
            state.generation += 1;
            state.pending = Some(PendingRequest { snapshot, reason, only: None });
            state.generation
        };

        log::debug!("debouncing {:?} for {:?} ({:?})", id, delay, reason);
        let engine = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            engine.dispatch(id, generation).await;
        });
    }

    /// Manual entry point: lint now, optionally only the named linters.
    /// Usable both from a user command and programmatically.
    pub fn lint(&self, snapshot: DocumentSnapshot, only: Option<Vec<String>>) {
        let id = snapshot.id;
        let generation = {
            let mut documents = self.inner.documents.lock().expect("documents lock poisoned");
            let state = documents.entry(id).or_insert_with(DocumentState::new);
            state.latest_revision = state.latest_revision.max(snapshot.revision);
            state.generation += 1;
            state.pending = Some(PendingRequest {
                snapshot,
                reason: TriggerReason::Manual,
                only,
            });
            state.generation
        };

        let engine = self.clone();
        tokio::spawn(async move {
            engine.dispatch(id, generation).await;
        });
    }

    /// The document closed: cancel in-flight work and tear down state.
    pub fn close(&self, document: DocumentId) {
        let removed = {
            let mut documents = self.inner.documents.lock().expect("documents lock poisoned");
            documents.remove(&document)
        };
        if let Some(state) = removed {
            let _ = state.cancel.send(true);
        }
        self.inner.store.remove_document(document);
        self.inner.store.emit(EngineEvent::LintersAssigned {
            document,
            linters: Vec::new(),
        });
        log::debug!("closed {:?}", document);
    }

    /// Load/save-mode linters show diagnostics only until the next
    /// modification; clear them as soon as one arrives.
    fn clear_non_background(&self, snapshot: &DocumentSnapshot, settings: &SettingsSnapshot) {
        for assignment in matcher::applicable_linters(
            snapshot,
            &self.inner.registry,
            settings,
            &self.inner.providers,
        ) {
            if assignment.effective.lint_mode().clears_on_modify() {
                self.inner
                    .store
                    .clear_linter(snapshot.id, &assignment.linter.spec.name);
            }
        }
    }

    /// Debounce = the configured delay, or half the median recent run
    /// time when linters are slow, whichever is larger. Typing into a
    /// project whose linters take two seconds should not queue a run per
    /// keystroke.
    fn debounce_delay(&self, configured: Duration) -> Duration {
        let runtimes = self.inner.runtimes.lock().expect("runtimes lock poisoned");
        let mut sorted: Vec<Duration> = runtimes.iter().copied().collect();
        sorted.sort();
        let median = sorted.get(sorted.len() / 2).copied().unwrap_or_default();

        configured
            .max(MIN_DEBOUNCE_DELAY)
            .max((median / 2).min(MAX_AUTOMATIC_DELAY))
    }

    fn record_runtime(&self, elapsed: Duration) {
        let mut runtimes = self.inner.runtimes.lock().expect("runtimes lock poisoned");
        if runtimes.len() >= RUNTIME_WINDOW {
            runtimes.pop_front();
        }
        runtimes.push_back(elapsed);
    }

    /// The timer fired (or an immediate trigger arrived). Match linters,
    /// fan out one task per runnable linter, and arrange for the
    /// run-ended notification once they all finish.
    async fn dispatch(self, document: DocumentId, generation: u64) {
        let settings = self.settings();

        let (request, sequence, cancel_rx) = {
            let mut documents = self.inner.documents.lock().expect("documents lock poisoned");
            let Some(state) = documents.get_mut(&document) else {
                return; // closed while debouncing
            };
            if state.generation != generation {
                return; // superseded by a newer event
            }
            let Some(request) = state.pending.take() else {
                return;
            };

            state.sequence += 1;
            if settings.global.kill_old_processes {
                let _ = state.cancel.send(true);
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            state.cancel = cancel_tx;
            (request, state.sequence, cancel_rx)
        };

        let snapshot = Arc::new(request.snapshot);
        let units = self.collect_units(&snapshot, &request.reason, request.only.as_deref(), &settings);
        if units.is_empty() {
            return;
        }

        let names: Vec<String> = units.iter().map(|u| u.linter.clone()).collect();
        self.inner.store.emit(EngineEvent::RunStarted {
            document,
            revision: snapshot.revision,
            sequence,
            linters: names,
        });

        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let engine = self.clone();
            let snapshot = Arc::clone(&snapshot);
            let settings = Arc::clone(&settings);
            let cancel = cancel_rx.clone();
            handles.push(tokio::spawn(async move {
                engine.run_unit(unit, snapshot, settings, cancel).await;
            }));
        }

        let engine = self.clone();
        let revision = snapshot.revision;
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            engine.inner.store.emit(EngineEvent::RunEnded {
                document,
                revision,
                sequence,
            });
        });
    }

    /// Match linters against the snapshot and keep the ones that should
    /// actually run for this trigger. Also reconciles the assigned-linter
    /// set the store and subscribers see.
    fn collect_units(
        &self,
        snapshot: &DocumentSnapshot,
        reason: &TriggerReason,
        only: Option<&[String]>,
        settings: &SettingsSnapshot,
    ) -> Vec<RunUnit> {
        let assignments = matcher::applicable_linters(
            snapshot,
            &self.inner.registry,
            settings,
            &self.inner.providers,
        );

        let assigned: Vec<String> = assignments
            .iter()
            .map(|a| a.linter.spec.name.clone())
            .collect();
        {
            let mut documents = self.inner.documents.lock().expect("documents lock poisoned");
            if let Some(state) = documents.get_mut(&snapshot.id)
                && state.assigned != assigned
            {
                state.assigned = assigned.clone();
                self.inner.store.retain_linters(snapshot.id, &assigned);
                self.inner.store.emit(EngineEvent::LintersAssigned {
                    document: snapshot.id,
                    linters: assigned.clone(),
                });
            }
        }

        if assignments.is_empty() {
            log::info!("no linter matches {:?}", snapshot.id);
            return Vec::new();
        }

        let deactivated: HashMap<String, u64> = {
            let documents = self.inner.documents.lock().expect("documents lock poisoned");
            documents
                .get(&snapshot.id)
                .map(|s| s.deactivated.clone())
                .unwrap_or_default()
        };

        assignments
            .into_iter()
            .filter(|a| {
                let name = &a.linter.spec.name;
                if let Some(requested) = only
                    && !requested.iter().any(|r| r == name)
                {
                    return false;
                }
                if deactivated.get(name) == Some(&settings.version) {
                    log::debug!("{}: deactivated until settings change", name);
                    return false;
                }
                a.effective.lint_mode().triggers_on(*reason)
            })
            .map(|a| {
                let mode = a.effective.lint_mode();
                RunUnit {
                    linter: a.linter.spec.name.clone(),
                    effective: a.effective,
                    regions: a.regions,
                    mode,
                }
            })
            .collect()
    }

    /// One fanned-out unit: build the command, run the process per
    /// region, parse, and offer the result to the store.
    async fn run_unit(
        &self,
        unit: RunUnit,
        snapshot: Arc<DocumentSnapshot>,
        settings: Arc<SettingsSnapshot>,
        cancel: watch::Receiver<bool>,
    ) {
        let _permit = match Arc::clone(&self.inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // engine shut down
        };

        let Some(linter) = self.inner.registry.get(&unit.linter) else {
            return;
        };
        let document = snapshot.id;

        let invocation =
            match command::build(linter, &unit.effective, &snapshot, &settings.global) {
                Ok(invocation) => invocation,
                Err(err) => {
                    // configuration error: deactivate until settings
                    // change, report once
                    let newly = {
                        let mut documents =
                            self.inner.documents.lock().expect("documents lock poisoned");
                        documents
                            .get_mut(&document)
                            .map(|state| {
                                state.deactivated.insert(unit.linter.clone(), settings.version)
                                    != Some(settings.version)
                            })
                            .unwrap_or(false)
                    };
                    if newly {
                        log::warn!("{}", err);
                        self.inner.store.mark_failed(document, &unit.linter, &err.to_string());
                    }
                    return;
                }
            };

        if settings.global.debug {
            log::info!(
                "{}: argv {:?}, cwd {:?}",
                unit.linter,
                invocation.argv,
                invocation.cwd
            );
        }

        let timeout = Duration::from_secs(settings.global.process_timeout);
        let started = Instant::now();
        let mut diagnostics = Vec::new();

        for region in &unit.regions {
            let Some(code) = snapshot.text.get(region.clone()) else {
                log::warn!("{}: region {:?} out of bounds, skipping", unit.linter, region);
                continue;
            };
            let region_snapshot = region_view(&snapshot, code);

            let output = process::run(
                &invocation,
                &region_snapshot,
                &linter.spec.strategy,
                timeout,
                cancel.clone(),
            )
            .await;

            match output {
                Ok(output) => {
                    if settings.global.debug {
                        log::info!(
                            "{} output:\n{}",
                            unit.linter,
                            output.diagnostic_text(linter.spec.stream).trim_end()
                        );
                    }
                    let text = output.diagnostic_text(linter.spec.stream);
                    // many linters exit non-zero when they find issues;
                    // only a silent non-zero exit is a real failure
                    if !output.status.success() && text.trim().is_empty() {
                        let reason = if output.stderr.trim().is_empty() {
                            format!("exit status {:?} with no output", output.status.code())
                        } else {
                            output.stderr.trim().to_string()
                        };
                        self.record_runtime(started.elapsed());
                        self.inner.store.mark_failed(document, &unit.linter, &reason);
                        return;
                    }

                    let mut parsed = parser::parse(&text, linter, &unit.effective);
                    offset_into_document(&mut parsed, &snapshot.text, region.start);
                    diagnostics.extend(parsed);
                }
                Err(ProcessError::Canceled) => {
                    log::debug!("{}: canceled", unit.linter);
                    return;
                }
                Err(ProcessError::DirtyBuffer) => {
                    log::debug!("{}: buffer dirty, disk-only linter skipped", unit.linter);
                    return;
                }
                Err(err @ ProcessError::Spawn(_)) => {
                    // executable vanished between resolution and spawn:
                    // treat like a configuration error
                    let mut documents =
                        self.inner.documents.lock().expect("documents lock poisoned");
                    if let Some(state) = documents.get_mut(&document) {
                        state.deactivated.insert(unit.linter.clone(), settings.version);
                    }
                    drop(documents);
                    log::warn!("{}: {}", unit.linter, err);
                    self.inner.store.mark_failed(document, &unit.linter, &err.to_string());
                    return;
                }
                Err(err) => {
                    log::warn!("{}: {}", unit.linter, err);
                    self.inner.store.mark_failed(document, &unit.linter, &err.to_string());
                    return;
                }
            }
        }

        self.record_runtime(started.elapsed());

        // Background runs must also beat the document's current
        // revision: an edit during the run makes this result stale even
        // if no newer run finished yet.
        let floor = if matches!(unit.mode, LintMode::Background) {
            let documents = self.inner.documents.lock().expect("documents lock poisoned");
            documents.get(&document).map(|s| s.latest_revision)
        } else {
            None
        };

        let outcome = self.inner.store.accept(
            document,
            &unit.linter,
            snapshot.revision,
            floor,
            diagnostics,
        );
        if outcome == AcceptOutcome::Stale {
            log::debug!(
                "{}: result for {:?} at {:?} was stale on arrival",
                unit.linter,
                document,
                snapshot.revision
            );
        }
    }
}

/// A snapshot whose text is one region's slice, for feeding the process
/// runner. Keeps the document identity and path so strategies behave.
fn region_view(snapshot: &DocumentSnapshot, code: &str) -> DocumentSnapshot {
    let mut view = snapshot.clone();
    view.text = Arc::from(code);
    view
}

/// Shift region-relative diagnostic positions into document
/// coordinates: lines move down by the region's starting line, and
/// first-line columns move right by its starting column.
fn offset_into_document(diagnostics: &mut [Diagnostic], text: &str, region_start: usize) {
    if region_start == 0 {
        return;
    }
    let prefix = &text[..region_start.min(text.len())];
    let line_offset = prefix.matches('\n').count() as u32;
    let col_offset = prefix
        .rsplit_once('\n')
        .map(|(_, tail)| tail)
        .unwrap_or(prefix)
        .chars()
        .count() as u32;

    for diag in diagnostics {
        if diag.line == 0 {
            diag.col = diag.col.map(|c| c + col_offset);
        }
        diag.line += line_offset;
        if let Some(end_line) = diag.end_line.as_mut() {
            if *end_line == 0
                && let Some(end_col) = diag.end_col.as_mut()
            {
                *end_col += col_offset;
            }
            *end_line += line_offset;
        }
    }
}
