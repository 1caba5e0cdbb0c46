//! Result aggregation and change notification.
//!
//! The store owns the published per-document diagnostic sets and is the
//! single place where the staleness invariant is enforced: a completed
//! run is merged only if nothing fresher has been accepted for that
//! (document, linter), no matter in which order processes happen to
//! finish. Consumers subscribe to a broadcast stream instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::diagnostics::Diagnostic;
use crate::document::{DocumentId, Revision};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine notifications, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStarted {
        document: DocumentId,
        revision: Revision,
        sequence: u64,
        linters: Vec<String>,
    },
    /// One linter's result was accepted and published.
    LinterResult {
        document: DocumentId,
        linter: String,
        revision: Revision,
        count: usize,
    },
    RunEnded {
        document: DocumentId,
        revision: Revision,
        sequence: u64,
    },
    /// The set of linters assigned to a document changed.
    LintersAssigned {
        document: DocumentId,
        linters: Vec<String>,
    },
    /// A linter's run failed (spawn error, timeout, bad configuration).
    LinterFailed {
        document: DocumentId,
        linter: String,
        reason: String,
    },
}

/// The published, per-document aggregation: each assigned linter's
/// latest non-stale diagnostics, plus the newest revision any of them
/// reflects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewDiagnosticSet {
    pub revision: Revision,
    pub by_linter: BTreeMap<String, Vec<Diagnostic>>,
}

impl ViewDiagnosticSet {
    pub fn all(&self) -> impl Iterator<Item = &Diagnostic> {
        self.by_linter.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_linter.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct LinterSlot {
    accepted: Revision,
    diagnostics: Vec<Diagnostic>,
    /// The last run failed; `diagnostics` are the previous good ones,
    /// kept so the UI degrades gracefully instead of flickering empty.
    failed: bool,
}

#[derive(Debug, Default)]
struct DocumentResults {
    slots: HashMap<String, LinterSlot>,
}

/// Why [`ResultStore::accept`] did not publish a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Published,
    /// A newer result for this (document, linter) was already accepted,
    /// or the document has moved past this run's revision.
    Stale,
}

pub struct ResultStore {
    documents: Mutex<HashMap<DocumentId, DocumentResults>>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            documents: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        // no subscribers is fine; send only fails then
        let _ = self.events.send(event);
    }

    /// Offer one linter's result. Publishes and notifies unless the
    /// result is stale: older than the revision already accepted for
    /// this slot, or (when the caller passes the document's current
    /// revision as `floor`) older than the document itself.
    pub fn accept(
        &self,
        document: DocumentId,
        linter: &str,
        revision: Revision,
        floor: Option<Revision>,
        diagnostics: Vec<Diagnostic>,
    ) -> AcceptOutcome {
        let mut documents = self.documents.lock().expect("result store lock poisoned");
        let results = documents.entry(document).or_default();
        let slot = results.slots.entry(linter.to_string()).or_default();

        if revision < slot.accepted || floor.is_some_and(|f| revision < f) {
            log::debug!(
                "discarding stale result for {:?}/{} (computed at {:?}, accepted {:?}, floor {:?})",
                document,
                linter,
                revision,
                slot.accepted,
                floor
            );
            return AcceptOutcome::Stale;
        }

        let count = diagnostics.len();
        slot.accepted = revision;
        slot.diagnostics = diagnostics;
        slot.failed = false;
        drop(documents);

        self.emit(EngineEvent::LinterResult {
            document,
            linter: linter.to_string(),
            revision,
            count,
        });
        AcceptOutcome::Published
    }

    /// Record a failed run. Previous diagnostics stay published (stale
    /// but valid beats flicker-to-empty); the slot is only marked.
    pub fn mark_failed(&self, document: DocumentId, linter: &str, reason: &str) {
        {
            let mut documents = self.documents.lock().expect("result store lock poisoned");
            let results = documents.entry(document).or_default();
            results.slots.entry(linter.to_string()).or_default().failed = true;
        }
        self.emit(EngineEvent::LinterFailed {
            document,
            linter: linter.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Keep only slots for linters still assigned to the document.
    pub fn retain_linters(&self, document: DocumentId, assigned: &[String]) {
        let mut documents = self.documents.lock().expect("result store lock poisoned");
        if let Some(results) = documents.get_mut(&document) {
            results.slots.retain(|name, _| assigned.iter().any(|a| a == name));
        }
    }

    /// Blank a document's published diagnostics without forgetting the
    /// acceptance watermarks. Used by lint modes that clear on modify.
    pub fn clear_diagnostics(&self, document: DocumentId) {
        let mut documents = self.documents.lock().expect("result store lock poisoned");
        if let Some(results) = documents.get_mut(&document) {
            for slot in results.slots.values_mut() {
                slot.diagnostics.clear();
            }
        }
    }

    /// Blank a single linter's published diagnostics.
    pub fn clear_linter(&self, document: DocumentId, linter: &str) {
        let mut documents = self.documents.lock().expect("result store lock poisoned");
        if let Some(slot) = documents
            .get_mut(&document)
            .and_then(|results| results.slots.get_mut(linter))
        {
            slot.diagnostics.clear();
        }
    }

    /// Tear down everything for a closed document.
    pub fn remove_document(&self, document: DocumentId) {
        self.documents
            .lock()
            .expect("result store lock poisoned")
            .remove(&document);
    }

    /// A snapshot of the document's published diagnostic set.
    pub fn diagnostics(&self, document: DocumentId) -> Option<ViewDiagnosticSet> {
        let documents = self.documents.lock().expect("result store lock poisoned");
        let results = documents.get(&document)?;

        let mut set = ViewDiagnosticSet::default();
        for (name, slot) in &results.slots {
            set.revision = set.revision.max(slot.accepted);
            set.by_linter.insert(name.clone(), slot.diagnostics.clone());
        }
        Some(set)
    }

    /// Whether the linter's last run for this document failed.
    pub fn is_failed(&self, document: DocumentId, linter: &str) -> bool {
        let documents = self.documents.lock().expect("result store lock poisoned");
        documents
            .get(&document)
            .and_then(|results| results.slots.get(linter))
            .map(|slot| slot.failed)
            .unwrap_or(false)
    }
}
