//! Host-facing document model.
//!
//! The editor owns the documents; the engine only ever sees immutable
//! snapshots tagged with a revision. Staleness checks compare revisions,
//! never text.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

/// Stable identity of an open buffer, assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

/// Monotonic edit counter for a document. The host bumps it on every
/// change; the engine never generates revisions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Revision(pub u64);

/// A sub-range of a document carrying its own syntax scope, e.g. a
/// JavaScript block inside HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRegion {
    pub scope: String,
    pub range: Range<usize>,
}

/// An immutable view of a document at one revision.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub revision: Revision,
    pub text: Arc<str>,
    /// On-disk path; `None` for unsaved buffers.
    pub path: Option<PathBuf>,
    /// Whether the buffer has modifications newer than the on-disk file.
    pub dirty: bool,
    /// The document's top-level scope, e.g. `source.python`.
    pub scope: String,
    /// Embedded-syntax regions, if the host's syntax engine reports any.
    pub regions: Vec<ScopedRegion>,
}

impl DocumentSnapshot {
    pub fn new(id: DocumentId, revision: Revision, text: impl Into<Arc<str>>, scope: impl Into<String>) -> Self {
        Self {
            id,
            revision,
            text: text.into(),
            path: None,
            dirty: false,
            scope: scope.into(),
            regions: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    pub fn with_regions(mut self, regions: Vec<ScopedRegion>) -> Self {
        self.regions = regions;
        self
    }

    /// The directory containing the document, if it is on disk.
    pub fn directory(&self) -> Option<&std::path::Path> {
        self.path.as_deref().and_then(|p| p.parent())
    }
}

/// What kind of document activity triggered a lint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    Modify,
    Load,
    Save,
    Manual,
}

/// Policy controlling which events feed the scheduler for a linter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LintMode {
    /// Lint on modify (debounced), load, and save.
    #[default]
    Background,
    /// Lint on load and save only.
    LoadSave,
    /// Lint on save only.
    Save,
    /// Lint only on an explicit request.
    Manual,
}

impl LintMode {
    /// Whether `reason` triggers a run under this mode. Manual requests
    /// always run.
    pub fn triggers_on(&self, reason: TriggerReason) -> bool {
        match reason {
            TriggerReason::Manual => true,
            TriggerReason::Modify => matches!(self, Self::Background),
            TriggerReason::Load => matches!(self, Self::Background | Self::LoadSave),
            TriggerReason::Save => {
                matches!(self, Self::Background | Self::LoadSave | Self::Save)
            }
        }
    }

    /// Modes that do not re-lint on modification clear their published
    /// diagnostics as soon as the buffer changes, so stale squiggles
    /// never outlive the text they pointed at.
    pub fn clears_on_modify(&self) -> bool {
        !matches!(self, Self::Background)
    }

    /// Only background-mode modify runs are debounced.
    pub fn debounces(&self, reason: TriggerReason) -> bool {
        matches!(self, Self::Background) && reason == TriggerReason::Modify
    }
}
