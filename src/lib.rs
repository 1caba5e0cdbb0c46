pub mod command;
pub mod diagnostics;
pub mod document;
pub mod matcher;
pub mod parser;
pub mod process;
pub mod scheduler;
pub mod settings;
pub mod spec;
pub mod store;

pub use diagnostics::{Diagnostic, Severity};
pub use document::{DocumentId, DocumentSnapshot, LintMode, Revision, ScopedRegion, TriggerReason};
pub use scheduler::LintEngine;
pub use settings::{EffectiveSettings, GlobalSettings, SettingsProvider, SettingsSnapshot};
pub use spec::{IoStrategy, LinterRegistry, LinterSpec, StreamPolicy};
pub use store::{EngineEvent, ViewDiagnosticSet};

#[cfg(debug_assertions)]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Convenience constructor: build an engine from a registry plus the
/// settings files discoverable from `start_dir` (project config in the
/// tree, user config in the platform config directory).
///
/// Hosts that own their settings store should build a
/// [`SettingsSnapshot`] themselves and use [`LintEngine::new`].
pub fn engine_from_disk(
    registry: LinterRegistry,
    start_dir: Option<&std::path::Path>,
) -> LintEngine {
    #[cfg(debug_assertions)]
    {
        init_logger();
    }

    let snapshot = settings::load_snapshot(1, start_dir);
    LintEngine::new(registry, snapshot)
}
