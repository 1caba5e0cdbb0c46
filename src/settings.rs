//! Layered settings resolution.
//!
//! Settings come from several sources: the linter's declared defaults,
//! the user's config file, the project's config file, optional pluggable
//! providers (rc files), and meta settings (`@`-prefixed keys that apply
//! across linters). [`resolve`] merges them, lowest precedence first,
//! into one [`EffectiveSettings`] per (document, linter) pair and expands
//! `${...}` tokens in every string value.
//!
//! A [`SettingsSnapshot`] is an explicit value: the engine re-creates it
//! (with a bumped version) on change notifications and passes it into
//! each resolution, so no resolution ever observes a half-updated state.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::document::{DocumentSnapshot, LintMode};
use crate::spec::RegisteredLinter;

const PROJECT_CANDIDATES: &[&str] = &[".squint.toml", "squint.toml"];
const RC_FILE_NAME: &str = ".squintrc";

// `env:NAME` keeps its colon; any other colon starts a fallback.
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(?P<name>env:[A-Za-z0-9_]+|[^}:$]+)(?::(?P<fallback>[^}]*))?\}")
        .expect("token pattern is valid")
});

/// Maximum passes of recursive token expansion before giving up on a
/// value. Cyclic or deeply nested tokens fail closed to their literal
/// form.
const MAX_EXPANSION_DEPTH: usize = 8;

/// Engine-wide settings, owned by the host's settings store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Surface argv, cwd and captured streams in the log.
    pub debug: bool,
    /// Debounce duration for background lints, in milliseconds.
    pub delay: u64,
    /// Extra executable search paths, keyed by platform (`linux`, `osx`,
    /// `windows`, or `*` for all).
    pub paths: HashMap<String, Vec<String>>,
    /// Extra paths prepended to PYTHONPATH for python-based tools.
    pub python_paths: Vec<String>,
    /// Kill the previous request's processes when a new request starts.
    pub kill_old_processes: bool,
    /// Remap unrecognized scope names before selector matching.
    pub syntax_map: HashMap<String, String>,
    /// Honor `.squintrc` files found near the document. Off by default;
    /// the rc layer is a legacy feature some deployments still rely on.
    pub support_rc_files: bool,
    /// How many directories to climb when searching for an rc file.
    pub rc_search_limit: usize,
    /// Cap on concurrently running linter processes.
    pub max_concurrent_tasks: usize,
    /// Per-process deadline, in seconds. A linter past it is killed and
    /// the run reported as failed.
    pub process_timeout: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            debug: false,
            delay: 250,
            paths: HashMap::new(),
            python_paths: Vec::new(),
            kill_old_processes: false,
            syntax_map: HashMap::new(),
            support_rc_files: false,
            rc_search_limit: 4,
            max_concurrent_tasks: default_concurrency(),
            process_timeout: 30,
        }
    }
}

pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl GlobalSettings {
    /// The extra search paths that apply on this platform.
    pub fn platform_paths(&self) -> Vec<PathBuf> {
        let key = if cfg!(target_os = "macos") {
            "osx"
        } else if cfg!(windows) {
            "windows"
        } else {
            "linux"
        };

        self.paths
            .get(key)
            .into_iter()
            .chain(self.paths.get("*"))
            .flatten()
            .map(|p| PathBuf::from(expand_home(p)))
            .collect()
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest).to_string_lossy().into_owned();
    }
    path.to_string()
}

/// One configuration layer: meta keys at the top level plus per-linter
/// settings maps under `linters`.
#[derive(Debug, Clone, Default)]
pub struct SettingsLayer {
    pub meta: Map<String, Value>,
    pub linters: HashMap<String, Map<String, Value>>,
}

impl SettingsLayer {
    /// Split a free-form map into meta (`@`-prefixed) keys and the
    /// `linters` table.
    pub fn from_map(map: Map<String, Value>) -> Self {
        let mut layer = Self::default();
        for (key, value) in map {
            if key.starts_with('@') {
                layer.meta.insert(key, value);
            } else if key == "linters"
                && let Value::Object(linters) = value
            {
                for (name, settings) in linters {
                    if let Value::Object(settings) = settings {
                        layer.linters.insert(name, settings);
                    }
                }
            }
        }
        layer
    }
}

/// A read-only view of every settings layer, versioned so caches can
/// tell when they are stale.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub global: GlobalSettings,
    pub user: SettingsLayer,
    pub project: SettingsLayer,
}

/// An extra, composable settings source (rc files, shebangs, ...).
/// Providers contribute between the project layer and the meta merge.
pub trait SettingsProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Partial settings for this (document, linter), or `None`.
    fn contributes(&self, document: &DocumentSnapshot, linter: &str) -> Option<Map<String, Value>>;
}

/// Reads `.squintrc` files (TOML) found by climbing from the document's
/// directory. Only consulted when `support_rc_files` is on.
pub struct RcFileProvider {
    search_limit: usize,
}

impl RcFileProvider {
    pub fn new(search_limit: usize) -> Self {
        Self { search_limit }
    }
}

impl SettingsProvider for RcFileProvider {
    fn name(&self) -> &str {
        "rc-file"
    }

    fn contributes(&self, document: &DocumentSnapshot, linter: &str) -> Option<Map<String, Value>> {
        let start = document.directory()?;
        for dir in start.ancestors().take(self.search_limit) {
            let candidate = dir.join(RC_FILE_NAME);
            if !candidate.is_file() {
                continue;
            }
            match read_settings_map(&candidate) {
                Ok(map) => {
                    let layer = SettingsLayer::from_map(map);
                    let mut out = layer.linters.get(linter).cloned().unwrap_or_default();
                    // rc meta settings ride along with the linter settings
                    for (key, value) in layer.meta {
                        out.insert(key, value);
                    }
                    return Some(out);
                }
                Err(err) => {
                    log::warn!("ignoring unreadable rc file {}: {}", candidate.display(), err);
                    return None;
                }
            }
        }
        None
    }
}

/// The merged settings for one (document, linter) pair, with typed
/// accessors for the keys the engine itself understands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveSettings {
    values: Map<String, Value>,
}

impl EffectiveSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn disabled(&self) -> bool {
        // The meta kill-switch wins over the linter-local key: meta
        // settings merge last, so `@disable` is already the effective
        // value here if any layer set it.
        truthy(self.values.get("@disable").or_else(|| self.values.get("disable")))
    }

    pub fn executable(&self) -> Option<&str> {
        self.values.get("executable").and_then(Value::as_str)
    }

    pub fn args(&self) -> Option<&Value> {
        self.values.get("args")
    }

    pub fn excludes(&self) -> Vec<String> {
        string_list(self.values.get("excludes"))
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.values.get("working_dir").and_then(Value::as_str)
    }

    pub fn selector(&self) -> Option<&str> {
        self.values.get("selector").and_then(Value::as_str)
    }

    pub fn env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(Value::Object(map)) = self.values.get("env") {
            for (key, value) in map {
                if let Some(s) = value.as_str() {
                    env.insert(key.clone(), s.to_string());
                }
            }
        }
        env
    }

    pub fn lint_mode(&self) -> LintMode {
        self.values
            .get("lint_mode")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn filter_errors(&self) -> Vec<String> {
        string_list(self.values.get("filter_errors"))
    }

    #[cfg(test)]
    pub fn from_values(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

/// `null`, `false`, `0`, `""` and `[]` all count as unset.
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Merge every layer for `linter` against `document` and expand tokens.
///
/// Precedence, lowest first: adapter defaults, user settings, project
/// settings, provider contributions, then meta settings (user meta
/// overridden by project meta). Pure given its inputs.
pub fn resolve(
    snapshot: &SettingsSnapshot,
    providers: &[Box<dyn SettingsProvider>],
    document: &DocumentSnapshot,
    linter: &RegisteredLinter,
) -> EffectiveSettings {
    let name = linter.spec.name.as_str();
    let mut values = linter.spec.defaults.clone();

    if let Some(user) = snapshot.user.linters.get(name) {
        merge_into(&mut values, user);
    }
    if let Some(project) = snapshot.project.linters.get(name) {
        merge_into(&mut values, project);
    }

    for provider in providers {
        if let Some(contribution) = provider.contributes(document, name) {
            log::debug!("settings provider '{}' contributes to {}", provider.name(), name);
            merge_into(&mut values, &contribution);
        }
    }

    // Meta settings are global overrides: linter-local values lose.
    merge_into(&mut values, &snapshot.user.meta);
    merge_into(&mut values, &snapshot.project.meta);

    expand_tokens_in_map(&mut values, document);
    EffectiveSettings { values }
}

fn merge_into(target: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (key, value) in layer {
        target.insert(key.clone(), value.clone());
    }
}

/// The variables `${...}` tokens resolve against, bound to one document.
fn token_value(name: &str, document: &DocumentSnapshot) -> Option<String> {
    let path = document.path.as_deref();
    match name {
        "file" => path.map(|p| p.to_string_lossy().into_owned()),
        "file_name" => path
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned()),
        "file_base_name" => path
            .and_then(|p| p.file_stem())
            .map(|n| n.to_string_lossy().into_owned()),
        "file_extension" => path
            .and_then(|p| p.extension())
            .map(|n| n.to_string_lossy().into_owned()),
        "directory" => document.directory().map(|d| d.to_string_lossy().into_owned()),
        "project" => find_project_root(document).map(|d| d.to_string_lossy().into_owned()),
        "home" => dirs::home_dir().map(|d| d.to_string_lossy().into_owned()),
        _ => name
            .strip_prefix("env:")
            .and_then(|var| std::env::var(var).ok()),
    }
}

/// The nearest ancestor directory holding a project settings file.
fn find_project_root(document: &DocumentSnapshot) -> Option<PathBuf> {
    let start = document.directory()?;
    for dir in start.ancestors() {
        if PROJECT_CANDIDATES.iter().any(|name| dir.join(name).is_file()) {
            return Some(dir.to_path_buf());
        }
    }
    None
}

/// Expand `${var}` / `${var:fallback}` in one string, recursively up to
/// [`MAX_EXPANSION_DEPTH`] passes. Unresolvable tokens stay literal;
/// `$$` escapes a literal dollar.
pub fn expand_tokens(input: &str, document: &DocumentSnapshot) -> String {
    const ESCAPE_MARK: &str = "\u{0}SQUINT_DOLLAR\u{0}";
    let mut current = input.replace("$$", ESCAPE_MARK);

    for _ in 0..MAX_EXPANSION_DEPTH {
        let next = TOKEN_RE
            .replace_all(&current, |caps: &regex::Captures<'_>| {
                match token_value(&caps["name"], document) {
                    Some(value) => value,
                    None => match caps.name("fallback") {
                        Some(fallback) => fallback.as_str().to_string(),
                        None => caps[0].to_string(),
                    },
                }
            })
            .into_owned();
        if next == current {
            break;
        }
        current = next;
    }

    current.replace(ESCAPE_MARK, "$")
}

fn expand_tokens_in_value(value: &mut Value, document: &DocumentSnapshot) {
    match value {
        Value::String(s) => *s = expand_tokens(s, document),
        Value::Array(items) => {
            for item in items {
                expand_tokens_in_value(item, document);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_tokens_in_value(v, document);
            }
        }
        _ => {}
    }
}

fn expand_tokens_in_map(map: &mut Map<String, Value>, document: &DocumentSnapshot) {
    for (_, value) in map.iter_mut() {
        expand_tokens_in_value(value, document);
    }
}

// Settings-file loading. Files are TOML on disk (the host's native
// config format); values convert to JSON values on the way in so the
// whole engine speaks one value type.

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

fn read_settings_map(path: &Path) -> io::Result<Map<String, Value>> {
    let s = fs::read_to_string(path)?;
    let table: toml::Table = s.parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid settings file {}: {e}", path.display()),
        )
    })?;
    match toml_to_json(toml::Value::Table(table)) {
        Value::Object(map) => Ok(map),
        _ => unreachable!("a TOML table converts to a JSON object"),
    }
}

fn user_config_path() -> Option<PathBuf> {
    let p = dirs::config_dir()?.join("squint").join("config.toml");
    p.is_file().then_some(p)
}

fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    for dir in start_dir.ancestors() {
        for name in PROJECT_CANDIDATES {
            let p = dir.join(name);
            if p.is_file() {
                return Some(p);
            }
        }
    }
    None
}

/// Build a settings snapshot from the files on disk: the user config
/// (`~/.config/squint/config.toml`) plus the nearest project config
/// above `start_dir`. Unreadable files degrade to empty layers.
pub fn load_snapshot(version: u64, start_dir: Option<&Path>) -> SettingsSnapshot {
    let mut snapshot = SettingsSnapshot {
        version,
        ..Default::default()
    };

    if let Some(path) = user_config_path() {
        match read_settings_map(&path) {
            Ok(map) => {
                log::info!("loaded user settings from {}", path.display());
                if let Ok(global) =
                    serde_json::from_value::<GlobalSettings>(Value::Object(map.clone()))
                {
                    snapshot.global = global;
                }
                snapshot.user = SettingsLayer::from_map(map);
            }
            Err(err) => log::warn!("failed to load user settings: {}", err),
        }
    }

    if let Some(start) = start_dir
        && let Some(path) = find_project_config(start)
    {
        match read_settings_map(&path) {
            Ok(map) => {
                log::info!("loaded project settings from {}", path.display());
                snapshot.project = SettingsLayer::from_map(map);
            }
            Err(err) => log::warn!("failed to load project settings: {}", err),
        }
    }

    snapshot
}
