//! Declarative linter adapter descriptions.
//!
//! A [`LinterSpec`] captures everything the engine needs to invoke one
//! external tool and understand its output: the command template, default
//! settings (with optional argument encodings embedded in the key names),
//! the output pattern, stream policy, and I/O strategy. Specs are
//! registered once at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::diagnostics::Severity;

/// Parses argument metadata out of a default-settings key, e.g.
/// `--max-line-length=` or `-I:,+` or `@path`.
static ARG_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<prefix>@|--?)?(?P<name>[@\w][\w\-]*)(?:(?P<joiner>[=:])(?:(?P<sep>.)(?P<multiple>\+)?)?)?$")
        .expect("argument key pattern is valid")
});

/// Capture-group names the output parser understands; other named
/// groups in a pattern are legal but ignored.
pub const KNOWN_GROUPS: &[&str] = &[
    "line", "col", "end_line", "end_col", "message", "error", "warning", "code", "near",
    "error_type", "file",
];

/// Which process stream(s) carry diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPolicy {
    Stdout,
    Stderr,
    #[default]
    Both,
}

/// How document text reaches the linter process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IoStrategy {
    /// Pipe the buffer to the child's stdin.
    #[default]
    Stdin,
    /// Write the buffer to a temp file with this suffix and substitute
    /// its path for `@`.
    TempFile { suffix: String },
    /// Populate a temp directory with these files (relative paths); the
    /// linted file is written from the live buffer, the rest copied from
    /// disk.
    TempDir { files: Vec<String> },
    /// The linter reads the saved file; refuses to run on dirty buffers.
    DiskOnly,
}

/// How one setting is rendered into command-line arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    /// `@` (positional), `-` or `--`.
    pub prefix: String,
    /// Setting name with the metadata stripped.
    pub name: String,
    /// `=` joins name and value into one argument, `:` emits two.
    pub joiner: Option<char>,
    /// List-value separator.
    pub sep: Option<char>,
    /// Emit one argument pair per list element instead of joining.
    pub multiple: bool,
}

#[derive(Debug)]
pub enum SpecError {
    /// The output pattern failed to compile.
    BadPattern { linter: String, error: regex::Error },
    /// The command template is empty.
    EmptyCommand { linter: String },
    /// Two specs share a name.
    DuplicateName { linter: String },
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPattern { linter, error } => {
                write!(f, "{}: invalid output pattern: {}", linter, error)
            }
            Self::EmptyCommand { linter } => write!(f, "{}: empty command template", linter),
            Self::DuplicateName { linter } => write!(f, "duplicate linter name: {}", linter),
        }
    }
}

impl std::error::Error for SpecError {}

/// An immutable description of how to invoke and parse one linting tool.
#[derive(Debug, Clone)]
pub struct LinterSpec {
    pub name: String,
    /// Command template. May contain the placeholders `@` (file being
    /// linted), `*` (encoded settings arguments) and `${args}` (user
    /// arguments).
    pub cmd: Vec<String>,
    /// Default settings. Keys carrying argument metadata are normalized
    /// at registration; see [`ArgSpec`].
    pub defaults: serde_json::Map<String, Value>,
    /// Output pattern source with named groups; compiled at registration.
    pub regex: String,
    /// Apply the pattern to the whole output instead of per line.
    pub multiline: bool,
    pub default_severity: Severity,
    pub stream: StreamPolicy,
    /// Numbering base of reported (line, col), usually (1, 1).
    pub line_col_base: (u32, u32),
    pub strategy: IoStrategy,
    /// Scope selector deciding which documents this linter applies to.
    pub selector: String,
    /// Syntax name -> selector for embedded sub-regions (e.g. JS in HTML).
    pub embedded_selectors: HashMap<String, String>,
}

impl LinterSpec {
    pub fn new(name: impl Into<String>, cmd: &[&str], selector: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            defaults: serde_json::Map::new(),
            regex: regex.into(),
            multiline: false,
            default_severity: Severity::Error,
            stream: StreamPolicy::default(),
            line_col_base: (1, 1),
            strategy: IoStrategy::default(),
            selector: selector.into(),
            embedded_selectors: HashMap::new(),
        }
    }
}

/// A registered spec with its derived, compiled pieces.
#[derive(Debug)]
pub struct RegisteredLinter {
    pub spec: LinterSpec,
    pub pattern: Regex,
    /// Setting name -> encoding, for keys that declared one.
    pub args_map: HashMap<String, ArgSpec>,
}

/// All linters known to the engine, keyed by name. Built once at startup.
#[derive(Debug, Default)]
pub struct LinterRegistry {
    linters: HashMap<String, RegisteredLinter>,
}

impl LinterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a spec. Compiles the output pattern (with
    /// the multi-line flag when the linter asks for it) and splits
    /// argument metadata out of the default-settings keys.
    pub fn register(&mut self, mut spec: LinterSpec) -> Result<(), SpecError> {
        if spec.cmd.is_empty() || spec.cmd[0].is_empty() {
            return Err(SpecError::EmptyCommand { linter: spec.name });
        }
        if self.linters.contains_key(&spec.name) {
            return Err(SpecError::DuplicateName { linter: spec.name });
        }

        let source = if spec.multiline {
            format!("(?m){}", spec.regex)
        } else {
            spec.regex.clone()
        };
        let pattern = Regex::new(&source).map_err(|error| SpecError::BadPattern {
            linter: spec.name.clone(),
            error,
        })?;

        let ignored: Vec<&str> = pattern
            .capture_names()
            .flatten()
            .filter(|name| !KNOWN_GROUPS.contains(name))
            .collect();
        if !ignored.is_empty() {
            log::debug!(
                "{}: pattern groups {:?} are not recognized and will be ignored",
                spec.name,
                ignored
            );
        }

        let (defaults, args_map) = split_arg_metadata(std::mem::take(&mut spec.defaults));
        spec.defaults = defaults;

        log::debug!(
            "registered linter '{}' ({} default settings, {} encoded as args)",
            spec.name,
            spec.defaults.len(),
            args_map.len()
        );
        self.linters.insert(
            spec.name.clone(),
            RegisteredLinter { spec, pattern, args_map },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredLinter> {
        self.linters.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredLinter> {
        self.linters.values()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.linters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.linters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linters.is_empty()
    }
}

/// Strip argument metadata from default-settings keys. `--max-line-length=`
/// becomes the plain setting `max-line-length` plus an [`ArgSpec`]; keys
/// without a prefix stay internal settings.
fn split_arg_metadata(
    raw: serde_json::Map<String, Value>,
) -> (serde_json::Map<String, Value>, HashMap<String, ArgSpec>) {
    let mut defaults = serde_json::Map::new();
    let mut args_map = HashMap::new();

    for (key, value) in raw {
        match ARG_KEY_RE.captures(&key) {
            Some(caps) => {
                let name = caps["name"].to_string();
                if let Some(prefix) = caps.name("prefix") {
                    args_map.insert(
                        name.clone(),
                        ArgSpec {
                            prefix: prefix.as_str().to_string(),
                            name: name.clone(),
                            joiner: caps.name("joiner").and_then(|m| m.as_str().chars().next()),
                            sep: caps.name("sep").and_then(|m| m.as_str().chars().next()),
                            multiple: caps.name("multiple").is_some(),
                        },
                    );
                }
                defaults.insert(name, value);
            }
            None => {
                defaults.insert(key, value);
            }
        }
    }

    (defaults, args_map)
}
