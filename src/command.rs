//! Command construction.
//!
//! Turns a linter's command template plus its effective settings into a
//! concrete argument vector, environment and working directory. The `@`
//! placeholder (the file being linted) survives into the invocation; the
//! process runner substitutes it once it knows which path the I/O
//! strategy produced.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::document::DocumentSnapshot;
use crate::settings::{EffectiveSettings, GlobalSettings, truthy};
use crate::spec::RegisteredLinter;

/// Placeholder for the lint-target path, resolved by the process runner.
pub const TARGET_PLACEHOLDER: &str = "@";
const SETTINGS_ARGS_PLACEHOLDER: &str = "*";
const USER_ARGS_PLACEHOLDERS: &[&str] = &["${args}", "$args"];

#[derive(Debug)]
pub enum CommandError {
    /// The executable (or a version-qualified runtime) could not be
    /// located. Deactivates the linter for the document, never a crash.
    ExecutableNotFound { linter: String, wanted: String },
    /// An explicitly configured `executable` does not exist.
    BadExecutableSetting { linter: String, path: PathBuf },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutableNotFound { linter, wanted } => {
                write!(f, "{}: cannot locate '{}'", linter, wanted)
            }
            Self::BadExecutableSetting { linter, path } => {
                write!(
                    f,
                    "{}: configured executable does not exist: {}",
                    linter,
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// A fully built subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Split a string the way a POSIX shell tokenizes a command line:
/// whitespace-separated, with single/double quotes and backslash
/// escapes. Used for `args` settings given as one string.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        if !matches!(next, '"' | '\\' | '$') {
                            current.push('\\');
                        }
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
            _ => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        args.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

/// The user's extra arguments from the `args` setting, shell-split when
/// given as a string.
pub fn user_args(effective: &EffectiveSettings) -> Vec<String> {
    match effective.args() {
        Some(Value::String(s)) => shell_split(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Render the settings that declared an argument encoding back into
/// command-line arguments.
///
/// Falsy values (null, false, 0, empty string/list) emit nothing. The
/// joiner decides one argument (`--name=value`) or two (`-n value`);
/// list values join by the declared separator, or explode into repeated
/// arguments when the linter declares each value goes separately.
pub fn encode_settings_args(
    linter: &RegisteredLinter,
    effective: &EffectiveSettings,
) -> Vec<String> {
    let mut args = Vec::new();

    // deterministic order: by setting name
    let mut names: Vec<&String> = linter.args_map.keys().collect();
    names.sort();

    for name in names {
        let arg = &linter.args_map[name];
        let value = effective.get(name);
        if name.starts_with('@') || !truthy(value) {
            continue;
        }

        let rendered: Vec<String> = match value {
            Some(Value::Array(items)) => {
                let items: Vec<String> = items.iter().map(render_scalar).collect();
                match (arg.sep, arg.multiple) {
                    (Some(sep), false) => vec![items.join(&sep.to_string())],
                    _ => items,
                }
            }
            Some(Value::Bool(true)) => vec![String::new()],
            Some(other) => vec![render_scalar(other)],
            None => continue,
        };

        for value in rendered {
            if arg.prefix == "@" {
                args.push(value);
                continue;
            }
            let option = format!("{}{}", arg.prefix, arg.name);
            match arg.joiner {
                Some('=') => {
                    if value.is_empty() {
                        args.push(option);
                    } else {
                        args.push(format!("{}={}", option, value));
                    }
                }
                Some(':') => {
                    args.push(option);
                    if !value.is_empty() {
                        args.push(value);
                    }
                }
                _ => args.push(option),
            }
        }
    }

    args
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the subprocess invocation for one (linter, document) pair.
///
/// `*` in the template receives the encoded settings arguments and
/// `${args}` the user's extras; without placeholders both append, in
/// that order. The first template token resolves to an executable path
/// (see [`resolve_executable`]); failure is an error the scheduler
/// treats as "deactivate until settings change".
pub fn build(
    linter: &RegisteredLinter,
    effective: &EffectiveSettings,
    document: &DocumentSnapshot,
    global: &GlobalSettings,
) -> Result<Invocation, CommandError> {
    let spec = &linter.spec;
    let search_path = augmented_path(global);

    let mut argv: Vec<String> = Vec::with_capacity(spec.cmd.len() + 4);
    let resolved = match effective.executable() {
        Some(explicit) => {
            let path = PathBuf::from(explicit);
            if !path.is_file() {
                return Err(CommandError::BadExecutableSetting {
                    linter: spec.name.clone(),
                    path,
                });
            }
            vec![explicit.to_string()]
        }
        None => resolve_executable(&spec.cmd[0], &search_path).ok_or_else(|| {
            CommandError::ExecutableNotFound {
                linter: spec.name.clone(),
                wanted: spec.cmd[0].clone(),
            }
        })?,
    };
    argv.extend(resolved);

    let settings_args = encode_settings_args(linter, effective);
    let extra_args = user_args(effective);

    let mut saw_settings_slot = false;
    let mut saw_user_slot = false;
    for token in &spec.cmd[1..] {
        if token == SETTINGS_ARGS_PLACEHOLDER {
            argv.extend(settings_args.iter().cloned());
            saw_settings_slot = true;
        } else if USER_ARGS_PLACEHOLDERS.contains(&token.as_str()) {
            argv.extend(extra_args.iter().cloned());
            saw_user_slot = true;
        } else {
            argv.push(token.clone());
        }
    }
    if !saw_settings_slot {
        argv.extend(settings_args);
    }
    if !saw_user_slot {
        argv.extend(extra_args);
    }

    Ok(Invocation {
        argv,
        env: build_env(effective, global, &search_path),
        cwd: working_dir(effective, document),
    })
}

fn working_dir(effective: &EffectiveSettings, document: &DocumentSnapshot) -> Option<PathBuf> {
    if let Some(dir) = effective.working_dir() {
        let dir = PathBuf::from(dir);
        if dir.is_dir() {
            return Some(dir);
        }
        log::warn!("working_dir '{}' is not a directory, ignoring", dir.display());
    }
    document.directory().map(Path::to_path_buf)
}

/// PATH with the global `paths` setting prepended.
fn augmented_path(global: &GlobalSettings) -> String {
    let mut parts: Vec<String> = global
        .platform_paths()
        .into_iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if let Some(path) = env::var_os("PATH") {
        parts.push(path.to_string_lossy().into_owned());
    }
    parts.join(PATH_SEP)
}

#[cfg(windows)]
const PATH_SEP: &str = ";";
#[cfg(not(windows))]
const PATH_SEP: &str = ":";

fn build_env(
    effective: &EffectiveSettings,
    global: &GlobalSettings,
    search_path: &str,
) -> HashMap<String, String> {
    let mut child_env: HashMap<String, String> = env::vars().collect();
    child_env.insert("PATH".into(), search_path.to_string());
    // Linters read the buffer as UTF-8; pin the locale so they agree.
    child_env.insert("LANG".into(), "en_US.UTF-8".into());
    child_env.insert("LC_CTYPE".into(), "en_US.UTF-8".into());

    if !global.python_paths.is_empty() {
        let mut python_path = global.python_paths.join(PATH_SEP);
        if let Some(existing) = child_env.get("PYTHONPATH") {
            python_path = format!("{}{}{}", python_path, PATH_SEP, existing);
        }
        child_env.insert("PYTHONPATH".into(), python_path);
    }

    for (key, value) in effective.env() {
        child_env.insert(key, value);
    }
    child_env
}

/// Resolve a command token to one or more argv entries.
///
/// A plain token resolves against the (augmented) PATH. A
/// version-qualified token `script@runtime` resolves the runtime (the
/// exact name first, then same-major interpreters with at least the
/// requested minor, then the bare major, then the bare base name) and
/// the script separately, yielding `[runtime, script]`.
pub fn resolve_executable(token: &str, search_path: &str) -> Option<Vec<String>> {
    match token.split_once('@') {
        None => find_on_path(token, search_path).map(|p| vec![p]),
        Some((script, runtime)) => {
            let runtime_path = resolve_runtime(runtime, search_path)?;
            let script_path = find_on_path(script, search_path)?;
            Some(vec![runtime_path, script_path])
        }
    }
}

fn find_on_path(name: &str, search_path: &str) -> Option<String> {
    which::which_in(name, Some(search_path), env::current_dir().ok()?)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// `python3.9` -> ("python", Some(3), Some(9)); `node` -> ("node", None, None).
fn parse_runtime(runtime: &str) -> (String, Option<u32>, Option<u32>) {
    let base_end = runtime
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(runtime.len());
    let (base, version) = runtime.split_at(base_end);
    if version.is_empty() {
        return (base.to_string(), None, None);
    }
    let mut parts = version.splitn(2, '.');
    let major = parts.next().and_then(|s| s.parse().ok());
    let minor = parts.next().and_then(|s| s.parse().ok());
    (base.to_string(), major, minor)
}

fn resolve_runtime(runtime: &str, search_path: &str) -> Option<String> {
    if let Some(path) = find_on_path(runtime, search_path) {
        return Some(path);
    }

    let (base, major, minor) = parse_runtime(runtime);
    if let Some(major) = major {
        // relax the minor: any same-major interpreter at least as new
        if let Some(path) = scan_versioned(&base, major, minor, search_path) {
            return Some(path);
        }
        // relax to the bare major
        if minor.is_some()
            && let Some(path) = find_on_path(&format!("{}{}", base, major), search_path)
        {
            return Some(path);
        }
    }
    // bare interpreter name, last resort
    find_on_path(&base, search_path)
}

/// Scan the search path for executables named `{base}{major}.{minor}`,
/// requiring `minor >= wanted` when a minimum was given, and pick the
/// newest.
fn scan_versioned(
    base: &str,
    major: u32,
    wanted_minor: Option<u32>,
    search_path: &str,
) -> Option<String> {
    let prefix = format!("{}{}.", base, major);
    let mut best: Option<(u32, PathBuf)> = None;

    for dir in search_path.split(PATH_SEP) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(minor_str) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(minor) = minor_str.parse::<u32>() else {
                continue;
            };
            if wanted_minor.is_some_and(|wanted| minor < wanted) {
                continue;
            }
            if !is_executable(&entry.path()) {
                continue;
            }
            if best.as_ref().is_none_or(|(m, _)| minor > *m) {
                best = Some((minor, entry.path()));
            }
        }
    }

    best.map(|(_, path)| path.to_string_lossy().into_owned())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
