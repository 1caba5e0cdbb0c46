//! Subprocess execution.
//!
//! Runs one linter invocation under one of four I/O strategies (stdin,
//! temp file, temp dir, file on disk), with a deadline and cooperative
//! cancellation. Temp artifacts are scoped values, so cleanup happens on
//! every exit path, including timeout and cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::command::{Invocation, TARGET_PLACEHOLDER};
use crate::document::DocumentSnapshot;
use crate::spec::{IoStrategy, StreamPolicy};

static ANSI_ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern is valid"));

/// Errors that can occur when invoking a linter process.
#[derive(Debug)]
pub enum ProcessError {
    /// Process could not be started (executable vanished, permissions).
    Spawn(String),
    /// Process exceeded its deadline and was killed.
    Timeout,
    /// A newer request superseded this run; the process was killed.
    Canceled,
    /// A disk-only linter refused to run against an unsaved buffer.
    DirtyBuffer,
    /// I/O error during communication with the process.
    Io(std::io::Error),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(cmd) => write!(f, "failed to spawn linter: {}", cmd),
            Self::Timeout => write!(f, "linter timed out"),
            Self::Canceled => write!(f, "linter run canceled"),
            Self::DirtyBuffer => write!(f, "buffer has unsaved changes, refusing on-disk lint"),
            Self::Io(e) => write!(f, "linter I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<std::io::Error> for ProcessError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Captured output of one finished linter process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl ProcessOutput {
    /// The bytes the output parser should see, per the linter's stream
    /// policy. Streams are concatenated for `Both`.
    pub fn diagnostic_text(&self, policy: StreamPolicy) -> String {
        match policy {
            StreamPolicy::Stdout => self.stdout.clone(),
            StreamPolicy::Stderr => self.stderr.clone(),
            StreamPolicy::Both => {
                let mut combined = self.stdout.clone();
                if !self.stderr.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&self.stderr);
                }
                combined
            }
        }
    }
}

/// Run `invocation` against `document`'s text under `strategy`.
///
/// The `@` placeholder in the argv is substituted with whatever path the
/// strategy produces (or the on-disk path); for non-stdin strategies a
/// missing placeholder appends the path instead, since those linters
/// always need to be told what to read.
pub async fn run(
    invocation: &Invocation,
    document: &DocumentSnapshot,
    strategy: &IoStrategy,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
) -> Result<ProcessOutput, ProcessError> {
    match strategy {
        IoStrategy::Stdin => {
            let argv = substitute_target(&invocation.argv, document.path.as_deref(), false);
            execute(invocation, argv, None, Some(document.text.as_bytes()), timeout, cancel).await
        }
        IoStrategy::TempFile { suffix } => {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join(temp_name(document, suffix));
            std::fs::write(&path, document.text.as_bytes())?;

            let argv = substitute_target(&invocation.argv, Some(&path), true);
            let result = execute(invocation, argv, None, None, timeout, cancel).await;
            // `dir` dropped here removes the file on every path out
            result
        }
        IoStrategy::TempDir { files } => {
            let dir = tempfile::tempdir()?;
            populate_temp_dir(dir.path(), files, document)?;

            let target = document
                .path
                .as_deref()
                .and_then(Path::file_name)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(temp_name(document, "")));
            let argv = substitute_target(&invocation.argv, Some(&dir.path().join(&target)), true);
            let mut result =
                execute(invocation, argv, Some(dir.path()), None, timeout, cancel).await;

            if let (Ok(output), Some(name)) = (&mut result, target.to_str()) {
                output.stdout = filter_lines_naming(&output.stdout, name);
            }
            result
        }
        IoStrategy::DiskOnly => {
            if document.dirty {
                return Err(ProcessError::DirtyBuffer);
            }
            let argv = substitute_target(&invocation.argv, document.path.as_deref(), true);
            execute(invocation, argv, None, None, timeout, cancel).await
        }
    }
}

/// Replace `@` with `target`; when `append_missing`, a target with no
/// placeholder goes at the end. Placeholders with no target are dropped.
fn substitute_target(argv: &[String], target: Option<&Path>, append_missing: bool) -> Vec<String> {
    let target_str = target.map(|p| p.to_string_lossy().into_owned());
    let mut out = Vec::with_capacity(argv.len() + 1);
    let mut substituted = false;

    for arg in argv {
        if arg == TARGET_PLACEHOLDER {
            if let Some(ref t) = target_str {
                out.push(t.clone());
            }
            substituted = true;
        } else {
            out.push(arg.clone());
        }
    }
    if !substituted
        && append_missing
        && let Some(t) = target_str
    {
        out.push(t);
    }
    out
}

/// The filename a temp artifact gets: the document's own name (so the
/// linter sees a familiar extension), with the configured suffix
/// replacing the extension when one is set.
fn temp_name(document: &DocumentSnapshot, suffix: &str) -> String {
    let base = document
        .path
        .as_deref()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string());

    if suffix.is_empty() {
        return base;
    }
    let suffix = if suffix.starts_with('.') {
        suffix.to_string()
    } else {
        format!(".{}", suffix)
    };
    match base.rsplit_once('.') {
        Some((stem, _)) => format!("{}{}", stem, suffix),
        None => format!("{}{}", base, suffix),
    }
}

/// Fill a temp directory with the files a directory-structure linter
/// needs. The linted file comes from the live buffer; everything else is
/// copied from disk relative to the document's directory.
fn populate_temp_dir(
    dir: &Path,
    files: &[String],
    document: &DocumentSnapshot,
) -> Result<(), ProcessError> {
    let doc_name = document.path.as_deref().and_then(Path::file_name);
    let source_dir = document.directory();

    for rel in files {
        let target = dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let is_linted_file = doc_name.is_some_and(|n| target.file_name() == Some(n));
        if is_linted_file {
            std::fs::write(&target, document.text.as_bytes())?;
        } else if let Some(src) = source_dir.map(|d| d.join(rel)) {
            if src.is_file() {
                std::fs::copy(&src, &target)?;
            }
        }
    }

    // the linted file is always present, even if absent from `files`
    if let Some(name) = doc_name {
        let target = dir.join(name);
        if !target.exists() {
            std::fs::write(&target, document.text.as_bytes())?;
        }
    }
    Ok(())
}

/// Keep only output lines whose leading `path:` field names the linted
/// file. Directory-wide linters report on everything they find in the
/// temp dir; only the target's diagnostics are wanted.
fn filter_lines_naming(output: &str, filename: &str) -> String {
    output
        .lines()
        .filter(|line| {
            line.split(':')
                .next()
                .is_some_and(|field| field.contains(filename))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn execute(
    invocation: &Invocation,
    argv: Vec<String>,
    cwd_override: Option<&Path>,
    input: Option<&[u8]>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
) -> Result<ProcessOutput, ProcessError> {
    let program = argv.first().ok_or_else(|| ProcessError::Spawn("<empty argv>".into()))?;

    log::debug!("spawning {:?}", argv);
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .env_clear()
        .envs(&invocation.env)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = cwd_override.map(Path::to_path_buf).or_else(|| invocation.cwd.clone()) {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::Spawn(format!("{}: {}", program, e)))?;

    if let Some(bytes) = input {
        let mut stdin = child.stdin.take().ok_or_else(|| {
            ProcessError::Io(std::io::Error::other("child stdin was not piped"))
        })?;
        stdin.write_all(bytes).await?;
        drop(stdin); // close to signal EOF
    }

    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => {
            match result {
                // the in-flight future is dropped on timeout; kill_on_drop
                // reaps the child
                Err(_) => return Err(ProcessError::Timeout),
                Ok(output) => output?,
            }
        }
        _ = wait_canceled(cancel) => return Err(ProcessError::Canceled),
    };

    Ok(ProcessOutput {
        stdout: clean_output(&output.stdout),
        stderr: clean_output(&output.stderr),
        status: output.status,
    })
}

async fn wait_canceled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // sender gone without canceling: never fires
            std::future::pending::<()>().await;
        }
    }
}

/// Lossy-decode and strip ANSI color sequences; linters colorize freely.
fn clean_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    ANSI_ESCAPE_RE.replace_all(&text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentId, Revision};
    use std::collections::HashMap;

    fn doc(text: &str) -> DocumentSnapshot {
        DocumentSnapshot::new(DocumentId(1), Revision(0), text, "source.python")
    }

    fn invocation(argv: &[&str]) -> Invocation {
        Invocation {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: std::env::vars().collect::<HashMap<_, _>>(),
            cwd: None,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        // a dropped sender never signals cancellation
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn test_stdin_strategy_pipes_text() {
        let out = run(
            &invocation(&["cat"]),
            &doc("hello from the buffer\n"),
            &IoStrategy::Stdin,
            Duration::from_secs(5),
            no_cancel(),
        )
        .await
        .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stdout, "hello from the buffer\n");
    }

    #[tokio::test]
    async fn test_tempfile_strategy_substitutes_path() {
        let out = run(
            &invocation(&["cat", "@"]),
            &doc("tempfile body\n"),
            &IoStrategy::TempFile { suffix: ".py".into() },
            Duration::from_secs(5),
            no_cancel(),
        )
        .await
        .unwrap();

        assert_eq!(out.stdout, "tempfile body\n");
    }

    #[tokio::test]
    async fn test_tempfile_appends_when_no_placeholder() {
        let out = run(
            &invocation(&["cat"]),
            &doc("appended\n"),
            &IoStrategy::TempFile { suffix: "tmp".into() },
            Duration::from_secs(5),
            no_cancel(),
        )
        .await
        .unwrap();

        assert_eq!(out.stdout, "appended\n");
    }

    #[tokio::test]
    async fn test_disk_only_refuses_dirty_buffer() {
        let err = run(
            &invocation(&["cat", "@"]),
            &doc("x").with_dirty(true),
            &IoStrategy::DiskOnly,
            Duration::from_secs(5),
            no_cancel(),
        )
        .await;

        assert!(matches!(err, Err(ProcessError::DirtyBuffer)));
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let err = run(
            &invocation(&["nonexistent_linter_12345"]),
            &doc("x"),
            &IoStrategy::Stdin,
            Duration::from_secs(5),
            no_cancel(),
        )
        .await;

        assert!(matches!(err, Err(ProcessError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let err = run(
            &invocation(&["sleep", "10"]),
            &doc(""),
            &IoStrategy::Stdin,
            Duration::from_millis(100),
            no_cancel(),
        )
        .await;

        assert!(matches!(err, Err(ProcessError::Timeout)));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            run(
                &invocation(&["sleep", "10"]),
                &doc(""),
                &IoStrategy::Stdin,
                Duration::from_secs(30),
                rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ProcessError::Canceled)));
    }

    #[tokio::test]
    async fn test_stderr_captured_separately() {
        let out = run(
            &invocation(&["sh", "-c", "echo out; echo err >&2; exit 1"]),
            &doc(""),
            &IoStrategy::Stdin,
            Duration::from_secs(5),
            no_cancel(),
        )
        .await
        .unwrap();

        assert!(!out.status.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.diagnostic_text(StreamPolicy::Stdout).trim(), "out");
        assert_eq!(out.diagnostic_text(StreamPolicy::Stderr).trim(), "err");
        assert_eq!(out.diagnostic_text(StreamPolicy::Both), "out\nerr\n");
    }

    #[test]
    fn test_clean_output_strips_ansi() {
        let colored = b"\x1b[31merror\x1b[0m: bad";
        assert_eq!(clean_output(colored), "error: bad");
    }

    #[test]
    fn test_temp_name_suffix_mapping() {
        let named = doc("").with_path("/work/app.component.html");
        assert_eq!(temp_name(&named, "js"), "app.component.js");
        assert_eq!(temp_name(&named, ".js"), "app.component.js");
        assert_eq!(temp_name(&named, ""), "app.component.html");

        let unsaved = doc("");
        assert_eq!(temp_name(&unsaved, "py"), "untitled.py");
    }

    #[test]
    fn test_filter_lines_naming() {
        let output = "main.go:3:1: undefined x\nother.go:1:1: unused y\nmain.go:9:5: bad call";
        assert_eq!(
            filter_lines_naming(output, "main.go"),
            "main.go:3:1: undefined x\nmain.go:9:5: bad call"
        );
    }

    #[tokio::test]
    async fn test_tempdir_strategy_runs_in_populated_dir() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(workspace.path().join("helper.txt"), "aux\n").unwrap();
        let file = workspace.path().join("main.txt");
        std::fs::write(&file, "stale on disk\n").unwrap();

        let snapshot = doc("fresh buffer\n").with_path(&file);
        let out = run(
            // `main.txt:` prefix keeps the line past the output filter
            &invocation(&["sh", "-c", "printf 'main.txt: '; cat main.txt helper.txt"]),
            &snapshot,
            &IoStrategy::TempDir { files: vec!["main.txt".into(), "helper.txt".into()] },
            Duration::from_secs(5),
            no_cancel(),
        )
        .await
        .unwrap();

        // the linted file reflects the live buffer, not the disk contents
        assert_eq!(out.stdout, "main.txt: fresh buffer");
    }
}
