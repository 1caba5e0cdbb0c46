//! Output parsing.
//!
//! Converts a linter's raw text output into [`Diagnostic`]s using the
//! spec's compiled pattern. Two modes: single-line (the pattern runs
//! against each physical line) and multiline (the pattern runs
//! repeatedly over the whole buffer; line splitting is skipped
//! entirely, which makes the two modes genuinely different, not just a
//! regex flag).
//!
//! Output that matches nothing parses to an empty list. "No errors" and
//! "no matches" are indistinguishable by design, so this is never a
//! failure.

use regex::Captures;

use crate::diagnostics::{Diagnostic, Severity};
use crate::settings::EffectiveSettings;
use crate::spec::RegisteredLinter;

/// Parse raw output into diagnostics, already filtered through the
/// linter's `filter_errors` patterns.
pub fn parse(output: &str, linter: &RegisteredLinter, effective: &EffectiveSettings) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if linter.spec.multiline {
        for caps in linter.pattern.captures_iter(output) {
            if let Some(diag) = diagnostic_from_captures(&caps, linter) {
                diagnostics.push(diag);
            }
        }
    } else {
        for line in output.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(caps) = linter.pattern.captures(line)
                && let Some(diag) = diagnostic_from_captures(&caps, linter)
            {
                diagnostics.push(diag);
            }
        }
    }

    let filters = compile_filters(&effective.filter_errors(), &linter.spec.name);
    if !filters.is_empty() {
        diagnostics.retain(|diag| {
            let key = diag.filter_key();
            let drop = filters.iter().any(|f| f.is_match(&key));
            if drop {
                log::debug!("{}: filtered '{}'", linter.spec.name, key);
            }
            !drop
        });
    }

    diagnostics
}

fn compile_filters(patterns: &[String], linter: &str) -> Vec<regex::Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(err) => {
                    log::warn!("{}: invalid filter_errors pattern '{}': {}", linter, pattern, err);
                    None
                }
            }
        })
        .collect()
}

fn diagnostic_from_captures(caps: &Captures<'_>, linter: &RegisteredLinter) -> Option<Diagnostic> {
    let (line_base, col_base) = linter.spec.line_col_base;

    let line = adjust(group(caps, "line")?.parse().ok()?, line_base);
    let message = normalize_message(group(caps, "message").unwrap_or_default());
    if message.is_empty() {
        return None;
    }

    // A non-numeric `col` capture contributes its length: some linters
    // emit the source text up to the error instead of a number.
    let col = group(caps, "col").map(|raw| match raw.parse::<u32>() {
        Ok(n) => adjust(n, col_base),
        Err(_) => raw.chars().count() as u32,
    });
    let end_line = group(caps, "end_line")
        .and_then(|raw| raw.parse().ok())
        .map(|n| adjust(n, line_base));
    let end_col = group(caps, "end_col")
        .and_then(|raw| raw.parse().ok())
        .map(|n| adjust(n, col_base));

    Some(Diagnostic {
        line,
        col,
        end_line,
        end_col,
        severity: severity_from_captures(caps, linter.spec.default_severity),
        message,
        code: group(caps, "code").map(str::to_string),
        near: group(caps, "near").map(strip_quotes),
    })
}

/// Non-empty named group, if the pattern defines it and it participated
/// in the match.
fn group<'t>(caps: &Captures<'t>, name: &str) -> Option<&'t str> {
    caps.name(name).map(|m| m.as_str()).filter(|s| !s.is_empty())
}

fn adjust(value: u32, base: u32) -> u32 {
    value.saturating_sub(base)
}

/// Severity precedence: an explicit `error_type` capture, then which of
/// the `error`/`warning` groups matched, then the adapter default.
fn severity_from_captures(caps: &Captures<'_>, default: Severity) -> Severity {
    if let Some(kind) = group(caps, "error_type") {
        return match kind.to_ascii_lowercase().as_str() {
            "error" | "e" | "fatal" => Severity::Error,
            "warning" | "w" | "warn" => Severity::Warning,
            _ => Severity::Other,
        };
    }
    if group(caps, "error").is_some() {
        Severity::Error
    } else if group(caps, "warning").is_some() {
        Severity::Warning
    } else {
        default
    }
}

/// Trailing CR, spaces and periods carry no information and make
/// deduplication flaky.
fn normalize_message(message: &str) -> String {
    message.trim_end_matches(['\r', ' ', '.']).to_string()
}

fn strip_quotes(near: &str) -> String {
    let stripped = near
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| near.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    stripped.unwrap_or(near).to_string()
}
