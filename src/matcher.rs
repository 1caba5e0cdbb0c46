//! Linter-to-document assignment.
//!
//! A linter applies to a document when its scope selector matches the
//! document's scope (or, for embedded syntaxes, the scope of one of its
//! sub-regions). Matching is by selector *scoring*: the most specific
//! non-zero match wins, a zero score means "skipped for this document".

use std::ops::Range;

use globset::{Glob, GlobSetBuilder};

use crate::document::DocumentSnapshot;
use crate::settings::{
    EffectiveSettings, SettingsProvider, SettingsSnapshot, resolve,
};
use crate::spec::{LinterRegistry, RegisteredLinter};

/// One linter that should run on a document, with the byte ranges to
/// lint (the whole document, or embedded sub-regions).
#[derive(Debug)]
pub struct LinterAssignment<'r> {
    pub linter: &'r RegisteredLinter,
    pub effective: EffectiveSettings,
    pub regions: Vec<Range<usize>>,
}

/// Score a selector against a scope stack.
///
/// The stack is a space-separated list of dot-separated scope names,
/// outermost first (`text.html.basic source.js.embedded.html`). A
/// selector is a comma-separated list of alternatives, each a
/// space-separated sequence of scope prefixes that must match stack
/// entries in order. The score of an alternative is the number of scope
/// components it pins down; the best alternative wins. Zero means no
/// match.
pub fn score_selector(selector: &str, scope_stack: &str) -> u32 {
    let scopes: Vec<&str> = scope_stack.split_whitespace().collect();

    selector
        .split(',')
        .map(|alternative| score_alternative(alternative.trim(), &scopes))
        .max()
        .unwrap_or(0)
}

fn score_alternative(alternative: &str, scopes: &[&str]) -> u32 {
    if alternative.is_empty() {
        return 0;
    }

    let mut score = 0;
    let mut next_scope = 0;

    'parts: for part in alternative.split_whitespace() {
        while next_scope < scopes.len() {
            let scope = scopes[next_scope];
            next_scope += 1;
            if scope_prefix_matches(part, scope) {
                score += part.split('.').count() as u32;
                continue 'parts;
            }
        }
        return 0;
    }

    score
}

/// `source.js` matches `source.js` and `source.js.embedded.html`, but
/// not `source.json`.
fn scope_prefix_matches(selector_part: &str, scope: &str) -> bool {
    let mut scope_components = scope.split('.');
    selector_part
        .split('.')
        .all(|wanted| scope_components.next() == Some(wanted))
}

/// Remap a scope stack through the global `syntax_map`, entry by entry.
/// Lets e.g. a templated-HTML variant lint as plain HTML.
fn remap_scope(scope: &str, snapshot: &SettingsSnapshot) -> String {
    scope
        .split_whitespace()
        .map(|name| {
            snapshot
                .global
                .syntax_map
                .get(name)
                .map(String::as_str)
                .unwrap_or(name)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn excluded_by_glob(document: &DocumentSnapshot, effective: &EffectiveSettings) -> bool {
    let excludes = effective.excludes();
    if excludes.is_empty() {
        return false;
    }
    let Some(path) = document.path.as_deref() else {
        return false;
    };

    let mut builder = GlobSetBuilder::new();
    for pattern in &excludes {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => log::warn!("invalid excludes pattern '{}': {}", pattern, err),
        }
    }
    match builder.build() {
        Ok(set) => set.is_match(path),
        Err(_) => false,
    }
}

/// Determine which linters apply to `document` and where.
///
/// Disabled and exclude-matched linters are filtered here; a linter
/// whose selector simply does not match is skipped silently (it stays
/// registered and may match other documents).
pub fn applicable_linters<'r>(
    document: &DocumentSnapshot,
    registry: &'r LinterRegistry,
    settings: &SettingsSnapshot,
    providers: &[Box<dyn SettingsProvider>],
) -> Vec<LinterAssignment<'r>> {
    let scope = remap_scope(&document.scope, settings);
    let mut assignments = Vec::new();

    for linter in registry.iter() {
        let effective = resolve(settings, providers, document, linter);
        if effective.disabled() {
            log::debug!("{}: disabled by settings", linter.spec.name);
            continue;
        }
        if excluded_by_glob(document, &effective) {
            log::debug!(
                "{}: '{}' excluded by pattern",
                linter.spec.name,
                document.path.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
            );
            continue;
        }

        let selector = effective.selector().unwrap_or(&linter.spec.selector);
        let regions = if score_selector(selector, &scope) > 0 {
            vec![0..document.text.len()]
        } else {
            embedded_regions(document, linter, settings)
        };

        if regions.is_empty() {
            continue;
        }
        assignments.push(LinterAssignment {
            linter,
            effective,
            regions,
        });
    }

    assignments.sort_by(|a, b| a.linter.spec.name.cmp(&b.linter.spec.name));
    assignments
}

/// Sub-regions of the document matched by the linter's embedded-syntax
/// selectors.
fn embedded_regions(
    document: &DocumentSnapshot,
    linter: &RegisteredLinter,
    settings: &SettingsSnapshot,
) -> Vec<Range<usize>> {
    let mut regions = Vec::new();
    for region in &document.regions {
        let scope = remap_scope(&region.scope, settings);
        let matched = linter
            .spec
            .embedded_selectors
            .values()
            .any(|selector| score_selector(selector, &scope) > 0);
        if matched {
            regions.push(region.range.clone());
        }
    }
    regions
}
