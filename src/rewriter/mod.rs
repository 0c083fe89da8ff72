//! Rule-based rewriting of a procedure body into a templated model body.
//!
//! ## Architecture
//!
//! ```text
//! body → [rule 1] → [rule 2] → … → [rule n] → residual markers → rewritten body
//!            │          │               │
//!            └──────────┴───── RewriteLog (one entry per candidate rule)
//! ```
//!
//! Rules run in a fixed order and each owns a disjoint syntactic category,
//! so no rule re-triggers on text produced by an earlier one. A rule that
//! meets a construct it cannot rewrite leaves it alone and reports itself
//! as not applied; it never fails the conversion.

mod residual;
mod rules;

use std::ops::Range;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::ConversionPattern;
use crate::lexer;
use crate::platform::PlatformProfile;
use crate::source::SourceUnit;

pub use residual::{MANUAL_MARKER, annotate_residuals, count_markers};
pub use rules::*;

/// Inputs shared by every rule.
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    pub unit: &'a SourceUnit,
    pub pattern: ConversionPattern,
    pub profile: &'a PlatformProfile,
}

/// A procedural guard delegated to a validation macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationGuard {
    pub macro_name: String,
    /// Parameters passed to the macro, in order of first use.
    pub params: Vec<String>,
    /// The guard condition as written in the source.
    pub condition: String,
    pub message: String,
}

/// Facts rules discover while rewriting; consumed by the emitter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteFacts {
    /// Persistent table the procedure wrote to.
    pub target_table: Option<String>,
    /// Merge key columns inferred from join predicates.
    pub unique_key: Vec<String>,
    /// Temp tables turned into CTEs.
    pub ctes: Vec<String>,
    pub validations: Vec<ValidationGuard>,
}

impl RewriteFacts {
    pub(crate) fn add_unique_key(&mut self, column: &str) {
        let column = column.to_ascii_lowercase();
        if !self.unique_key.contains(&column) {
            self.unique_key.push(column);
        }
    }
}

/// What a single rule did to the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    pub applied: bool,
}

impl Rewrite {
    pub fn applied(text: String) -> Self {
        Self { text, applied: true }
    }

    pub fn unapplied(text: String) -> Self {
        Self { text, applied: false }
    }
}

/// A single text rewrite rule: a trigger condition plus a rewrite action.
pub trait RewriteRule: Send + Sync {
    fn id(&self) -> &'static str;

    /// Whether the rule takes part for this pattern at all.
    fn applies_to(&self, _pattern: ConversionPattern) -> bool {
        true
    }

    /// Whether the rule's trigger is structurally present in `body`.
    fn is_relevant(&self, body: &str, ctx: &RewriteContext<'_>) -> bool;

    /// Rewrite the body. Only called when the rule is relevant.
    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, facts: &mut RewriteFacts) -> Rewrite;
}

/// One evaluated candidate rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewriteEntry {
    pub rule: &'static str,
    pub relevant: bool,
    pub applied: bool,
}

/// Ordered record of every candidate rule evaluated against one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteLog {
    entries: Vec<RewriteEntry>,
}

impl RewriteLog {
    pub fn push(&mut self, entry: RewriteEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[RewriteEntry] {
        &self.entries
    }

    pub fn relevant_count(&self) -> usize {
        self.entries.iter().filter(|e| e.relevant).count()
    }

    pub fn applied_count(&self) -> usize {
        self.entries.iter().filter(|e| e.relevant && e.applied).count()
    }

    pub fn entry(&self, rule: &str) -> Option<&RewriteEntry> {
        self.entries.iter().find(|e| e.rule == rule)
    }

    /// Ids of rules that were relevant and applied.
    pub fn applied_rules(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|e| e.relevant && e.applied)
            .map(|e| e.rule)
            .collect()
    }
}

/// Result of running the rule set over a body.
#[derive(Debug, Clone)]
pub struct RewriteOutput {
    pub body: String,
    pub log: RewriteLog,
    pub facts: RewriteFacts,
}

/// The fixed, ordered rule pipeline.
pub struct RuleSet {
    rules: Vec<Box<dyn RewriteRule>>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleSet {
    /// The standard T-SQL rule pipeline, in execution order.
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Box::new(PragmaRule::new()),
                Box::new(ValidationRule::new()),
                Box::new(MergeSourceRule::new()),
                Box::new(TargetDmlRule::new()),
                Box::new(TempTableRule::new()),
                Box::new(OptionalParamRule),
                Box::new(RequiredParamRule),
                Box::new(FunctionRule::date()),
                Box::new(FunctionRule::string()),
                Box::new(TableRefRule::new()),
            ],
        }
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Run every candidate rule over `body`, then mark residual constructs.
    pub fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>) -> RewriteOutput {
        let mut text = body.to_string();
        let mut log = RewriteLog::default();
        let mut facts = RewriteFacts::default();

        for rule in self.rules.iter().filter(|r| r.applies_to(ctx.pattern)) {
            let relevant = rule.is_relevant(&text, ctx);
            let applied = if relevant {
                let rewrite = rule.rewrite(&text, ctx, &mut facts);
                text = rewrite.text;
                rewrite.applied
            } else {
                false
            };
            debug!(rule = rule.id(), relevant, applied, "rewrite rule evaluated");
            log.push(RewriteEntry {
                rule: rule.id(),
                relevant,
                applied,
            });
        }

        RewriteOutput {
            body: annotate_residuals(&text),
            log,
            facts,
        }
    }
}

/// A replacement of one byte range of the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edit {
    pub range: Range<usize>,
    pub replacement: String,
}

impl Edit {
    pub fn new(range: Range<usize>, replacement: impl Into<String>) -> Self {
        Self {
            range,
            replacement: replacement.into(),
        }
    }

    pub fn remove(range: Range<usize>) -> Self {
        Self::new(range, "")
    }
}

/// Apply non-overlapping edits. Overlapping edits after the first are dropped.
pub(crate) fn apply_edits(text: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| e.range.start);
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for edit in edits {
        if edit.range.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..edit.range.start]);
        out.push_str(&edit.replacement);
        cursor = edit.range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Extend a statement range over its `;` terminator and the rest of the line.
pub(crate) fn removal_range(text: &str, stmt: &Range<usize>) -> Range<usize> {
    let bytes = text.as_bytes();
    let mut end = stmt.end;
    while end < bytes.len() && matches!(bytes[end], b' ' | b'\t') {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b';' {
        end += 1;
    }
    while end < bytes.len() && matches!(bytes[end], b' ' | b'\t' | b'\r') {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'\n' {
        end += 1;
    }
    stmt.start..end
}

/// Result of [`replace_masked`].
#[derive(Debug, Clone)]
pub(crate) struct Replaced {
    pub text: String,
    pub replaced: usize,
    pub declined: usize,
}

/// Replace every match of `re` found in the masked text.
///
/// `render` receives the match with capture groups read from the original
/// text and returns the replacement, or `None` to leave the match alone.
pub(crate) fn replace_masked<F>(text: &str, re: &Regex, mut render: F) -> Replaced
where
    F: FnMut(&OriginalCaptures<'_>) -> Option<String>,
{
    let masked = lexer::mask(text);
    let mut edits = Vec::new();
    let mut declined = 0;
    for caps in re.captures_iter(&masked) {
        let original = OriginalCaptures {
            text,
            caps: &caps,
        };
        let Some(whole) = caps.get(0) else { continue };
        match render(&original) {
            Some(replacement) => edits.push(Edit::new(whole.range(), replacement)),
            None => declined += 1,
        }
    }
    let replaced = edits.len();
    Replaced {
        text: apply_edits(text, edits),
        replaced,
        declined,
    }
}

/// Captures from masked text, resolved against the original.
pub(crate) struct OriginalCaptures<'t> {
    text: &'t str,
    caps: &'t Captures<'t>,
}

impl<'t> OriginalCaptures<'t> {
    /// Original text of group `i`, or `""` when it did not participate.
    pub fn get(&self, i: usize) -> &'t str {
        self.caps
            .get(i)
            .map(|m| &self.text[m.range()])
            .unwrap_or("")
    }

    pub fn range(&self, i: usize) -> Option<Range<usize>> {
        self.caps.get(i).map(|m| m.range())
    }
}

/// Regex matching a reference to `@name` that is not `@@name`.
pub(crate) fn param_reference(name: &str) -> Regex {
    Regex::new(&format!(r"(?i)(?:^|[^@\w])(@{})\b", regex::escape(name)))
        .expect("escaped parameter regex")
}
