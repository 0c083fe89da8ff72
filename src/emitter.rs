//! Platform Emitter: wraps a rewritten body in a model header.
//!
//! Materialization follows the pattern, storage and layout keys come from
//! the profile, and layout columns are inferred from the output projection.
//! Nothing here touches the SQL itself.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::classifier::ConversionPattern;
use crate::lexer;
use crate::platform::PlatformProfile;
use crate::rewriter::RewriteFacts;

static SELECT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\b").expect("select regex"));
static FROM_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bFROM\b").expect("from regex"));
static SELECT_MODIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:DISTINCT|ALL)\b|^\s*TOP\s*\(?\s*\d+\s*\)?").expect("modifier regex")
});
static ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bAS\s+\[?(\w+)\]?\s*$").expect("alias regex"));
static ASSIGNED_ALIAS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[?(\w+)\]?\s*=[^=]").expect("assigned alias regex"));
static COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[\w\[\]]+\.)*\[?(\w+)\]?$").expect("column regex")
});

/// Model materialization chosen from the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Materialization {
    pub materialized: &'static str,
    pub incremental_strategy: Option<&'static str>,
}

impl Materialization {
    pub fn for_pattern(pattern: ConversionPattern, profile: &PlatformProfile) -> Self {
        match pattern {
            ConversionPattern::FullLoad => Self {
                materialized: "table",
                incremental_strategy: None,
            },
            ConversionPattern::UpsertMerge
            | ConversionPattern::HistoryUpsert
            | ConversionPattern::MultiDmlUpsert => Self {
                materialized: "incremental",
                incremental_strategy: Some(profile.merge_strategy),
            },
            ConversionPattern::SnapshotAppend => Self {
                materialized: "incremental",
                incremental_strategy: Some(profile.append_strategy),
            },
        }
    }

    fn is_merge(&self, profile: &PlatformProfile) -> bool {
        self.incremental_strategy == Some(profile.merge_strategy)
    }
}

/// Everything that goes into the `config(...)` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelConfig {
    pub materialization: Materialization,
    pub unique_key: Vec<String>,
    pub storage: Vec<(&'static str, &'static str)>,
    pub partition: Option<String>,
    pub sort: Option<String>,
    pub distribution: Option<String>,
    pub tags: Vec<String>,
}

impl ModelConfig {
    pub fn infer(
        unit_name: &str,
        body: &str,
        pattern: ConversionPattern,
        profile: &PlatformProfile,
        facts: &RewriteFacts,
    ) -> Self {
        let materialization = Materialization::for_pattern(pattern, profile);
        let merge = materialization.is_merge(profile);
        let unique_key = if merge {
            facts.unique_key.clone()
        } else {
            Vec::new()
        };
        let storage = if merge {
            profile.storage.merge_settings.to_vec()
        } else {
            profile.storage.settings.to_vec()
        };

        let columns = projection_columns(body);
        let layout = &profile.layout;
        let partition = layout
            .partition
            .and_then(|_| columns.iter().find(|c| is_partition_column(c)).cloned());
        let sort = layout
            .sort
            .and_then(|_| columns.iter().find(|c| is_sort_column(c)).cloned());
        let distribution = layout.distribution.and_then(|_| {
            unique_key
                .first()
                .cloned()
                .or_else(|| columns.iter().find(|c| c.ends_with("_id")).cloned())
        });

        let tag = unit_name
            .split('_')
            .next()
            .unwrap_or(unit_name)
            .to_ascii_lowercase();

        Self {
            materialization,
            unique_key,
            storage,
            partition,
            sort,
            distribution,
            tags: vec![tag],
        }
    }

    /// Render the `{{ config(...) }}` block.
    pub fn render(&self, profile: &PlatformProfile) -> String {
        let mut entries = vec![format!(
            "materialized='{}'",
            self.materialization.materialized
        )];
        if let Some(strategy) = self.materialization.incremental_strategy {
            entries.push(format!("incremental_strategy='{strategy}'"));
        }
        match self.unique_key.as_slice() {
            [] => {}
            [key] => entries.push(format!("unique_key='{key}'")),
            keys => entries.push(format!("unique_key={}", quoted_list(keys))),
        }
        for (key, value) in &self.storage {
            entries.push(format!("{key}='{value}'"));
        }
        if let (Some(key), Some(column)) = (profile.layout.partition, &self.partition) {
            entries.push(format!("{key}={}", quoted_list(std::slice::from_ref(column))));
        }
        if let (Some(key), Some(column)) = (profile.layout.sort, &self.sort) {
            entries.push(format!("{key}={}", quoted_list(std::slice::from_ref(column))));
        }
        if let (Some(key), Some(column)) = (profile.layout.distribution, &self.distribution) {
            entries.push(format!("{key}='{column}'"));
        }
        entries.push(format!("tags={}", quoted_list(&self.tags)));

        let mut out = String::from("{{\n    config(\n");
        let last = entries.len() - 1;
        for (i, entry) in entries.iter().enumerate() {
            let sep = if i == last { "" } else { "," };
            out.push_str(&format!("        {entry}{sep}\n"));
        }
        out.push_str("    )\n}}");
        out
    }
}

fn quoted_list(items: &[String]) -> String {
    let items: Vec<String> = items.iter().map(|i| format!("'{i}'")).collect();
    format!("[{}]", items.join(", "))
}

fn is_partition_column(name: &str) -> bool {
    matches!(name, "date" | "month" | "year")
        || ["_date", "_dt", "_month", "_year"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

fn is_sort_column(name: &str) -> bool {
    ["_at", "_ts", "_date", "_time"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Output column names of the body's final query, lower-cased.
///
/// Reads the first top-level `SELECT` of the last statement; expressions
/// without an alias and `*` projections are skipped.
pub fn projection_columns(body: &str) -> Vec<String> {
    let Some(last) = lexer::split_statements(body).pop() else {
        return Vec::new();
    };
    let stmt = &body[last];
    let Some(span) = projection_span(stmt) else {
        return Vec::new();
    };
    lexer::split_top_level(&stmt[span])
        .into_iter()
        .filter_map(output_name)
        .collect()
}

/// Byte range of the projection list of a statement's first top-level
/// `SELECT`, after any `DISTINCT`, `ALL` or `TOP n` modifier.
pub fn projection_span(stmt: &str) -> Option<Range<usize>> {
    let masked = lexer::mask(stmt);
    let depth_at = |pos: usize| lexer::depth_at(&masked, pos);
    let select = SELECT_WORD.find_iter(&masked).find(|m| depth_at(m.start()) == 0)?;
    let end = FROM_WORD
        .find_iter(&masked[select.end()..])
        .map(|m| select.end() + m.start())
        .find(|&pos| depth_at(pos) == 0)
        .unwrap_or(stmt.len());

    let mut start = select.end();
    if let Some(modifier) = SELECT_MODIFIER.find(&masked[start..end]) {
        start += modifier.end();
    }
    Some(start..end)
}

/// Range of the explicit alias in one projection item, `expr AS name` or
/// `name = expr`.
pub fn alias_span(item: &str) -> Option<Range<usize>> {
    let masked = lexer::mask(item);
    ALIAS
        .captures(&masked)
        .or_else(|| ASSIGNED_ALIAS.captures(&masked))
        .and_then(|c| c.get(1))
        .map(|m| m.range())
}

/// Lower-cased output name of one projection item: its alias, or the
/// column it reads. `None` for unaliased expressions.
pub fn output_name(item: &str) -> Option<String> {
    let masked = lexer::mask(item);
    if let Some(alias) = alias_span(item) {
        return Some(masked[alias].to_ascii_lowercase());
    }
    COLUMN
        .captures(masked.trim())
        .map(|c| c[1].to_ascii_lowercase())
}

/// Wrap a rewritten body into the final model text.
pub fn emit(
    unit_name: &str,
    source_name: &str,
    body: &str,
    pattern: ConversionPattern,
    profile: &PlatformProfile,
    config: &ModelConfig,
) -> String {
    let body = body.trim_end().trim_end_matches(';').trim_end();
    format!(
        "-- {unit_name}: converted from {source_name}\n\
         -- pattern: {pattern}, platform: {} ({})\n\
         {}\n\n{}\n",
        profile.key(),
        profile.dialect,
        config.render(profile),
        body.trim_start_matches('\n'),
    )
}
