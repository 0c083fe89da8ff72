//! Write-strategy classification of a procedure body.
//!
//! Classification runs a fixed list of guards in priority order and the
//! first guard that holds decides the pattern:
//!
//! | Priority | Pattern          | Guard                                                    |
//! |----------|------------------|----------------------------------------------------------|
//! | 1        | `MultiDmlUpsert` | ≥ 2 DML kinds, or ≥ 2 DML statements on one target       |
//! | 2        | `HistoryUpsert`  | history/versioning reference plus MERGE or UPDATE        |
//! | 3        | `UpsertMerge`    | a MERGE or an UPDATE                                     |
//! | 4        | `SnapshotAppend` | INSERT carrying a current timestamp, no MERGE or UPDATE  |
//! | -        | `FullLoad`       | nothing matched                                          |
//!
//! Only writes to persistent tables count; `#temp` tables and `@table`
//! variables are staging.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lexer;

/// Structural write strategy of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPattern {
    FullLoad,
    UpsertMerge,
    HistoryUpsert,
    #[serde(rename = "multiple_dml_upsert")]
    MultiDmlUpsert,
    SnapshotAppend,
}

impl ConversionPattern {
    pub const ALL: [ConversionPattern; 5] = [
        ConversionPattern::FullLoad,
        ConversionPattern::UpsertMerge,
        ConversionPattern::HistoryUpsert,
        ConversionPattern::MultiDmlUpsert,
        ConversionPattern::SnapshotAppend,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ConversionPattern::FullLoad => "full_load",
            ConversionPattern::UpsertMerge => "upsert_merge",
            ConversionPattern::HistoryUpsert => "history_upsert",
            ConversionPattern::MultiDmlUpsert => "multiple_dml_upsert",
            ConversionPattern::SnapshotAppend => "snapshot_append",
        }
    }

    /// Whether the target is maintained incrementally rather than rebuilt.
    pub fn is_incremental(&self) -> bool {
        !matches!(self, ConversionPattern::FullLoad)
    }
}

impl fmt::Display for ConversionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
    Merge,
}

/// A write statement found in the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlStatement {
    pub kind: DmlKind,
    /// Lower-case target with brackets and a `dbo.` prefix removed.
    pub target: String,
    /// The statement also calls a current-timestamp function.
    pub timestamped: bool,
}

impl DmlStatement {
    pub fn is_staging(&self) -> bool {
        self.target.starts_with('#') || self.target.starts_with('@')
    }
}

static INSERT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bINSERT\s+(?:INTO\s+)?([#@]?[\w.\[\]]+)").expect("insert regex")
});
static UPDATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bUPDATE\s+([#@]?[\w.\[\]]+)\s+SET\b").expect("update regex")
});
static DELETE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bDELETE\s+(?:FROM\s+)?([#@]?[\w.\[\]]+)").expect("delete regex")
});
static MERGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bMERGE\s+(?:INTO\s+)?([#@]?[\w.\[\]]+)").expect("merge regex")
});
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:GETDATE|GETUTCDATE|SYSDATETIME)\s*\(\s*\)|\bCURRENT_TIMESTAMP\b")
        .expect("timestamp regex")
});
static HISTORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\w*(?:history|_hist|_scd|_version|_audit)\w*\b|\b(?:valid_from|valid_to|effective_from|effective_to|is_current)\b",
    )
    .expect("history regex")
});

/// Structural facts the guards are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub dml: Vec<DmlStatement>,
    pub history_reference: bool,
}

impl Signals {
    /// Scan a body. Comments and string literals are ignored.
    pub fn scan(body: &str) -> Self {
        let masked = lexer::mask(body);
        let mut dml = Vec::new();
        for range in lexer::split_statements(body) {
            dml.extend(statement_dml(&masked[range]));
        }
        Self {
            dml,
            history_reference: HISTORY.is_match(&masked),
        }
    }

    fn persistent(&self) -> impl Iterator<Item = &DmlStatement> {
        self.dml.iter().filter(|d| !d.is_staging())
    }

    fn has(&self, kind: DmlKind) -> bool {
        self.persistent().any(|d| d.kind == kind)
    }

    fn has_multiple_dml(&self) -> bool {
        let kinds: HashSet<DmlKind> = self.persistent().map(|d| d.kind).collect();
        let mut per_target: HashMap<&str, usize> = HashMap::new();
        for d in self.persistent() {
            *per_target.entry(d.target.as_str()).or_default() += 1;
        }
        kinds.len() >= 2 || per_target.values().any(|&n| n >= 2)
    }

    fn has_history_upsert(&self) -> bool {
        self.history_reference && (self.has(DmlKind::Merge) || self.has(DmlKind::Update))
    }

    fn has_single_upsert(&self) -> bool {
        self.has(DmlKind::Merge) || self.has(DmlKind::Update)
    }

    fn has_timestamped_append(&self) -> bool {
        self.persistent()
            .any(|d| d.kind == DmlKind::Insert && d.timestamped)
            && !self.has(DmlKind::Update)
            && !self.has(DmlKind::Merge)
    }
}

type Guard = fn(&Signals) -> bool;

/// Guards in priority order; see the module docs.
const GUARDS: &[(ConversionPattern, Guard)] = &[
    (ConversionPattern::MultiDmlUpsert, Signals::has_multiple_dml),
    (ConversionPattern::HistoryUpsert, Signals::has_history_upsert),
    (ConversionPattern::UpsertMerge, Signals::has_single_upsert),
    (ConversionPattern::SnapshotAppend, Signals::has_timestamped_append),
];

/// Assign exactly one pattern to a body. Never fails.
pub fn classify(body: &str) -> ConversionPattern {
    classify_signals(&Signals::scan(body))
}

pub fn classify_signals(signals: &Signals) -> ConversionPattern {
    GUARDS
        .iter()
        .find(|(_, guard)| guard(signals))
        .map(|(pattern, _)| *pattern)
        .unwrap_or(ConversionPattern::FullLoad)
}

/// Write statements in one masked statement.
///
/// A MERGE owns its `WHEN … THEN INSERT/UPDATE` branches, so only the
/// MERGE itself is reported for it.
pub fn statement_dml(masked_stmt: &str) -> Vec<DmlStatement> {
    let timestamped = TIMESTAMP.is_match(masked_stmt);
    if let Some(c) = MERGE.captures(masked_stmt) {
        return vec![DmlStatement {
            kind: DmlKind::Merge,
            target: resolve_target(masked_stmt, &c[1]),
            timestamped,
        }];
    }

    let mut found: Vec<(usize, DmlStatement)> = Vec::new();
    for (kind, re) in [
        (DmlKind::Insert, &*INSERT),
        (DmlKind::Update, &*UPDATE),
        (DmlKind::Delete, &*DELETE),
    ] {
        for c in re.captures_iter(masked_stmt) {
            let Some(m) = c.get(0) else { continue };
            found.push((
                m.start(),
                DmlStatement {
                    kind,
                    target: resolve_target(masked_stmt, &c[1]),
                    timestamped,
                },
            ));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, d)| d).collect()
}

/// Normalize a target name, resolving `UPDATE t … FROM orders t` aliases.
fn resolve_target(masked_stmt: &str, raw: &str) -> String {
    let name = normalize_table(raw);
    if name.contains('.') || name.starts_with('#') || name.starts_with('@') {
        return name;
    }
    let alias = Regex::new(&format!(
        r"(?i)\b(?:FROM|JOIN)\s+([#@]?[\w.\[\]]+)\s+(?:AS\s+)?{}\b",
        regex::escape(&name)
    ));
    match alias.ok().and_then(|re| re.captures(masked_stmt)) {
        Some(c) => normalize_table(&c[1]),
        None => name,
    }
}

/// Lower-case, unbracketed, without a `dbo.` schema.
pub fn normalize_table(raw: &str) -> String {
    let name = lexer::unbracket(raw).to_ascii_lowercase();
    name.strip_prefix("dbo.").map(str::to_string).unwrap_or(name)
}
