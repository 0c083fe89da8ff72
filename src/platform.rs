//! Target platform profiles.
//!
//! Each platform is described purely as data: its function table, its
//! storage settings and the config keys it uses for layout hints. The
//! emitter and the function rules consult these tables; nothing branches on
//! the platform itself.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, ConvertResult};

/// Supported target platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Glue,
    Athena,
    Redshift,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Glue, Platform::Athena, Platform::Redshift];

    pub fn key(&self) -> &'static str {
        match self {
            Platform::Glue => "glue",
            Platform::Athena => "athena",
            Platform::Redshift => "redshift",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Platform {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConvertError::UnknownPlatform(s.to_string()))
    }
}

/// Which function rule owns a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCategory {
    Date,
    String,
}

/// How a source built-in is spelled on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionTarget {
    /// The target accepts the call as written.
    Native,
    /// Positional template: `{0}`, `{1}`, … are the source arguments.
    Template(&'static str),
}

/// One entry of a platform's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionMapping {
    /// Upper-case T-SQL function name.
    pub name: &'static str,
    pub category: FunctionCategory,
    pub arity: usize,
    /// Argument 0 is a T-SQL datepart (`dd`, `month`, …).
    pub datepart: bool,
    pub target: FunctionTarget,
}

impl FunctionMapping {
    /// Render the call with the given source arguments.
    ///
    /// Returns `None` for native mappings, an arity mismatch or an
    /// unrecognized datepart.
    pub fn render(&self, args: &[&str]) -> Option<String> {
        let FunctionTarget::Template(template) = self.target else {
            return None;
        };
        if args.len() != self.arity {
            return None;
        }
        let mut out = template.to_string();
        for (i, arg) in args.iter().enumerate() {
            let value = if self.datepart && i == 0 {
                normalize_datepart(arg)?.to_string()
            } else {
                arg.to_string()
            };
            out = out.replace(&format!("{{{}}}", i), &value);
        }
        Some(out)
    }
}

/// Map T-SQL datepart spellings to their canonical name.
pub fn normalize_datepart(part: &str) -> Option<&'static str> {
    let part = part.trim().trim_matches('\'').to_ascii_lowercase();
    let canonical = match part.as_str() {
        "year" | "yy" | "yyyy" => "year",
        "quarter" | "qq" | "q" => "quarter",
        "month" | "mm" | "m" => "month",
        "week" | "wk" | "ww" => "week",
        "day" | "dd" | "d" | "dayofyear" | "dy" | "y" => "day",
        "hour" | "hh" => "hour",
        "minute" | "mi" | "n" => "minute",
        "second" | "ss" | "s" => "second",
        "millisecond" | "ms" => "millisecond",
        _ => return None,
    };
    Some(canonical)
}

/// Storage configuration written into every model config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageFormat {
    /// Human readable format, e.g. `parquet`.
    pub name: &'static str,
    /// Config entries for full-table and append materializations.
    pub settings: &'static [(&'static str, &'static str)],
    /// Config entries when the merge strategy is used.
    pub merge_settings: &'static [(&'static str, &'static str)],
}

/// Config keys used for physical layout hints; `None` means unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTemplate {
    pub partition: Option<&'static str>,
    pub sort: Option<&'static str>,
    pub distribution: Option<&'static str>,
}

/// Everything the pipeline needs to know about one target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProfile {
    pub platform: Platform,
    pub dialect: &'static str,
    /// Required variable marker; `{name}` is substituted.
    pub var_marker: &'static str,
    /// Variable marker with a fallback; `{name}` and `{default}` are substituted.
    pub var_default_marker: &'static str,
    /// Model reference marker; `{name}` is substituted.
    pub ref_marker: &'static str,
    /// Source reference marker; `{schema}` and `{name}` are substituted.
    pub source_marker: &'static str,
    /// Opens a block emitted only when a variable resolves to a value.
    pub guard_open_marker: &'static str,
    pub guard_close_marker: &'static str,
    pub functions: &'static [FunctionMapping],
    pub storage: StorageFormat,
    pub layout: LayoutTemplate,
    pub merge_strategy: &'static str,
    pub append_strategy: &'static str,
}

impl PlatformProfile {
    pub fn key(&self) -> &'static str {
        self.platform.key()
    }

    /// Look up a function by T-SQL name within a category.
    pub fn function(&self, name: &str, category: FunctionCategory) -> Option<&FunctionMapping> {
        self.functions
            .iter()
            .find(|f| f.category == category && f.name.eq_ignore_ascii_case(name))
    }

    /// Names in a category that need rewriting on this platform.
    pub fn rewritten_functions(&self, category: FunctionCategory) -> Vec<&'static str> {
        self.functions
            .iter()
            .filter(|f| f.category == category && f.target != FunctionTarget::Native)
            .map(|f| f.name)
            .collect()
    }

    pub fn var(&self, name: &str) -> String {
        self.var_marker.replace("{name}", name)
    }

    pub fn var_with_default(&self, name: &str, default: &str) -> String {
        self.var_default_marker
            .replace("{name}", name)
            .replace("{default}", default)
    }

    pub fn guard_open(&self, name: &str, default: &str) -> String {
        self.guard_open_marker
            .replace("{name}", name)
            .replace("{default}", default)
    }

    pub fn model_ref(&self, name: &str) -> String {
        self.ref_marker.replace("{name}", name)
    }

    pub fn source_ref(&self, schema: &str, name: &str) -> String {
        self.source_marker
            .replace("{schema}", schema)
            .replace("{name}", name)
    }
}

const fn date(name: &'static str, arity: usize, datepart: bool, target: FunctionTarget) -> FunctionMapping {
    FunctionMapping {
        name,
        category: FunctionCategory::Date,
        arity,
        datepart,
        target,
    }
}

const fn string(name: &'static str, arity: usize, target: FunctionTarget) -> FunctionMapping {
    FunctionMapping {
        name,
        category: FunctionCategory::String,
        arity,
        datepart: false,
        target,
    }
}

use FunctionTarget::{Native, Template};

const GLUE_FUNCTIONS: &[FunctionMapping] = &[
    date("GETDATE", 0, false, Template("current_timestamp()")),
    date("GETUTCDATE", 0, false, Template("current_timestamp()")),
    date("SYSDATETIME", 0, false, Template("current_timestamp()")),
    date("DATEADD", 3, true, Template("timestampadd({0}, {1}, {2})")),
    date("DATEDIFF", 3, true, Template("timestampdiff({0}, {1}, {2})")),
    date("YEAR", 1, false, Template("extract(year from {0})")),
    date("MONTH", 1, false, Template("extract(month from {0})")),
    date("DAY", 1, false, Template("extract(day from {0})")),
    date("EOMONTH", 1, false, Template("last_day({0})")),
    string("ISNULL", 2, Template("coalesce({0}, {1})")),
    string("LEN", 1, Template("length({0})")),
    string("CHARINDEX", 2, Template("instr({1}, {0})")),
    string("CONVERT", 2, Template("cast({1} as {0})")),
];

const ATHENA_FUNCTIONS: &[FunctionMapping] = &[
    date("GETDATE", 0, false, Template("current_timestamp")),
    date("GETUTCDATE", 0, false, Template("current_timestamp AT TIME ZONE 'UTC'")),
    date("SYSDATETIME", 0, false, Template("current_timestamp")),
    date("DATEADD", 3, true, Template("date_add('{0}', {1}, {2})")),
    date("DATEDIFF", 3, true, Template("date_diff('{0}', {1}, {2})")),
    date("YEAR", 1, false, Template("extract(year from {0})")),
    date("MONTH", 1, false, Template("extract(month from {0})")),
    date("DAY", 1, false, Template("extract(day from {0})")),
    date("EOMONTH", 1, false, Template("last_day_of_month({0})")),
    string("ISNULL", 2, Template("coalesce({0}, {1})")),
    string("LEN", 1, Template("length({0})")),
    string("CHARINDEX", 2, Template("strpos({1}, {0})")),
    string("CONVERT", 2, Template("cast({1} as {0})")),
];

const REDSHIFT_FUNCTIONS: &[FunctionMapping] = &[
    date("GETDATE", 0, false, Template("sysdate")),
    date("GETUTCDATE", 0, false, Template("sysdate")),
    date("SYSDATETIME", 0, false, Template("sysdate")),
    date("DATEADD", 3, true, Native),
    date("DATEDIFF", 3, true, Native),
    date("YEAR", 1, false, Template("extract(year from {0})")),
    date("MONTH", 1, false, Template("extract(month from {0})")),
    date("DAY", 1, false, Template("extract(day from {0})")),
    date("EOMONTH", 1, false, Template("last_day({0})")),
    string("ISNULL", 2, Template("coalesce({0}, {1})")),
    string("LEN", 1, Native),
    string("CHARINDEX", 2, Template("strpos({1}, {0})")),
    string("CONVERT", 2, Template("cast({1} as {0})")),
];

const VAR_MARKER: &str = "{{ var('{name}') }}";
const VAR_DEFAULT_MARKER: &str = "{{ var('{name}', {default}) }}";
const REF_MARKER: &str = "{{ ref('{name}') }}";
const SOURCE_MARKER: &str = "{{ source('{schema}', '{name}') }}";
const GUARD_OPEN_MARKER: &str = "{% if var('{name}', {default}) is not none %}";
const GUARD_CLOSE_MARKER: &str = "{% endif %}";

fn glue() -> PlatformProfile {
    PlatformProfile {
        platform: Platform::Glue,
        dialect: "Spark SQL",
        var_marker: VAR_MARKER,
        var_default_marker: VAR_DEFAULT_MARKER,
        ref_marker: REF_MARKER,
        source_marker: SOURCE_MARKER,
        guard_open_marker: GUARD_OPEN_MARKER,
        guard_close_marker: GUARD_CLOSE_MARKER,
        functions: GLUE_FUNCTIONS,
        storage: StorageFormat {
            name: "parquet",
            settings: &[("file_format", "parquet")],
            merge_settings: &[("file_format", "iceberg")],
        },
        layout: LayoutTemplate {
            partition: Some("partition_by"),
            sort: None,
            distribution: None,
        },
        merge_strategy: "merge",
        append_strategy: "append",
    }
}

fn athena() -> PlatformProfile {
    PlatformProfile {
        platform: Platform::Athena,
        dialect: "Trino SQL",
        var_marker: VAR_MARKER,
        var_default_marker: VAR_DEFAULT_MARKER,
        ref_marker: REF_MARKER,
        source_marker: SOURCE_MARKER,
        guard_open_marker: GUARD_OPEN_MARKER,
        guard_close_marker: GUARD_CLOSE_MARKER,
        functions: ATHENA_FUNCTIONS,
        storage: StorageFormat {
            name: "parquet",
            settings: &[("table_type", "hive"), ("format", "parquet")],
            merge_settings: &[("table_type", "iceberg"), ("format", "parquet")],
        },
        layout: LayoutTemplate {
            partition: Some("partitioned_by"),
            sort: None,
            distribution: None,
        },
        merge_strategy: "merge",
        append_strategy: "append",
    }
}

fn redshift() -> PlatformProfile {
    PlatformProfile {
        platform: Platform::Redshift,
        dialect: "Redshift SQL",
        var_marker: VAR_MARKER,
        var_default_marker: VAR_DEFAULT_MARKER,
        ref_marker: REF_MARKER,
        source_marker: SOURCE_MARKER,
        guard_open_marker: GUARD_OPEN_MARKER,
        guard_close_marker: GUARD_CLOSE_MARKER,
        functions: REDSHIFT_FUNCTIONS,
        storage: StorageFormat {
            name: "native columnar",
            settings: &[],
            merge_settings: &[],
        },
        layout: LayoutTemplate {
            partition: None,
            sort: Some("sort"),
            distribution: Some("dist"),
        },
        merge_strategy: "merge",
        append_strategy: "append",
    }
}

/// Read-only table of platform profiles.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<PlatformProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    /// The Glue, Athena and Redshift profiles.
    pub fn builtin() -> Self {
        Self {
            profiles: vec![glue(), athena(), redshift()],
        }
    }

    /// Process-wide built-in registry.
    pub fn shared() -> &'static ProfileRegistry {
        static SHARED: LazyLock<ProfileRegistry> = LazyLock::new(ProfileRegistry::builtin);
        &SHARED
    }

    /// Look a profile up by key (`glue`, `athena`, `redshift`).
    pub fn get(&self, key: &str) -> ConvertResult<&PlatformProfile> {
        self.profiles
            .iter()
            .find(|p| p.key().eq_ignore_ascii_case(key.trim()))
            .ok_or_else(|| ConvertError::UnknownPlatform(key.to_string()))
    }

    pub fn profile(&self, platform: Platform) -> ConvertResult<&PlatformProfile> {
        self.get(platform.key())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlatformProfile> {
        self.profiles.iter()
    }
}
