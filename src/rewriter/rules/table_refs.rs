use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::lexer;
use crate::platform::PlatformProfile;
use crate::rewriter::{Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits};

static CTE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bWITH|,)\s*(\w+)\s*(?:\([^()]*\))?\s+AS\s*\(").expect("cte name regex")
});

/// `FROM` inside `extract(year FROM x)` or `trim(' ' FROM x)`.
static FUNCTION_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:extract|trim)\s*\([^()]*$").expect("function from regex")
});

static DELETE_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bDELETE\s*$").expect("delete from regex"));

const NOT_TABLES: &[&str] = &["select", "lateral", "unnest", "values", "table"];

/// Replaces physical table names after `FROM` / `JOIN` with model or
/// source references. CTE names and derived tables are left alone.
pub struct TableRefRule {
    table: Regex,
}

impl TableRefRule {
    pub fn new() -> Self {
        Self {
            table: Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([\w\[\]]+(?:\.[\w\[\]]+){0,2})")
                .expect("table regex"),
        }
    }

    /// Byte ranges and replacements for every table reference.
    fn references(&self, body: &str, profile: &PlatformProfile) -> Vec<Edit> {
        let masked = lexer::mask(body);
        let ctes: HashSet<String> = CTE_NAME
            .captures_iter(&masked)
            .map(|c| c[1].to_ascii_lowercase())
            .collect();

        self.table
            .captures_iter(&masked)
            .filter_map(|c| {
                let whole = c.get(0)?;
                let name = c.get(1)?;
                let before = &masked[..whole.start()];
                if FUNCTION_FROM.is_match(before) || DELETE_FROM.is_match(before) {
                    return None;
                }
                if masked[name.end()..].trim_start().starts_with('(') {
                    return None;
                }
                let raw = lexer::unbracket(&body[name.range()]);
                let lower = raw.to_ascii_lowercase();
                if ctes.contains(&lower) || NOT_TABLES.contains(&lower.as_str()) {
                    return None;
                }
                Some(Edit::new(name.range(), reference(&raw, profile)))
            })
            .collect()
    }
}

impl Default for TableRefRule {
    fn default() -> Self {
        Self::new()
    }
}

/// `dbo.x` and bare names are models; other schemas are sources.
fn reference(name: &str, profile: &PlatformProfile) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    match parts.as_slice() {
        [table] => profile.model_ref(table),
        [schema, table] | [_, schema, table] if schema.eq_ignore_ascii_case("dbo") => {
            profile.model_ref(table)
        }
        [schema, table] | [_, schema, table] => profile.source_ref(schema, table),
        _ => profile.model_ref(name),
    }
}

impl RewriteRule for TableRefRule {
    fn id(&self) -> &'static str {
        "table-refs"
    }

    fn is_relevant(&self, body: &str, ctx: &RewriteContext<'_>) -> bool {
        !self.references(body, ctx.profile).is_empty()
    }

    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, _facts: &mut RewriteFacts) -> Rewrite {
        let edits = self.references(body, ctx.profile);
        Rewrite::applied(apply_edits(body, edits))
    }
}
