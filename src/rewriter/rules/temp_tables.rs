use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::lexer;
use crate::rewriter::{
    Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits, removal_range,
    replace_masked,
};

static TEMP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#+(\w+)\b").expect("temp name regex"));

static CREATE_TEMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CREATE\s+TABLE\s+#+\w+").expect("create temp regex"));

static DROP_TEMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^(?:IF\s+OBJECT_ID\s*\(.*?\)\s*IS\s+NOT\s+NULL\s+)?DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?#+\w+\s*$",
    )
    .expect("drop temp regex")
});

static INSERT_TEMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^INSERT\s+(?:INTO\s+)?#+(\w+)\s*(\([^()]*\))?\s*").expect("insert temp regex")
});

static INTO_TEMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+INTO\s+#+(\w+)\b").expect("into temp regex"));

static LEADING_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z]+)").expect("leading word regex"));

/// A temp table turned into a CTE.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CteDefinition {
    name: String,
    columns: Option<String>,
    query: String,
}

impl CteDefinition {
    fn render(&self) -> String {
        let query: Vec<String> = self
            .query
            .trim()
            .lines()
            .map(|line| format!("    {}", line.trim_end()))
            .collect();
        let columns = self
            .columns
            .as_deref()
            .map(|c| format!(" {c}"))
            .unwrap_or_default();
        format!("{}{} AS (\n{}\n)", self.name, columns, query.join("\n"))
    }
}

/// Turns temp tables populated once into CTEs in front of the final query.
pub struct TempTableRule;

impl TempTableRule {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TempTableRule {
    fn default() -> Self {
        Self::new()
    }
}

fn leading_word(masked: &str) -> String {
    LEADING_WORD
        .captures(masked)
        .map(|c| c[1].to_ascii_uppercase())
        .unwrap_or_default()
}

/// Recognize a statement populating a temp table.
fn definition(stmt: &str, masked: &str) -> Option<Result<CteDefinition, ()>> {
    if let Some(c) = INSERT_TEMP.captures(masked) {
        let head = c.get(0)?;
        let rest = &masked[head.end()..];
        if !matches!(leading_word(rest).as_str(), "SELECT" | "WITH") {
            return Some(Err(()));
        }
        return Some(Ok(CteDefinition {
            name: c[1].to_string(),
            columns: c.get(2).map(|g| stmt[g.range()].to_string()),
            query: stmt[head.end()..].trim().to_string(),
        }));
    }
    if matches!(leading_word(masked).as_str(), "SELECT" | "WITH") {
        let into = INTO_TEMP.captures(masked)?;
        let clause = into.get(0)?;
        let query = format!("{}{}", &stmt[..clause.start()], &stmt[clause.end()..]);
        return Some(Ok(CteDefinition {
            name: into[1].to_string(),
            columns: None,
            query: query.trim().to_string(),
        }));
    }
    None
}

impl RewriteRule for TempTableRule {
    fn id(&self) -> &'static str {
        "temp-tables"
    }

    fn is_relevant(&self, body: &str, _ctx: &RewriteContext<'_>) -> bool {
        TEMP_NAME.is_match(&lexer::mask(body))
    }

    fn rewrite(&self, body: &str, _ctx: &RewriteContext<'_>, facts: &mut RewriteFacts) -> Rewrite {
        let masked = lexer::mask(body);
        let mut edits = Vec::new();
        let mut definitions: Vec<CteDefinition> = Vec::new();
        let mut declined = 0;

        for range in lexer::split_statements(body) {
            let m = &masked[range.clone()];
            let stmt = &body[range.clone()];
            if CREATE_TEMP.is_match(m) || DROP_TEMP.is_match(m) {
                edits.push(Edit::remove(removal_range(body, &range)));
                continue;
            }
            match definition(stmt, m) {
                Some(Ok(def)) => {
                    if definitions.iter().any(|d| d.name.eq_ignore_ascii_case(&def.name)) {
                        declined += 1;
                        continue;
                    }
                    edits.push(Edit::remove(removal_range(body, &range)));
                    definitions.push(def);
                }
                Some(Err(())) => declined += 1,
                None => {}
            }
        }

        let defined: HashSet<String> = definitions
            .iter()
            .map(|d| d.name.to_ascii_lowercase())
            .collect();
        let unhash = |text: &str| {
            replace_masked(text, &TEMP_NAME, |caps| {
                let name = caps.get(1);
                defined
                    .contains(&name.to_ascii_lowercase())
                    .then(|| name.to_string())
            })
            .text
        };

        let rest = unhash(&apply_edits(body, edits));
        for def in &mut definitions {
            def.query = unhash(&def.query);
        }

        let mut text = rest.clone();
        if !definitions.is_empty() {
            let rest_masked = lexer::mask(&rest);
            let attach = lexer::split_statements(&rest)
                .into_iter()
                .filter(|r| matches!(leading_word(&rest_masked[r.clone()]).as_str(), "SELECT" | "WITH"))
                .last();
            let Some(attach) = attach else {
                return Rewrite::unapplied(body.to_string());
            };

            let block: Vec<String> = definitions.iter().map(CteDefinition::render).collect();
            let block = block.join(",\n");
            let query = &rest[attach.clone()];
            let joined = if leading_word(&rest_masked[attach.clone()]) == "WITH" {
                let after_with = query.trim_start()[4..].trim_start();
                format!("WITH {block},\n{after_with}")
            } else {
                format!("WITH {block}\n{query}")
            };
            text = apply_edits(&rest, vec![Edit::new(attach, joined)]);
            facts.ctes.extend(definitions.iter().map(|d| d.name.clone()));
        }

        let unresolved = TEMP_NAME.is_match(&lexer::mask(&text));
        Rewrite {
            text,
            applied: declined == 0 && !unresolved,
        }
    }
}
