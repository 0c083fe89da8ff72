use std::sync::LazyLock;

use regex::Regex;

use crate::classifier::{ConversionPattern, normalize_table};
use crate::lexer;
use crate::rewriter::{Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits};

static MERGE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bMERGE\b").expect("merge regex"));

static KEY_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\w+\.\[?(\w+)\]?\s*=\s*\w+\.\[?(\w+)\]?").expect("key pair regex")
});

/// Reduces a `MERGE` statement to the query feeding its `USING` clause.
///
/// The merge itself becomes the model's incremental strategy; the `ON`
/// predicate supplies the unique key.
pub struct MergeSourceRule {
    head: Regex,
    on: Regex,
    when: Regex,
    source_table: Regex,
}

impl MergeSourceRule {
    pub fn new() -> Self {
        Self {
            head: Regex::new(
                r"(?is)^MERGE\s+(?:TOP\s*\(\s*\d+\s*\)\s+)?(?:INTO\s+)?([#@]?[\w.\[\]]+)(?:\s+(?:AS\s+)?(\w+))?\s+USING\s+",
            )
            .expect("merge head regex"),
            on: Regex::new(r"(?i)\bON\b").expect("on regex"),
            when: Regex::new(r"(?i)\bWHEN\b").expect("when regex"),
            source_table: Regex::new(r"^[\w.\[\]]+").expect("source table regex"),
        }
    }

    /// The producing query and unique key columns for one statement.
    fn reduce(&self, stmt: &str, masked: &str) -> Option<(String, String, Vec<String>)> {
        let head = self.head.captures(masked)?;
        let target = normalize_table(&stmt[head.get(1)?.range()]);

        let mut pos = head.get(0)?.end();
        let query = if masked[pos..].starts_with('(') {
            let close = lexer::matching_paren(masked, pos)?;
            let inner = stmt[pos + 1..close].trim().to_string();
            pos = close + 1;
            inner
        } else {
            let name = self.source_table.find(&masked[pos..])?;
            let table = &stmt[pos..pos + name.end()];
            pos += name.end();
            format!("SELECT * FROM {table}")
        };

        let on = self.on.find_at(masked, pos)?;
        let when = self.when.find_at(masked, on.end())?;
        let keys = KEY_PAIR
            .captures_iter(&masked[on.end()..when.start()])
            .filter(|c| c[1].eq_ignore_ascii_case(&c[2]))
            .map(|c| c[1].to_string())
            .collect();

        Some((target, query, keys))
    }
}

impl Default for MergeSourceRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for MergeSourceRule {
    fn id(&self) -> &'static str {
        "merge-source"
    }

    fn applies_to(&self, pattern: ConversionPattern) -> bool {
        matches!(
            pattern,
            ConversionPattern::UpsertMerge
                | ConversionPattern::HistoryUpsert
                | ConversionPattern::MultiDmlUpsert
        )
    }

    fn is_relevant(&self, body: &str, _ctx: &RewriteContext<'_>) -> bool {
        MERGE_WORD.is_match(&lexer::mask(body))
    }

    fn rewrite(&self, body: &str, _ctx: &RewriteContext<'_>, facts: &mut RewriteFacts) -> Rewrite {
        let masked = lexer::mask(body);
        let mut edits = Vec::new();
        let mut declined = 0;

        for range in lexer::split_statements(body) {
            let stmt_masked = &masked[range.clone()];
            if !MERGE_WORD.is_match(stmt_masked) {
                continue;
            }
            match self.reduce(&body[range.clone()], stmt_masked) {
                Some((target, query, keys)) => {
                    facts.target_table.get_or_insert(target);
                    for key in &keys {
                        facts.add_unique_key(key);
                    }
                    edits.push(Edit::new(range, query));
                }
                None => declined += 1,
            }
        }

        let applied = !edits.is_empty() && declined == 0;
        Rewrite {
            text: apply_edits(body, edits),
            applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::rules::test_support::run;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_with_subquery_source() {
        let body = "MERGE INTO dbo.customers AS t\n\
                    USING (SELECT customer_id, email FROM staging_customers) AS s\n\
                    ON t.customer_id = s.customer_id\n\
                    WHEN MATCHED THEN UPDATE SET email = s.email\n\
                    WHEN NOT MATCHED THEN INSERT (customer_id, email) VALUES (s.customer_id, s.email);";
        let (relevant, applied, text, facts) = run(&MergeSourceRule::new(), "glue", vec![], body);
        assert!(relevant && applied);
        assert_eq!(text, "SELECT customer_id, email FROM staging_customers;");
        assert_eq!(facts.target_table.as_deref(), Some("customers"));
        assert_eq!(facts.unique_key, vec!["customer_id".to_string()]);
    }

    #[test]
    fn test_merge_with_table_source_and_composite_key() {
        let body = "MERGE inventory t USING stock_feed s\n\
                    ON t.sku = s.sku AND t.warehouse_id = s.warehouse_id\n\
                    WHEN MATCHED THEN UPDATE SET qty = s.qty;";
        let (_, applied, text, facts) = run(&MergeSourceRule::new(), "athena", vec![], body);
        assert!(applied);
        assert_eq!(text, "SELECT * FROM stock_feed;");
        assert_eq!(facts.unique_key, vec!["sku".to_string(), "warehouse_id".to_string()]);
    }

    #[test]
    fn test_merge_without_when_is_left() {
        let body = "MERGE INTO customers AS t USING staging AS s ON t.id = s.id;";
        let (relevant, applied, text, _) = run(&MergeSourceRule::new(), "glue", vec![], body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, body);
    }

    #[test]
    fn test_only_for_merge_patterns() {
        let rule = MergeSourceRule::new();
        assert!(rule.applies_to(ConversionPattern::UpsertMerge));
        assert!(!rule.applies_to(ConversionPattern::FullLoad));
        assert!(!rule.applies_to(ConversionPattern::SnapshotAppend));
    }
}
