use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::classifier::{DmlKind, normalize_table, statement_dml};
use crate::emitter::{alias_span, output_name, projection_span};
use crate::lexer;
use crate::rewriter::{
    Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits, removal_range,
};

static TRUNCATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^TRUNCATE\s+TABLE\s+([\w.\[\]]+)").expect("truncate regex")
});

static INSERT_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^INSERT\s+(?:INTO\s+)?([\w.\[\]]+)\s*(?:\(([^()]*)\))?\s*")
        .expect("insert head regex")
});

static LEADING_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z]+)").expect("leading word regex"));

static KEY_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\w+\.\[?(\w+)\]?\s*=\s*\w+\.\[?(\w+)\]?").expect("key pair regex")
});

static PARAM_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\b\w+\.)?\[?(\w+)\]?\s*=\s*@\w+").expect("param key regex")
});

static FROM_OR_WHERE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:FROM|WHERE)\b").expect("from regex"));

/// What to do with one statement that writes a persistent table.
#[derive(Debug)]
enum Action {
    /// `TRUNCATE`, `DELETE` or `UPDATE`: dropped when it writes the target,
    /// since the model replaces it.
    Remove { target: String, keys: Vec<String> },
    /// `INSERT … SELECT`: keep the query, named after the column list.
    Produce { target: String, query: String },
    /// A write the rule cannot reduce.
    Decline,
}

/// Reduces writes to the procedure's persistent target table to the query
/// that produces its rows. Staging writes are left to `temp-tables`.
pub struct TargetDmlRule;

impl TargetDmlRule {
    pub fn new() -> Self {
        Self
    }

    fn plan(&self, body: &str) -> Vec<(Range<usize>, Action)> {
        let masked = lexer::mask(body);
        let mut plan = Vec::new();
        for range in lexer::split_statements(body) {
            let m = &masked[range.clone()];
            let stmt = &body[range.clone()];

            if let Some(c) = TRUNCATE.captures(m) {
                let target = normalize_table(&c[1]);
                plan.push((range, Action::Remove { target, keys: Vec::new() }));
                continue;
            }

            let dml = statement_dml(m);
            let Some(first) = dml.iter().find(|d| !d.is_staging()) else {
                continue;
            };
            if first.kind == DmlKind::Merge {
                continue;
            }

            let leading = LEADING_WORD
                .captures(m)
                .map(|c| c[1].to_ascii_uppercase())
                .unwrap_or_default();
            let action = match (leading.as_str(), first.kind) {
                ("DELETE", DmlKind::Delete) | ("UPDATE", DmlKind::Update) => Action::Remove {
                    target: first.target.clone(),
                    keys: key_columns(m, first.kind),
                },
                ("INSERT", DmlKind::Insert) => match INSERT_HEAD.captures(m) {
                    Some(c) => {
                        let head_end = c.get(0).map(|g| g.end()).unwrap_or(0);
                        let query = &stmt[head_end..];
                        if starts_query(&m[head_end..]) {
                            let columns: Vec<String> = c
                                .get(2)
                                .map(|list| {
                                    lexer::split_top_level(&stmt[list.range()])
                                        .into_iter()
                                        .map(lexer::unbracket)
                                        .collect()
                                })
                                .unwrap_or_default();
                            Action::Produce {
                                target: first.target.clone(),
                                query: name_projection(query.trim(), &columns),
                            }
                        } else {
                            Action::Decline
                        }
                    }
                    None => Action::Decline,
                },
                _ => Action::Decline,
            };
            plan.push((range, action));
        }
        plan
    }
}

impl Default for TargetDmlRule {
    fn default() -> Self {
        Self::new()
    }
}

/// Name the projection after the INSERT column list, which is positional.
/// Left alone when the lengths differ or the projection uses `*`.
fn name_projection(query: &str, columns: &[String]) -> String {
    if columns.is_empty() || starts_with_with(query) {
        return query.to_string();
    }
    let Some(span) = projection_span(query) else {
        return query.to_string();
    };
    let projection = &query[span.clone()];
    let items = lexer::top_level_ranges(projection);
    if items.len() != columns.len() || items.iter().any(|r| projection[r.clone()].ends_with('*')) {
        return query.to_string();
    }

    let mut edits = Vec::new();
    for (range, column) in items.into_iter().zip(columns) {
        let item = &projection[range.clone()];
        let start = span.start + range.start;
        match alias_span(item) {
            Some(alias) if item[alias.clone()].eq_ignore_ascii_case(column) => {}
            Some(alias) => edits.push(Edit::new(start + alias.start..start + alias.end, column.clone())),
            None if output_name(item).is_some_and(|n| n.eq_ignore_ascii_case(column)) => {}
            None => {
                let end = start + item.len();
                edits.push(Edit::new(end..end, format!(" AS {column}")));
            }
        }
    }
    apply_edits(query, edits)
}

fn starts_query(masked: &str) -> bool {
    LEADING_WORD
        .captures(masked)
        .is_some_and(|c| matches!(c[1].to_ascii_uppercase().as_str(), "SELECT" | "WITH"))
}

/// Merge key candidates: equal column names joined across aliases, or
/// columns compared to a parameter in a `DELETE`.
fn key_columns(masked_stmt: &str, kind: DmlKind) -> Vec<String> {
    let Some(clause) = FROM_OR_WHERE.find(masked_stmt) else {
        return Vec::new();
    };
    let tail = &masked_stmt[clause.start()..];
    let mut keys: Vec<String> = KEY_PAIR
        .captures_iter(tail)
        .filter(|c| c[1].eq_ignore_ascii_case(&c[2]))
        .map(|c| c[1].to_string())
        .collect();
    if keys.is_empty() && kind == DmlKind::Delete {
        keys = PARAM_KEY
            .captures_iter(tail)
            .map(|c| c[1].to_string())
            .collect();
    }
    keys
}

impl RewriteRule for TargetDmlRule {
    fn id(&self) -> &'static str {
        "target-dml"
    }

    fn is_relevant(&self, body: &str, _ctx: &RewriteContext<'_>) -> bool {
        !self.plan(body).is_empty()
    }

    fn rewrite(&self, body: &str, _ctx: &RewriteContext<'_>, facts: &mut RewriteFacts) -> Rewrite {
        let masked = lexer::mask(body);
        let plan = self.plan(body);
        let mut edits = Vec::new();
        let mut declined = 0;
        let mut removed = Vec::new();
        let mut produced: Vec<(Range<usize>, String)> = Vec::new();
        let mut keys = Vec::new();

        // The first producing INSERT names the target; without one, the first
        // removed table does. Writes to any other table stay in the body.
        let target = plan
            .iter()
            .find_map(|(_, a)| match a {
                Action::Produce { target, .. } => Some(target.clone()),
                _ => None,
            })
            .or_else(|| {
                plan.iter().find_map(|(_, a)| match a {
                    Action::Remove { target, .. } => Some(target.clone()),
                    _ => None,
                })
            });
        let is_target = |t: &str| target.as_deref() == Some(t);

        for (range, action) in plan {
            match action {
                Action::Remove { target, keys: found } if is_target(&target) => {
                    keys.extend(found);
                    removed.push(range.clone());
                    edits.push(Edit::remove(removal_range(body, &range)));
                }
                Action::Produce { target, query } if is_target(&target) => {
                    let unionable = produced.is_empty()
                        || (!starts_with_with(&query)
                            && !produced.iter().any(|(_, q)| starts_with_with(q)));
                    if unionable {
                        produced.push((range, query));
                    } else {
                        declined += 1;
                    }
                }
                Action::Remove { .. } | Action::Produce { .. } | Action::Decline => declined += 1,
            }
        }

        let has_query = !produced.is_empty()
            || lexer::split_statements(body)
                .into_iter()
                .filter(|r| !removed.contains(r))
                .any(|r| starts_query(&masked[r]));
        if !has_query || (edits.is_empty() && produced.is_empty()) {
            return Rewrite::unapplied(body.to_string());
        }

        if let Some(((first, query), rest)) = produced.split_first() {
            let mut combined = query.clone();
            for (range, query) in rest {
                combined.push_str("\nUNION ALL\n");
                combined.push_str(query);
                edits.push(Edit::remove(removal_range(body, range)));
            }
            edits.push(Edit::new(first.clone(), combined));
        }

        if let Some(target) = target {
            facts.target_table.get_or_insert(target);
        }
        for key in &keys {
            facts.add_unique_key(key);
        }
        Rewrite {
            text: apply_edits(body, edits),
            applied: declined == 0,
        }
    }
}

fn starts_with_with(query: &str) -> bool {
    LEADING_WORD
        .captures(&lexer::mask(query))
        .is_some_and(|c| c[1].eq_ignore_ascii_case("WITH"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::rules::test_support::run;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truncate_insert_keeps_select() {
        let body = "TRUNCATE TABLE dbo.sales_summary;\n\
                    INSERT INTO dbo.sales_summary (region, total)\n\
                    SELECT region, SUM(amount) FROM orders GROUP BY region;";
        let (relevant, applied, text, facts) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(relevant && applied);
        assert_eq!(text, "SELECT region, SUM(amount) AS total FROM orders GROUP BY region;");
        assert_eq!(facts.target_table.as_deref(), Some("sales_summary"));
    }

    #[test]
    fn test_projection_takes_insert_column_names() {
        let body = "INSERT INTO dbo.order_totals (order_id, [total], loaded_at)\n\
                    SELECT o.order_id, o.amount AS amt, GETDATE() FROM orders o;";
        let (_, applied, text, _) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT o.order_id, o.amount AS total, GETDATE() AS loaded_at FROM orders o;"
        );
    }

    #[test]
    fn test_projection_left_alone_when_lists_differ() {
        let body = "INSERT INTO order_totals (order_id, total) SELECT * FROM staging_totals;";
        let (_, applied, text, _) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(applied);
        assert_eq!(text, "SELECT * FROM staging_totals;");
    }

    #[test]
    fn test_write_to_another_table_is_kept() {
        let body = "INSERT INTO dbo.sales_fact (order_id, amount) SELECT order_id, amount FROM orders;\n\
                    UPDATE dbo.etl_control SET last_run = GETDATE() WHERE job_name = 'sales';";
        let (relevant, applied, text, facts) = run(&TargetDmlRule::new(), "athena", vec![], body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(
            text,
            "SELECT order_id, amount FROM orders;\n\
             UPDATE dbo.etl_control SET last_run = GETDATE() WHERE job_name = 'sales';"
        );
        assert_eq!(facts.target_table.as_deref(), Some("sales_fact"));
        assert!(facts.unique_key.is_empty());
    }

    #[test]
    fn test_delete_of_another_table_is_kept() {
        let body = "DELETE FROM daily_sales WHERE sale_date = @run_date;\n\
                    DELETE FROM load_errors WHERE run_date = @run_date;\n\
                    INSERT INTO daily_sales SELECT @run_date AS sale_date, SUM(amount) AS total FROM orders;";
        let (_, applied, text, facts) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(!applied);
        assert_eq!(
            text,
            "DELETE FROM load_errors WHERE run_date = @run_date;\n\
             SELECT @run_date AS sale_date, SUM(amount) AS total FROM orders;"
        );
        assert_eq!(facts.unique_key, vec!["sale_date".to_string()]);
    }

    #[test]
    fn test_delete_insert_infers_key() {
        let body = "DELETE FROM daily_sales WHERE sale_date = @run_date;\n\
                    INSERT INTO daily_sales SELECT @run_date AS sale_date, SUM(amount) AS total FROM orders;";
        let (_, applied, text, facts) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT @run_date AS sale_date, SUM(amount) AS total FROM orders;"
        );
        assert_eq!(facts.unique_key, vec!["sale_date".to_string()]);
    }

    #[test]
    fn test_update_join_key_and_union_of_inserts() {
        let body = "UPDATE t SET t.total = s.total FROM customers t JOIN staging s ON t.customer_id = s.customer_id;\n\
                    INSERT INTO customers (customer_id, total) SELECT customer_id, total FROM staging;\n\
                    INSERT INTO customers (customer_id, total) SELECT customer_id, 0 FROM prospects;";
        let (_, applied, text, facts) = run(&TargetDmlRule::new(), "redshift", vec![], body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT customer_id, total FROM staging\nUNION ALL\nSELECT customer_id, 0 AS total FROM prospects;\n"
        );
        assert_eq!(facts.unique_key, vec!["customer_id".to_string()]);
        assert_eq!(facts.target_table.as_deref(), Some("customers"));
    }

    #[test]
    fn test_insert_values_is_left() {
        let body = "INSERT INTO audit_log (msg) VALUES ('done');\nSELECT * FROM orders;";
        let (relevant, applied, text, _) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, body);
    }

    #[test]
    fn test_update_only_has_no_producing_query() {
        let body = "UPDATE orders SET status = 'late' WHERE due_date < GETDATE();";
        let (relevant, applied, text, _) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, body);
    }

    #[test]
    fn test_staging_writes_are_not_relevant() {
        let body = "INSERT INTO #stage SELECT * FROM orders;\nSELECT * FROM #stage;";
        let (relevant, _, _, _) = run(&TargetDmlRule::new(), "glue", vec![], body);
        assert!(!relevant);
    }
}
