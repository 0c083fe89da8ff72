use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use crate::lexer;
use crate::rewriter::{
    Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits, param_reference,
};
use crate::source::Parameter;

static PAREN_PREDICATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(AND|WHERE)\s*\(").expect("paren predicate regex"));

static OR_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bOR\b").expect("or regex"));

/// Whether a masked expression has an `OR` outside parentheses, so it needs
/// its own parentheses after `AND`.
fn has_top_level_or(masked: &str) -> bool {
    OR_WORD
        .find_iter(masked)
        .any(|m| lexer::depth_at(masked, m.start()) == 0)
}

/// Parameters of one kind that `body` references outside comments and strings.
fn referenced<'a>(body: &str, params: &'a [Parameter], required: bool) -> Vec<&'a Parameter> {
    let masked = lexer::mask(body);
    params
        .iter()
        .filter(|p| p.is_required() == required)
        .filter(|p| param_reference(&p.name).is_match(&masked))
        .collect()
}

/// Statements that assign to `@name`; references inside them are left alone.
fn assignment_ranges(body: &str, masked: &str, name: &str) -> Vec<Range<usize>> {
    let assign = Regex::new(&format!(
        r"(?i)\b(?:SET|SELECT)\s+@{}\s*=",
        regex::escape(name)
    ))
    .expect("escaped assignment regex");
    lexer::split_statements(body)
        .into_iter()
        .filter(|r| assign.is_match(&masked[r.clone()]))
        .collect()
}

/// Replace references to `@name` with `marker`, skipping `skip` ranges.
fn substitute(text: &str, name: &str, marker: &str, skip: &[Range<usize>]) -> String {
    let masked = lexer::mask(text);
    let edits = param_reference(name)
        .captures_iter(&masked)
        .filter_map(|c| c.get(1))
        .filter(|m| !skip.iter().any(|r| r.contains(&m.start())))
        .map(|m| Edit::new(m.range(), marker))
        .collect();
    apply_edits(text, edits)
}

/// Wrap a predicate so it only applies when the parameter has a value.
fn guarded(keyword: &str, predicate: &str, open: &str, close: &str) -> String {
    if keyword.eq_ignore_ascii_case("WHERE") {
        format!("WHERE 1 = 1\n  {open}AND {predicate}{close}")
    } else {
        format!("{open}AND {predicate}{close}")
    }
}

/// Turns `(@p IS NULL OR <expr>)` and `AND <col> <op> @p` filters on
/// parameters with a default into conditional template blocks.
pub struct OptionalParamRule;

impl OptionalParamRule {
    /// Rewrite the filters on one parameter; returns the text and block count.
    fn guard_filters(text: &str, param: &Parameter, ctx: &RewriteContext<'_>) -> (String, usize) {
        let default = param.jinja_default().unwrap_or_else(|| "none".to_string());
        let value = ctx.profile.var_with_default(&param.name, &default);
        let open = ctx.profile.guard_open(&param.name, &default);
        let close = ctx.profile.guard_close_marker;
        let name = regex::escape(&param.name);
        let mut blocks = 0;

        // (@p IS NULL OR expr) and (expr OR @p IS NULL)
        let null_first = Regex::new(&format!(r"(?is)^\s*@{name}\s+IS\s+NULL\s+OR\s+(.+?)\s*$"))
            .expect("escaped null check regex");
        let null_last = Regex::new(&format!(r"(?is)^\s*(.+?)\s+OR\s+@{name}\s+IS\s+NULL\s*$"))
            .expect("escaped null check regex");
        let masked = lexer::mask(text);
        let mut edits = Vec::new();
        for c in PAREN_PREDICATE.captures_iter(&masked) {
            let (Some(whole), Some(keyword)) = (c.get(0), c.get(1)) else {
                continue;
            };
            let open_paren = whole.end() - 1;
            let Some(close_paren) = lexer::matching_paren(&masked, open_paren) else {
                continue;
            };
            let inner = open_paren + 1..close_paren;
            let expr = null_first
                .captures(&masked[inner.clone()])
                .or_else(|| null_last.captures(&masked[inner.clone()]))
                .and_then(|e| e.get(1));
            let Some(expr) = expr else { continue };
            let expr_range = inner.start + expr.start()..inner.start + expr.end();
            let predicate = substitute(&text[expr_range.clone()], &param.name, &value, &[]);
            let predicate = if has_top_level_or(&masked[expr_range]) {
                format!("({predicate})")
            } else {
                predicate
            };
            edits.push(Edit::new(
                whole.start()..close_paren + 1,
                guarded(keyword.as_str(), &predicate, &open, close),
            ));
        }
        blocks += edits.len();
        let text = apply_edits(text, edits);

        // AND col <op> @p
        let comparison = Regex::new(&format!(
            r"(?i)\b(AND|WHERE)\s+([\w.\[\]]+\s*(?:=|<>|!=|>=|<=|>|<|\bLIKE\b|\bIN\b)\s*(?:\(\s*@{name}\s*\)|@{name}\b))"
        ))
        .expect("escaped comparison regex");
        let masked = lexer::mask(&text);
        let edits: Vec<Edit> = comparison
            .captures_iter(&masked)
            .filter_map(|c| {
                let whole = c.get(0)?;
                let keyword = c.get(1)?.as_str();
                let predicate = &text[c.get(2)?.range()];
                let predicate = substitute(predicate, &param.name, &value, &[]);
                Some(Edit::new(whole.range(), guarded(keyword, &predicate, &open, close)))
            })
            .collect();
        blocks += edits.len();
        (apply_edits(&text, edits), blocks)
    }
}

impl RewriteRule for OptionalParamRule {
    fn id(&self) -> &'static str {
        "optional-params"
    }

    fn is_relevant(&self, body: &str, ctx: &RewriteContext<'_>) -> bool {
        !referenced(body, &ctx.unit.params, false).is_empty()
    }

    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, _facts: &mut RewriteFacts) -> Rewrite {
        let mut text = body.to_string();
        let mut applied = true;
        for param in referenced(body, &ctx.unit.params, false) {
            let skip = assignment_ranges(&text, &lexer::mask(&text), &param.name);
            let blocks = if skip.is_empty() {
                let (guarded, blocks) = Self::guard_filters(&text, param, ctx);
                text = guarded;
                blocks
            } else {
                0
            };
            applied &= blocks > 0;

            let default = param.jinja_default().unwrap_or_else(|| "none".to_string());
            let marker = ctx.profile.var_with_default(&param.name, &default);
            let skip = assignment_ranges(&text, &lexer::mask(&text), &param.name);
            text = substitute(&text, &param.name, &marker, &skip);
        }
        Rewrite { text, applied }
    }
}

/// Replaces references to parameters without a default with a required
/// variable marker.
pub struct RequiredParamRule;

impl RewriteRule for RequiredParamRule {
    fn id(&self) -> &'static str {
        "required-params"
    }

    fn is_relevant(&self, body: &str, ctx: &RewriteContext<'_>) -> bool {
        !referenced(body, &ctx.unit.params, true).is_empty()
    }

    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, _facts: &mut RewriteFacts) -> Rewrite {
        let mut text = body.to_string();
        let mut applied = true;
        for param in referenced(body, &ctx.unit.params, true) {
            let skip = assignment_ranges(&text, &lexer::mask(&text), &param.name);
            applied &= skip.is_empty();
            text = substitute(&text, &param.name, &ctx.profile.var(&param.name), &skip);
        }
        Rewrite { text, applied }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::rules::test_support::run;
    use pretty_assertions::assert_eq;

    fn params() -> Vec<Parameter> {
        vec![
            Parameter::required("start_date", "DATE"),
            Parameter::optional("region", "VARCHAR(50)", "NULL"),
            Parameter::optional("min_amount", "DECIMAL(10,2)", "100"),
        ]
    }

    #[test]
    fn test_null_or_filter_becomes_conditional_block() {
        let body = "SELECT * FROM sales s WHERE s.amount > 0 AND (@region IS NULL OR s.region = @region)";
        let (relevant, applied, text, _) = run(&OptionalParamRule, "redshift", params(), body);
        assert!(relevant && applied);
        assert_eq!(
            text,
            "SELECT * FROM sales s WHERE s.amount > 0 \
             {% if var('region', none) is not none %}AND s.region = {{ var('region', none) }}{% endif %}"
        );
    }

    #[test]
    fn test_filter_with_alternatives_keeps_its_parentheses() {
        let body = "SELECT * FROM orders WHERE status = 'open' \
                    AND (@region IS NULL OR ship_region = @region OR bill_region = @region)";
        let (_, applied, text, _) = run(&OptionalParamRule, "redshift", params(), body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT * FROM orders WHERE status = 'open' \
             {% if var('region', none) is not none %}\
             AND (ship_region = {{ var('region', none) }} OR bill_region = {{ var('region', none) }})\
             {% endif %}"
        );
    }

    #[test]
    fn test_leading_where_filter() {
        let body = "SELECT * FROM sales s\nWHERE (s.region = @region OR @region IS NULL)\n  AND s.amount > 0";
        let (_, applied, text, _) = run(&OptionalParamRule, "glue", params(), body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT * FROM sales s\nWHERE 1 = 1\n  \
             {% if var('region', none) is not none %}AND s.region = {{ var('region', none) }}{% endif %}\n  AND s.amount > 0"
        );
    }

    #[test]
    fn test_comparison_with_numeric_default() {
        let body = "SELECT * FROM sales WHERE region = 'EU' AND amount >= @min_amount";
        let (_, applied, text, _) = run(&OptionalParamRule, "athena", params(), body);
        assert!(applied);
        assert_eq!(
            text,
            "SELECT * FROM sales WHERE region = 'EU' \
             {% if var('min_amount', 100) is not none %}AND amount >= {{ var('min_amount', 100) }}{% endif %}"
        );
    }

    #[test]
    fn test_optional_param_outside_filter_is_not_applied() {
        let body = "SELECT @region AS requested_region, id FROM sales";
        let (relevant, applied, text, _) = run(&OptionalParamRule, "glue", params(), body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, "SELECT {{ var('region', none) }} AS requested_region, id FROM sales");
    }

    #[test]
    fn test_required_param_substitution() {
        let body = "SELECT * FROM sales WHERE sale_date >= @start_date AND @@ROWCOUNT > 0 -- @start_date";
        let (relevant, applied, text, _) = run(&RequiredParamRule, "glue", params(), body);
        assert!(relevant && applied);
        assert_eq!(
            text,
            "SELECT * FROM sales WHERE sale_date >= {{ var('start_date') }} AND @@ROWCOUNT > 0 -- @start_date"
        );
    }

    #[test]
    fn test_assigned_param_is_left() {
        let body = "SET @start_date = ISNULL(@start_date, GETDATE());\nSELECT * FROM t WHERE d >= @start_date";
        let (_, applied, text, _) = run(&RequiredParamRule, "glue", params(), body);
        assert!(!applied);
        assert_eq!(
            text,
            "SET @start_date = ISNULL(@start_date, GETDATE());\nSELECT * FROM t WHERE d >= {{ var('start_date') }}"
        );
    }

    #[test]
    fn test_unreferenced_params_are_not_relevant() {
        let (relevant, _, _, _) = run(&RequiredParamRule, "glue", params(), "SELECT 1");
        assert!(!relevant);
    }
}
