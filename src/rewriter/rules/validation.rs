use std::sync::LazyLock;

use regex::Regex;

use crate::lexer;
use crate::rewriter::{
    Rewrite, RewriteContext, RewriteFacts, RewriteRule, ValidationGuard, replace_masked,
};
use crate::source::Parameter;

static RAISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:RAISERROR|THROW)\b").expect("raise regex"));

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^@\w])@(\w+)").expect("variable regex"));

static MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'((?:[^']|'')*)'").expect("message regex"));

static BEGIN_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bBEGIN\b").expect("begin regex"));

static ELSE_NEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ELSE\b").expect("else regex"));

static IF_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bIF\b").expect("if regex"));

static STATEMENT_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:BEGIN|SET|SELECT|EXEC|EXECUTE|INSERT|UPDATE|DELETE|MERGE|TRUNCATE|DECLARE|PRINT|RETURN|WHILE)\b",
    )
    .expect("statement word regex")
});

/// Offsets of the matches of `re` in `masked` that sit outside parentheses.
fn at_top_level(re: &Regex, masked: &str) -> Vec<usize> {
    re.find_iter(masked)
        .map(|m| m.start())
        .filter(|&pos| lexer::depth_at(masked, pos) == 0)
        .collect()
}

/// Replaces `IF <cond> BEGIN RAISERROR(…) [RETURN] END` guards on
/// parameters with a call to a validation macro.
pub struct ValidationRule {
    block: Regex,
}

impl ValidationRule {
    pub fn new() -> Self {
        Self {
            block: Regex::new(
                r"(?is)\bIF\s+([^;]+?)\s+BEGIN\s+(RAISERROR\s*\([^;]*?\)|THROW\s+[^;]*?)\s*;?\s*(?:RETURN(?:\s+-?\d+)?\s*;?\s*)?END\b[ \t]*;?[ \t]*\r?\n?",
            )
            .expect("validation block regex"),
        }
    }
}

impl Default for ValidationRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for ValidationRule {
    fn id(&self) -> &'static str {
        "validation-blocks"
    }

    fn is_relevant(&self, body: &str, _ctx: &RewriteContext<'_>) -> bool {
        RAISE.is_match(&lexer::mask(body))
    }

    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, facts: &mut RewriteFacts) -> Rewrite {
        let masked = lexer::mask(body);
        let out = replace_masked(body, &self.block, |caps| {
            let whole = caps.range(0)?;
            let mut condition = caps.range(1)?;
            // Without `;` terminators the match can start at an earlier
            // single-statement IF. The guard starts at the last top-level IF
            // and the text before it is kept.
            let mut prefix_end = whole.start;
            if let Some(&pos) = at_top_level(&IF_WORD, &masked[condition.clone()]).last() {
                prefix_end = condition.start + pos;
                condition.start = prefix_end + 2;
            }
            let prefix = &body[whole.start..prefix_end];
            let masked_condition = &masked[condition.clone()];
            if BEGIN_WORD.is_match(masked_condition)
                || !at_top_level(&STATEMENT_WORD, masked_condition).is_empty()
            {
                return None;
            }
            let condition = body[condition].trim();
            let end = whole.end;
            if ELSE_NEXT.is_match(&masked[end..]) {
                return None;
            }

            let mut params: Vec<&Parameter> = Vec::new();
            for var in VARIABLE.captures_iter(masked_condition) {
                let param = ctx.unit.param(&var[1])?;
                if !params.iter().any(|p| p.name == param.name) {
                    params.push(param);
                }
            }
            let first = params.first()?;

            let base = format!("validate_{}", first.name.to_ascii_lowercase());
            let taken = facts
                .validations
                .iter()
                .filter(|g| g.macro_name == base || g.macro_name.starts_with(&format!("{base}_")))
                .count();
            let macro_name = if taken == 0 {
                base
            } else {
                format!("{base}_{}", taken + 1)
            };

            let args: Vec<String> = params
                .iter()
                .map(|p| match p.jinja_default() {
                    Some(default) => format!("var('{}', {})", p.name, default),
                    None => format!("var('{}')", p.name),
                })
                .collect();
            let message = MESSAGE
                .captures(caps.get(2))
                .map(|m| m[1].replace("''", "'"))
                .unwrap_or_else(|| format!("{macro_name} failed"));

            facts.validations.push(ValidationGuard {
                macro_name: macro_name.clone(),
                params: params.iter().map(|p| p.name.clone()).collect(),
                condition: condition.to_string(),
                message,
            });
            Some(format!("{prefix}{{{{ {}({}) }}}}\n", macro_name, args.join(", ")))
        });

        let applied = out.replaced > 0
            && out.declined == 0
            && !RAISE.is_match(&lexer::mask(&out.text));
        Rewrite {
            text: out.text,
            applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::rules::test_support::run;
    use pretty_assertions::assert_eq;

    fn params() -> Vec<Parameter> {
        vec![
            Parameter::required("user_id", "INT"),
            Parameter::optional("region", "VARCHAR(20)", "NULL"),
        ]
    }

    #[test]
    fn test_role_check_becomes_macro_call() {
        let body = "IF NOT EXISTS (SELECT 1 FROM user_roles WHERE user_id = @user_id AND role_name = 'analyst')\n\
                    BEGIN\n    RAISERROR('User lacks the analyst role', 16, 1);\n    RETURN;\nEND\n\
                    SELECT * FROM orders";
        let (relevant, applied, text, facts) = run(&ValidationRule::new(), "athena", params(), body);
        assert!(relevant && applied);
        assert_eq!(text, "{{ validate_user_id(var('user_id')) }}\nSELECT * FROM orders");
        assert_eq!(facts.validations.len(), 1);
        let guard = &facts.validations[0];
        assert_eq!(guard.message, "User lacks the analyst role");
        assert_eq!(guard.params, vec!["user_id".to_string()]);
        assert!(guard.condition.starts_with("NOT EXISTS"));
    }

    #[test]
    fn test_throw_with_optional_param() {
        let body = "IF @region NOT IN ('EU', 'US') BEGIN THROW 50001, 'Unknown region', 1; END;\nSELECT 1";
        let (_, applied, text, facts) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(applied);
        assert_eq!(text, "{{ validate_region(var('region', none)) }}\nSELECT 1");
        assert_eq!(facts.validations[0].message, "Unknown region");
    }

    #[test]
    fn test_guard_on_local_variable_is_left() {
        let body = "IF @rows = 0 BEGIN RAISERROR('empty', 16, 1) END\nSELECT 1";
        let (relevant, applied, text, facts) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, body);
        assert!(facts.validations.is_empty());
    }

    #[test]
    fn test_raise_outside_guard_is_not_applied() {
        let body = "BEGIN TRY SELECT 1 END TRY BEGIN CATCH THROW; END CATCH";
        let (relevant, applied, _, _) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(relevant);
        assert!(!applied);
    }

    #[test]
    fn test_repeated_guard_names_are_numbered() {
        let body = "IF @user_id IS NULL BEGIN RAISERROR('missing', 16, 1) END\n\
                    IF @user_id < 0 BEGIN RAISERROR('negative', 16, 1) END\nSELECT 1";
        let (_, applied, text, facts) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(applied);
        assert_eq!(
            text,
            "{{ validate_user_id(var('user_id')) }}\n{{ validate_user_id_2(var('user_id')) }}\nSELECT 1"
        );
        assert_eq!(facts.validations.len(), 2);
    }

    #[test]
    fn test_unterminated_statement_before_guard_is_kept() {
        let body = "IF @region IS NULL SET @region = 'EU'\n\
                    IF @user_id < 0 BEGIN RAISERROR('negative', 16, 1) END\n\
                    SELECT * FROM orders WHERE region = @region";
        let (_, applied, text, facts) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(applied);
        assert_eq!(
            text,
            "IF @region IS NULL SET @region = 'EU'\n\
             {{ validate_user_id(var('user_id')) }}\n\
             SELECT * FROM orders WHERE region = @region"
        );
        assert_eq!(facts.validations.len(), 1);
        assert_eq!(facts.validations[0].params, vec!["user_id".to_string()]);
        assert_eq!(facts.validations[0].condition, "@user_id < 0");
    }

    #[test]
    fn test_statement_inside_condition_is_declined() {
        let body = "IF @user_id < 0 SET @user_id = 0 BEGIN RAISERROR('negative', 16, 1) END\nSELECT 1";
        let (relevant, applied, text, facts) = run(&ValidationRule::new(), "glue", params(), body);
        assert!(relevant);
        assert!(!applied);
        assert_eq!(text, body);
        assert!(facts.validations.is_empty());
    }
}
