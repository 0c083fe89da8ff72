use regex::Regex;

use crate::lexer;
use crate::rewriter::{Rewrite, RewriteContext, RewriteFacts, RewriteRule, replace_masked};

/// Removes session settings, transaction control, batch separators and
/// locking hints. None of them mean anything in a model.
pub struct PragmaRule {
    patterns: Vec<Regex>,
}

impl PragmaRule {
    pub fn new() -> Self {
        let sources = [
            r"(?im)^[ \t]*SET[ \t]+(?:NOCOUNT|ANSI_NULLS|ANSI_WARNINGS|ANSI_PADDING|QUOTED_IDENTIFIER|XACT_ABORT|ARITHABORT|CONCAT_NULL_YIELDS_NULL)[ \t]+(?:ON|OFF)[ \t]*;?[ \t]*\r?\n?",
            r"(?im)^[ \t]*SET[ \t]+TRANSACTION[ \t]+ISOLATION[ \t]+LEVEL[ \t]+(?:READ[ \t]+UNCOMMITTED|READ[ \t]+COMMITTED|REPEATABLE[ \t]+READ|SNAPSHOT|SERIALIZABLE)[ \t]*;?[ \t]*\r?\n?",
            r"(?im)^[ \t]*(?:BEGIN[ \t]+TRAN(?:SACTION)?|COMMIT(?:[ \t]+TRAN(?:SACTION)?)?|ROLLBACK(?:[ \t]+TRAN(?:SACTION)?)?)\b[ \t]*;?[ \t]*\r?\n?",
            r"(?im)^[ \t]*GO[ \t]*(?:\r?\n|\z)",
            r"(?i)[ \t]*\bWITH[ \t]*\([ \t]*(?:NOLOCK|READUNCOMMITTED|ROWLOCK|UPDLOCK|HOLDLOCK|TABLOCK|NOWAIT)(?:[ \t]*,[ \t]*\w+)*[ \t]*\)",
            r"(?i)[ \t]*\([ \t]*NOLOCK[ \t]*\)",
            r"(?i)\s*\bOPTION[ \t]*\([ \t]*(?:RECOMPILE|MAXDOP[ \t]+\d+|OPTIMIZE[ \t]+FOR[ \t]+UNKNOWN)[ \t]*\)",
        ];
        Self {
            patterns: sources
                .iter()
                .map(|s| Regex::new(s).expect("pragma regex"))
                .collect(),
        }
    }
}

impl Default for PragmaRule {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for PragmaRule {
    fn id(&self) -> &'static str {
        "strip-pragmas"
    }

    fn is_relevant(&self, body: &str, _ctx: &RewriteContext<'_>) -> bool {
        let masked = lexer::mask(body);
        self.patterns.iter().any(|re| re.is_match(&masked))
    }

    fn rewrite(&self, body: &str, _ctx: &RewriteContext<'_>, _facts: &mut RewriteFacts) -> Rewrite {
        let mut text = body.to_string();
        for re in &self.patterns {
            text = replace_masked(&text, re, |_| Some(String::new())).text;
        }
        Rewrite::applied(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::rules::test_support::run;

    #[test]
    fn test_strips_session_settings() {
        let body = "SET NOCOUNT ON;\nSET XACT_ABORT ON;\nBEGIN TRANSACTION;\nSELECT id FROM orders WITH (NOLOCK)\nOPTION (RECOMPILE);\nCOMMIT;\n";
        let (relevant, applied, text, _) = run(&PragmaRule::new(), "glue", vec![], body);
        assert!(relevant && applied);
        assert_eq!(text, "SELECT id FROM orders;\n");
    }

    #[test]
    fn test_leaves_settings_in_strings_and_comments() {
        let body = "SELECT 'SET NOCOUNT ON' AS s -- COMMIT\nFROM t";
        let (relevant, _, text, _) = run(&PragmaRule::new(), "glue", vec![], body);
        assert!(!relevant);
        assert_eq!(text, body);
    }

    #[test]
    fn test_keeps_begin_try() {
        let body = "BEGIN TRY\nSELECT 1\nEND TRY";
        let (relevant, _, _, _) = run(&PragmaRule::new(), "glue", vec![], body);
        assert!(!relevant);
    }
}
