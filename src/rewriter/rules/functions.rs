use regex::Regex;

use crate::lexer;
use crate::platform::{FunctionCategory, PlatformProfile};
use crate::rewriter::{Edit, Rewrite, RewriteContext, RewriteFacts, RewriteRule, apply_edits};

/// Maps T-SQL built-ins of one category onto the platform's function table.
pub struct FunctionRule {
    id: &'static str,
    category: FunctionCategory,
}

impl FunctionRule {
    pub fn date() -> Self {
        Self {
            id: "date-functions",
            category: FunctionCategory::Date,
        }
    }

    pub fn string() -> Self {
        Self {
            id: "string-functions",
            category: FunctionCategory::String,
        }
    }

    /// `NAME (` for every function the platform does not accept natively.
    fn call_regex(&self, profile: &PlatformProfile) -> Option<Regex> {
        let names = profile.rewritten_functions(self.category);
        if names.is_empty() {
            return None;
        }
        Regex::new(&format!(r"(?i)\b({})\s*\(", names.join("|"))).ok()
    }
}

impl RewriteRule for FunctionRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn is_relevant(&self, body: &str, ctx: &RewriteContext<'_>) -> bool {
        self.call_regex(ctx.profile)
            .is_some_and(|re| re.is_match(&lexer::mask(body)))
    }

    fn rewrite(&self, body: &str, ctx: &RewriteContext<'_>, _facts: &mut RewriteFacts) -> Rewrite {
        let Some(re) = self.call_regex(ctx.profile) else {
            return Rewrite::unapplied(body.to_string());
        };

        let calls: Vec<(usize, usize, String)> = re
            .captures_iter(&lexer::mask(body))
            .filter_map(|c| {
                let whole = c.get(0)?;
                Some((whole.start(), whole.end() - 1, c[1].to_string()))
            })
            .collect();

        // Innermost calls sit to the right of their enclosing call, so
        // walking backwards rewrites arguments before the call using them.
        let mut text = body.to_string();
        let mut declined = 0;
        for (start, open, name) in calls.into_iter().rev() {
            let masked = lexer::mask(&text);
            let rendered = lexer::matching_paren(&masked, open).and_then(|close| {
                let args = lexer::split_top_level(&text[open + 1..close]);
                let mapping = ctx.profile.function(&name, self.category)?;
                mapping.render(&args).map(|r| (close, r))
            });
            match rendered {
                Some((close, replacement)) => {
                    text = apply_edits(&text, vec![Edit::new(start..close + 1, replacement)]);
                }
                None => declined += 1,
            }
        }

        Rewrite {
            text,
            applied: declined == 0,
        }
    }
}
