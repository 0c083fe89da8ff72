//! Marks lines still holding procedural constructs no rule could rewrite.

use std::sync::LazyLock;

use regex::Regex;

use crate::lexer;

/// Prefix of every manual-review marker line.
pub const MANUAL_MARKER: &str = "-- MANUAL:";

struct Residual {
    label: &'static str,
    pattern: Regex,
}

fn residual(label: &'static str, pattern: &str) -> Residual {
    Residual {
        label,
        pattern: Regex::new(pattern).expect("residual regex"),
    }
}

static RESIDUALS: LazyLock<Vec<Residual>> = LazyLock::new(|| {
    vec![
        residual("variable reference", r"@@?\w+"),
        residual("temp table", r"#+\w+"),
        residual("variable declaration", r"(?i)\bDECLARE\b"),
        residual("procedure call", r"(?i)\b(?:EXEC|EXECUTE|sp_executesql)\b"),
        residual("cursor", r"(?i)\bCURSOR\b|\bFETCH\s+NEXT\b"),
        residual("loop", r"(?i)\bWHILE\b"),
        residual("conditional branch", r"(?i)^\s*(?:IF|ELSE)\b"),
        residual("error raising", r"(?i)\b(?:RAISERROR|THROW)\b"),
        residual("error handling", r"(?i)\b(?:BEGIN|END)\s+(?:TRY|CATCH)\b"),
        residual("procedural block", r"(?i)^\s*(?:BEGIN|END)\s*;?\s*$"),
        residual("print", r"(?i)\bPRINT\b"),
        residual("row limit", r"(?i)\bTOP\s*\(?\s*\d+"),
        residual("merge statement", r"(?i)\bMERGE\b"),
        residual("table write", r"(?i)^\s*(?:INSERT|UPDATE|DELETE|TRUNCATE)\b"),
        residual("output clause", r"(?i)\bOUTPUT\s+(?:INSERTED|DELETED)\b"),
    ]
});

/// Insert a `-- MANUAL: <construct>` line above every line that still
/// holds an unconverted construct. Already-marked lines are skipped, so
/// annotating twice changes nothing.
pub fn annotate_residuals(text: &str) -> String {
    let masked = lexer::mask(text);
    let mut out = String::with_capacity(text.len());
    let mut previous = "";

    for (line, masked_line) in text.split_inclusive('\n').zip(masked.split_inclusive('\n')) {
        let content = masked_line.trim_end_matches(['\r', '\n']);
        let labels: Vec<&str> = RESIDUALS
            .iter()
            .filter(|r| r.pattern.is_match(content))
            .map(|r| r.label)
            .collect();
        let marked = previous.trim_start().starts_with(MANUAL_MARKER);
        if !labels.is_empty() && !marked {
            let indent: String = line.chars().take_while(|c| *c == ' ' || *c == '\t').collect();
            out.push_str(&format!("{indent}{MANUAL_MARKER} {}\n", labels.join(", ")));
        }
        out.push_str(line);
        previous = line;
    }
    out
}

/// Number of manual-review markers in a rewritten body.
pub fn count_markers(text: &str) -> usize {
    text.lines()
        .filter(|line| line.trim_start().starts_with(MANUAL_MARKER))
        .count()
}
