//! Source units: the procedure text handed to the pipeline.
//!
//! A unit is built either directly from its parts or by parsing a T-SQL
//! `CREATE PROCEDURE` definition with [`SourceUnit::parse`].
//!
//! ```text
//! CREATE PROCEDURE dbo.sp_sales @region VARCHAR(50) = NULL, @start_date DATE AS
//! ────┬─────────── ─────┬───── ─────────────┬───────────────────────────── ─┬
//!     │                 │                   │                               │
//!     │                 │                   │                               └── body follows
//!     │                 │                   └── parameters (name, type, default)
//!     │                 └── procedure name
//!     └── header
//! ```

use std::sync::LazyLock;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while1},
    character::complete::{char, multispace1, satisfy},
    combinator::{not, opt, peek, recognize, value},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, ConvertResult};
use crate::lexer;

static HEADER_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCREATE\s+(?:OR\s+ALTER\s+)?PROC(?:EDURE)?\b").expect("header regex")
});

static OUTER_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^BEGIN\b(?:\s+(?:TRAN|TRANSACTION|TRY)\b)?").expect("block regex")
});

static TRAILING_GO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*GO\s*\z").expect("go regex"));

/// A declared procedure parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    /// Name without the leading `@`.
    pub name: String,
    /// Declared type as written, e.g. `VARCHAR(50)`.
    pub sql_type: String,
    /// Declared default as written, e.g. `NULL`, `100`, `'NA'`.
    pub default: Option<String>,
}

impl Parameter {
    pub fn required(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            default: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        sql_type: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            default: Some(default.into()),
        }
    }

    /// A parameter without a declared default must be supplied.
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }

    /// The default rendered as a Jinja literal (`NULL` becomes `none`).
    pub fn jinja_default(&self) -> Option<String> {
        let default = self.default.as_deref()?.trim();
        let rendered = if default.eq_ignore_ascii_case("null") {
            "none".to_string()
        } else if default.starts_with('\'') || default.parse::<f64>().is_ok() {
            default.to_string()
        } else {
            format!("'{}'", default.replace('\'', "\\'"))
        };
        Some(rendered)
    }

    /// The declared default as a plain value, `None` for `NULL` or no default.
    pub fn default_value(&self) -> Option<String> {
        let default = self.default.as_deref()?.trim();
        if default.eq_ignore_ascii_case("null") {
            return None;
        }
        Some(
            default
                .strip_prefix('\'')
                .and_then(|d| d.strip_suffix('\''))
                .map(|d| d.replace("''", "'"))
                .unwrap_or_else(|| default.to_string()),
        )
    }
}

/// One procedure to convert. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Unit name chosen by the caller, usually the file stem.
    pub name: String,
    /// Name found in the `CREATE PROCEDURE` header, if any.
    pub procedure_name: Option<String>,
    pub params: Vec<Parameter>,
    /// Procedure body without header and outer `BEGIN … END`.
    pub body: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, params: Vec<Parameter>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedure_name: None,
            params,
            body: body.into(),
        }
    }

    /// Parse procedure text. Text without a `CREATE PROCEDURE` header is
    /// taken as a bare body with no parameters.
    pub fn parse(text: &str, unit_name: &str) -> ConvertResult<Self> {
        let masked = lexer::mask(text);
        let Some(found) = HEADER_START.find(&masked) else {
            return Ok(Self::new(unit_name, Vec::new(), strip_outer_block(text)));
        };

        let start = found.start();
        let input = &text[start..];
        match procedure_header(input) {
            Ok((rest, (procedure_name, params))) => Ok(Self {
                name: unit_name.to_string(),
                procedure_name: Some(lexer::unbracket(procedure_name)),
                params,
                body: strip_outer_block(rest),
            }),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ConvertError::parse(
                start + input.len() - e.input.len(),
                "malformed procedure header",
            )),
            Err(nom::Err::Incomplete(_)) => {
                Err(ConvertError::parse(text.len(), "unexpected end of procedure header"))
            }
        }
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Remove a trailing `GO`, terminators and one outer `BEGIN … END`.
fn strip_outer_block(body: &str) -> String {
    let mut text = body.trim();
    if let Some(m) = TRAILING_GO.find(text) {
        text = text[..m.start()].trim_end();
    }
    text = text.trim_end_matches(';').trim_end();

    let opens_block = OUTER_BLOCK
        .captures(text)
        .is_some_and(|c| c.get(0).is_some_and(|m| m.as_str().len() == 5));
    let upper_tail = text.len().saturating_sub(3);
    let closes_block = text.len() >= 8
        && text.is_char_boundary(upper_tail)
        && text[upper_tail..].eq_ignore_ascii_case("END")
        && !text.as_bytes()[upper_tail - 1].is_ascii_alphanumeric();

    if opens_block && closes_block {
        text[5..upper_tail].trim().to_string()
    } else {
        text.to_string()
    }
}

/// Whitespace and comments.
fn sp(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            multispace1,
            recognize(pair(tag("--"), opt(is_not("\n")))),
            recognize(tuple((tag("/*"), take_until("*/"), tag("*/")))),
        ))),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn object_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || matches!(c, '_' | '.' | '[' | ']'))(input)
}

/// `VARCHAR`, `VARCHAR(50)`, `DECIMAL(10, 2)`, `NVARCHAR(MAX)`, or a
/// table type such as `dbo.OrderList`.
fn sql_type(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        object_name,
        opt(preceded(sp, delimited(char('('), is_not(")"), char(')')))),
    ))(input)
}

fn string_literal(input: &str) -> IResult<&str, &str> {
    recognize(delimited(
        char('\''),
        many0(alt((tag("''"), is_not("'")))),
        char('\''),
    ))(input)
}

/// A default; the `N` of a Unicode string literal is dropped.
fn default_value(input: &str) -> IResult<&str, &str> {
    alt((
        preceded(opt(tag_no_case("N")), string_literal),
        recognize(pair(
            opt(char('-')),
            take_while1(|c: char| c.is_ascii_digit() || c == '.'),
        )),
        recognize(pair(identifier, opt(tag("()")))),
    ))(input)
}

fn parameter(input: &str) -> IResult<&str, Parameter> {
    let (input, _) = char('@')(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = sp(input)?;
    let (input, sql_type) = sql_type(input)?;
    let (input, default) = opt(preceded(tuple((sp, char('='), sp)), default_value))(input)?;
    let (input, _) = opt(preceded(
        sp,
        alt((
            tag_no_case("OUTPUT"),
            tag_no_case("OUT"),
            tag_no_case("READONLY"),
        )),
    ))(input)?;

    Ok((
        input,
        Parameter {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            default: default.map(str::to_string),
        },
    ))
}

fn parameter_list(input: &str) -> IResult<&str, Vec<Parameter>> {
    separated_list0(tuple((sp, char(','), sp)), parameter)(input)
}

fn keyword_end(input: &str) -> IResult<&str, ()> {
    not(peek(satisfy(|c: char| c.is_alphanumeric() || c == '_')))(input)
}

fn procedure_header(input: &str) -> IResult<&str, (&str, Vec<Parameter>)> {
    let (input, _) = tag_no_case("CREATE")(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = opt(tuple((tag_no_case("OR"), sp, tag_no_case("ALTER"), sp)))(input)?;
    let (input, _) = alt((tag_no_case("PROCEDURE"), tag_no_case("PROC")))(input)?;
    let (input, _) = sp(input)?;
    let (input, name) = object_name(input)?;
    let (input, _) = sp(input)?;
    let (input, params) = alt((
        delimited(pair(char('('), sp), parameter_list, pair(sp, char(')'))),
        parameter_list,
    ))(input)?;
    let (input, _) = sp(input)?;
    let (input, _) = opt(tuple((
        tag_no_case("WITH"),
        sp,
        separated_list1(tuple((sp, char(','), sp)), identifier),
        sp,
    )))(input)?;
    let (input, _) = tag_no_case("AS")(input)?;
    let (input, _) = keyword_end(input)?;

    Ok((input, (name, params)))
}
