use serde_json::Value;
use winnow::combinator::{alt, cut_err, opt, preceded, separated};
use winnow::error::{StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{literal, take_while};

use crate::ast::{Expr, FieldPath};

// ---------------------------------------------------------------------------
// Grammar
//
//   expr      := var_ref | field_ref
//   var_ref   := "$$" segment ( "." path )?
//   field_ref := "$" path
//   path      := segment ( "." segment )*
//   segment   := [A-Za-z0-9_-]+
// ---------------------------------------------------------------------------

fn segment<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })
    .context(StrContext::Expected(StrContextValue::Description(
        "field name",
    )))
    .parse_next(input)
}

fn path(input: &mut &str) -> ModalResult<FieldPath> {
    let segs: Vec<&str> = separated(1.., segment, literal(".")).parse_next(input)?;
    Ok(FieldPath::new(segs.into_iter().map(String::from).collect()))
}

fn var_ref(input: &mut &str) -> ModalResult<Expr> {
    literal("$$").parse_next(input)?;
    let name = cut_err(segment).parse_next(input)?;
    let path = opt(preceded(literal("."), cut_err(path))).parse_next(input)?;
    Ok(Expr::Var {
        name: name.to_string(),
        path: path.unwrap_or_default(),
    })
}

fn field_ref(input: &mut &str) -> ModalResult<Expr> {
    literal("$").parse_next(input)?;
    cut_err(path).map(Expr::Field).parse_next(input)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse an expression string.
///
/// Strings starting with `$` are field or variable references; any other
/// string is a string constant.
pub fn parse_expr(src: &str) -> anyhow::Result<Expr> {
    if !src.starts_with('$') {
        return Ok(Expr::Literal(Value::String(src.to_string())));
    }
    alt((var_ref, field_ref))
        .parse(src)
        .map_err(|e| anyhow::anyhow!("invalid expression {src:?}:\n{e}"))
}

/// Turn a configuration value into an expression: strings are parsed, every
/// other value becomes a constant.
pub fn expr_from_value(value: Value) -> anyhow::Result<Expr> {
    match value {
        Value::String(s) => parse_expr(&s),
        other => Ok(Expr::Literal(other)),
    }
}

/// Parse a plain dotted field path (no leading `$`), as used for schema
/// property names and merge keys.
pub fn parse_field_path(src: &str) -> anyhow::Result<FieldPath> {
    path.parse(src)
        .map_err(|e| anyhow::anyhow!("invalid field path {src:?}:\n{e}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
