pub mod ast;
mod parser;

pub use ast::{Expr, FieldPath, Vars};
pub use parser::{expr_from_value, parse_expr, parse_field_path};
