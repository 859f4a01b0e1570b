use std::fmt;

use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// FieldPath
// ---------------------------------------------------------------------------

/// A dotted path into a document, e.g. `fullDocument.color` or `items.0.sku`.
///
/// Numeric segments index into arrays; every other segment selects an object
/// member. The empty path addresses the root value itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Build a path from a dotted string without going through the parser.
    pub fn from_dotted(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }
        Self {
            segments: path.split('.').map(String::from).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Resolve the path against `root`. Returns `None` when any segment is
    /// missing or addresses into a scalar.
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in &self.segments {
            cur = match cur {
                Value::Object(map) => map.get(seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Resolve the path against a document body.
    pub fn lookup_in<'a>(&self, doc: &'a Map<String, Value>) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let head = doc.get(first)?;
        FieldPath::new(rest.to_vec()).lookup(head)
    }

    /// Write `value` at this path, creating intermediate objects as needed.
    /// Non-object intermediates are overwritten.
    pub fn assign(&self, doc: &mut Map<String, Value>, value: Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            return;
        };
        let mut cur = doc;
        for seg in parents {
            let slot = cur
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(next) => cur = next,
                _ => return,
            }
        }
        cur.insert(last.clone(), value);
    }

    /// Remove the value at this path. Missing intermediates are a no-op.
    pub fn remove(&self, doc: &mut Map<String, Value>) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut cur = doc;
        for seg in parents {
            match cur.get_mut(seg)? {
                Value::Object(next) => cur = next,
                _ => return None,
            }
        }
        cur.remove(last)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

// ---------------------------------------------------------------------------
// Expr
// ---------------------------------------------------------------------------

/// A value expression used by stage definitions.
///
/// - `$a.b` reads a field of the current document.
/// - `$$name.a.b` reads a field of a bound variable (e.g. `$$new`).
/// - anything else is a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(FieldPath),
    Var { name: String, path: FieldPath },
    Literal(Value),
}

/// Variable bindings visible to `$$name` references.
pub type Vars<'a> = [(&'a str, &'a Value)];

impl Expr {
    /// Evaluate against `root`, with `vars` bound for `$$name` references.
    ///
    /// Returns `None` for missing fields and unbound variables.
    pub fn eval<'a>(&'a self, root: &'a Value, vars: &Vars<'a>) -> Option<&'a Value> {
        match self {
            Expr::Field(path) => path.lookup(root),
            Expr::Var { name, path } => {
                let (_, bound) = vars.iter().find(|(n, _)| n == name)?;
                path.lookup(bound)
            }
            Expr::Literal(v) => Some(v),
        }
    }

    /// Evaluate against a document body with no variables bound.
    pub fn eval_doc<'a>(&'a self, doc: &'a Map<String, Value>) -> Option<&'a Value> {
        match self {
            Expr::Field(path) => path.lookup_in(doc),
            Expr::Var { .. } => None,
            Expr::Literal(v) => Some(v),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(path) => write!(f, "${path}"),
            Expr::Var { name, path } if path.is_root() => write!(f, "$${name}"),
            Expr::Var { name, path } => write!(f, "$${name}.{path}"),
            Expr::Literal(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
