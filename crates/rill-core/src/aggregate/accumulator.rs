use std::cmp::Ordering;

use rill_config::AccumulatorOp;
use serde_json::{Number, Value};

use crate::validate::type_name;

// ---------------------------------------------------------------------------
// FoldError
// ---------------------------------------------------------------------------

/// An input an accumulator cannot take. Per-document, never fatal.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FoldError {
    #[error("{field}: {op} expects a number, found {found}")]
    NotNumeric {
        field: String,
        op: AccumulatorOp,
        found: &'static str,
    },
    #[error("{field}: {op} cannot compare {found} with {existing}")]
    Incomparable {
        field: String,
        op: AccumulatorOp,
        existing: &'static str,
        found: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Running state
// ---------------------------------------------------------------------------

/// Integer while every input is an integer and the total fits in i64.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sum {
    Int(i64),
    Float(f64),
}

impl Sum {
    fn add(self, n: &Number) -> Sum {
        match (self, n.as_i64()) {
            (Sum::Int(acc), Some(i)) => match acc.checked_add(i) {
                Some(total) => Sum::Int(total),
                None => Sum::Float(acc as f64 + i as f64),
            },
            (Sum::Int(acc), None) => Sum::Float(acc as f64 + as_f64(n)),
            (Sum::Float(acc), _) => Sum::Float(acc + as_f64(n)),
        }
    }

    fn to_value(self) -> Value {
        match self {
            Sum::Int(i) => Value::from(i),
            Sum::Float(f) => float_value(f),
        }
    }
}

/// Welford running mean and second moment.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Moments {
    fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn mean(&self) -> Option<f64> {
        (self.n > 0).then_some(self.mean)
    }

    fn std_dev_pop(&self) -> Option<f64> {
        (self.n > 0).then(|| (self.m2 / self.n as f64).sqrt())
    }
}

/// Per-group running state of one output field.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Sum),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg(Moments),
    StdDevPop(Moments),
    Push(Vec<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
}

impl Accumulator {
    pub fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => Accumulator::Sum(Sum::Int(0)),
            AccumulatorOp::Min => Accumulator::Min(None),
            AccumulatorOp::Max => Accumulator::Max(None),
            AccumulatorOp::Avg => Accumulator::Avg(Moments::default()),
            AccumulatorOp::StdDevPop => Accumulator::StdDevPop(Moments::default()),
            AccumulatorOp::Push => Accumulator::Push(Vec::new()),
            AccumulatorOp::Count => Accumulator::Count(0),
            AccumulatorOp::First => Accumulator::First(None),
            AccumulatorOp::Last => Accumulator::Last(None),
        }
    }

    pub fn op(&self) -> AccumulatorOp {
        match self {
            Accumulator::Sum(_) => AccumulatorOp::Sum,
            Accumulator::Min(_) => AccumulatorOp::Min,
            Accumulator::Max(_) => AccumulatorOp::Max,
            Accumulator::Avg(_) => AccumulatorOp::Avg,
            Accumulator::StdDevPop(_) => AccumulatorOp::StdDevPop,
            Accumulator::Push(_) => AccumulatorOp::Push,
            Accumulator::Count(_) => AccumulatorOp::Count,
            Accumulator::First(_) => AccumulatorOp::First,
            Accumulator::Last(_) => AccumulatorOp::Last,
        }
    }

    /// Check that `input` can be folded, without changing any state.
    /// Missing and null inputs always pass.
    pub fn check(&self, field: &str, input: Option<&Value>) -> Result<(), FoldError> {
        let Some(v) = input.filter(|v| !v.is_null()) else {
            return Ok(());
        };
        match self {
            Accumulator::Sum(_) | Accumulator::Avg(_) | Accumulator::StdDevPop(_) => {
                if !v.is_number() {
                    return Err(FoldError::NotNumeric {
                        field: field.to_string(),
                        op: self.op(),
                        found: type_name(v),
                    });
                }
            }
            Accumulator::Min(cur) | Accumulator::Max(cur) => {
                let incomparable = |existing: &Value| FoldError::Incomparable {
                    field: field.to_string(),
                    op: self.op(),
                    existing: type_name(existing),
                    found: type_name(v),
                };
                match cur {
                    Some(existing) if compare(existing, v).is_none() => {
                        return Err(incomparable(existing));
                    }
                    // Only scalars are ordered.
                    None if compare(v, v).is_none() => return Err(incomparable(v)),
                    _ => {}
                }
            }
            Accumulator::Push(_)
            | Accumulator::Count(_)
            | Accumulator::First(_)
            | Accumulator::Last(_) => {}
        }
        Ok(())
    }

    /// Fold `input`. Callers run [`check`](Self::check) first; an input that
    /// would fail it is ignored here.
    pub fn apply(&mut self, input: Option<&Value>) {
        if let Accumulator::Count(n) = self {
            *n += 1;
            return;
        }
        let Some(v) = input.filter(|v| !v.is_null()) else {
            return;
        };
        match self {
            Accumulator::Sum(sum) => {
                if let Value::Number(n) = v {
                    *sum = sum.add(n);
                }
            }
            Accumulator::Min(cur) => replace_if(cur, v, Ordering::Less),
            Accumulator::Max(cur) => replace_if(cur, v, Ordering::Greater),
            Accumulator::Avg(m) | Accumulator::StdDevPop(m) => {
                if let Some(x) = v.as_f64() {
                    m.push(x);
                }
            }
            Accumulator::Push(values) => values.push(v.clone()),
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(v.clone());
                }
            }
            Accumulator::Last(last) => *last = Some(v.clone()),
            Accumulator::Count(_) => {}
        }
    }

    /// Final value of this field.
    pub fn finalize(&self) -> Value {
        match self {
            Accumulator::Sum(sum) => sum.to_value(),
            Accumulator::Min(v)
            | Accumulator::Max(v)
            | Accumulator::First(v)
            | Accumulator::Last(v) => v.clone().unwrap_or(Value::Null),
            Accumulator::Avg(m) => m.mean().map(float_value).unwrap_or(Value::Null),
            Accumulator::StdDevPop(m) => m.std_dev_pop().map(float_value).unwrap_or(Value::Null),
            Accumulator::Push(values) => Value::Array(values.clone()),
            Accumulator::Count(n) => Value::from(*n),
        }
    }
}

fn replace_if(cur: &mut Option<Value>, candidate: &Value, wanted: Ordering) {
    let replace = match cur {
        None => true,
        Some(existing) => compare(candidate, existing) == Some(wanted),
    };
    if replace {
        *cur = Some(candidate.clone());
    }
}

/// Ordering between two values of the same scalar kind. Numbers compare
/// numerically across int and float.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => as_f64(x).partial_cmp(&as_f64(y)),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold_all(op: AccumulatorOp, inputs: &[Value]) -> Accumulator {
        let mut acc = Accumulator::new(op);
        for v in inputs {
            acc.check("f", Some(v)).unwrap();
            acc.apply(Some(v));
        }
        acc
    }

    #[test]
    fn sum_preserves_integers() {
        let acc = fold_all(AccumulatorOp::Sum, &[json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(acc.finalize(), json!(10));
        assert!(acc.finalize().is_i64());
    }

    #[test]
    fn sum_promotes_on_float_and_overflow() {
        let acc = fold_all(AccumulatorOp::Sum, &[json!(1), json!(0.5)]);
        assert_eq!(acc.finalize(), json!(1.5));

        let acc = fold_all(AccumulatorOp::Sum, &[json!(i64::MAX), json!(1)]);
        assert!(acc.finalize().is_f64());
    }

    #[test]
    fn sum_of_nothing_is_zero() {
        assert_eq!(Accumulator::new(AccumulatorOp::Sum).finalize(), json!(0));
    }

    #[test]
    fn avg_and_std_dev_pop() {
        let inputs = [json!(2), json!(4), json!(4), json!(4), json!(5), json!(5), json!(7), json!(9)];
        let avg = fold_all(AccumulatorOp::Avg, &inputs).finalize();
        assert!((avg.as_f64().unwrap() - 5.0).abs() < 1e-9, "{avg}");
        let sd = fold_all(AccumulatorOp::StdDevPop, &inputs).finalize();
        assert!((sd.as_f64().unwrap() - 2.0).abs() < 1e-9, "{sd}");
        assert_eq!(Accumulator::new(AccumulatorOp::Avg).finalize(), Value::Null);
    }

    #[test]
    fn min_max_mixed_numeric() {
        let inputs = [json!(3), json!(1.5), json!(7)];
        assert_eq!(fold_all(AccumulatorOp::Min, &inputs).finalize(), json!(1.5));
        assert_eq!(fold_all(AccumulatorOp::Max, &inputs).finalize(), json!(7));
        let words = [json!("pear"), json!("apple")];
        assert_eq!(fold_all(AccumulatorOp::Min, &words).finalize(), json!("apple"));
    }

    #[test]
    fn min_rejects_incomparable() {
        let mut acc = fold_all(AccumulatorOp::Min, &[json!(3)]);
        let err = acc.check("lo", Some(&json!("a"))).unwrap_err();
        assert!(matches!(err, FoldError::Incomparable { existing: "int", found: "string", .. }));
        assert!(acc.check("lo", Some(&json!({"a": 1}))).is_err());
        acc.apply(Some(&json!(1)));
        assert_eq!(acc.finalize(), json!(1));

        let empty = Accumulator::new(AccumulatorOp::Max);
        assert!(empty.check("hi", Some(&json!([1]))).is_err());
    }

    #[test]
    fn sum_rejects_non_numeric() {
        let acc = Accumulator::new(AccumulatorOp::Sum);
        let err = acc.check("total", Some(&json!("22"))).unwrap_err();
        assert_eq!(err.to_string(), "total: sum expects a number, found string");
    }

    #[test]
    fn null_and_missing_skipped_except_count() {
        let mut sum = Accumulator::new(AccumulatorOp::Sum);
        let mut count = Accumulator::new(AccumulatorOp::Count);
        let mut push = Accumulator::new(AccumulatorOp::Push);
        for input in [None, Some(&Value::Null), Some(&json!(2))] {
            for acc in [&mut sum, &mut count, &mut push] {
                acc.check("f", input).unwrap();
                acc.apply(input);
            }
        }
        assert_eq!(sum.finalize(), json!(2));
        assert_eq!(count.finalize(), json!(3));
        assert_eq!(push.finalize(), json!([2]));
    }

    #[test]
    fn push_first_last_keep_values_verbatim() {
        let inputs = [json!(1), json!(3.14), json!({"k": "v"})];
        assert_eq!(
            fold_all(AccumulatorOp::Push, &inputs).finalize(),
            json!([1, 3.14, {"k": "v"}])
        );
        assert_eq!(fold_all(AccumulatorOp::First, &inputs).finalize(), json!(1));
        assert_eq!(fold_all(AccumulatorOp::Last, &inputs).finalize(), json!({"k": "v"}));
    }
}
