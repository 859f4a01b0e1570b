use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rill_lang::{Expr, expr_from_value};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{HumanDuration, LatePolicy, TimeUnit};

// ---------------------------------------------------------------------------
// WindowDefaults: deserialized from [window_defaults]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowDefaults {
    /// Watermark lag behind the highest event time seen.
    pub watermark: HumanDuration,
    /// Grace period after a window's end before it closes.
    pub allowed_lateness: HumanDuration,
    pub late_policy: LatePolicy,
    /// How long closed windows stay revisable under `late_policy = "revise"`.
    /// Defaults to the window size.
    pub revise_retention: Option<HumanDuration>,
}

impl Default for WindowDefaults {
    fn default() -> Self {
        Self {
            watermark: Duration::ZERO.into(),
            allowed_lateness: Duration::ZERO.into(),
            late_policy: LatePolicy::Drop,
            revise_retention: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WindowSizeDef: `"3s"` or `{ size = 3, unit = "second" }`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WindowSizeDef {
    Human(HumanDuration),
    Interval { size: u64, unit: TimeUnit },
}

impl WindowSizeDef {
    pub fn to_duration(&self) -> Duration {
        match self {
            WindowSizeDef::Human(d) => d.as_duration(),
            WindowSizeDef::Interval { size, unit } => unit.to_duration(*size),
        }
    }
}

// ---------------------------------------------------------------------------
// WindowStage: deserialized from a `stage = "tumbling_window"` entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WindowStage {
    pub size: WindowSizeDef,
    pub watermark: Option<HumanDuration>,
    pub allowed_lateness: Option<HumanDuration>,
    pub late_policy: Option<LatePolicy>,
    pub group: GroupStage,
}

/// The group stage nested in a window: key expression plus one accumulator
/// per output field, e.g. `fields.n = { sum = "$x" }`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupStage {
    #[serde(rename = "_id")]
    pub id: Value,
    #[serde(default)]
    pub fields: BTreeMap<String, BTreeMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Min,
    Max,
    Avg,
    StdDevPop,
    Push,
    Count,
    First,
    Last,
}

impl FromStr for AccumulatorOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "avg" => Self::Avg,
            "stdDevPop" | "std_dev_pop" => Self::StdDevPop,
            "push" => Self::Push,
            "count" => Self::Count,
            "first" => Self::First,
            "last" => Self::Last,
            other => anyhow::bail!(
                "unknown accumulator operator {other:?} \
                 (expected sum/min/max/avg/stdDevPop/push/count/first/last)"
            ),
        })
    }
}

impl fmt::Display for AccumulatorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Avg => "avg",
            Self::StdDevPop => "stdDevPop",
            Self::Push => "push",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
        };
        f.write_str(s)
    }
}

/// One output field of the group stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorSpec {
    pub name: String,
    pub op: AccumulatorOp,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    /// Group key expression (`_id`).
    pub key: Expr,
    /// Sorted by output field name.
    pub accumulators: Vec<AccumulatorSpec>,
}

// ---------------------------------------------------------------------------
// WindowSpec: fully resolved window configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub size: Duration,
    pub watermark: HumanDuration,
    pub allowed_lateness: HumanDuration,
    pub late_policy: LatePolicy,
    pub revise_retention: Duration,
    pub group: GroupSpec,
}

impl WindowSpec {
    pub fn size_millis(&self) -> i64 {
        i64::try_from(self.size.as_millis()).unwrap_or(i64::MAX)
    }
}

impl WindowStage {
    /// Resolve this stage against `defaults`, producing a [`WindowSpec`].
    pub fn resolve(self, defaults: &WindowDefaults) -> anyhow::Result<WindowSpec> {
        let size = self.size.to_duration();
        if size.as_millis() == 0 {
            anyhow::bail!("tumbling_window: size must be at least 1ms");
        }
        let group = self.group.resolve()?;
        Ok(WindowSpec {
            size,
            watermark: self.watermark.unwrap_or(defaults.watermark),
            allowed_lateness: self.allowed_lateness.unwrap_or(defaults.allowed_lateness),
            late_policy: self.late_policy.unwrap_or(defaults.late_policy),
            revise_retention: defaults
                .revise_retention
                .map(|d| d.as_duration())
                .unwrap_or(size),
            group,
        })
    }
}

impl GroupStage {
    fn resolve(self) -> anyhow::Result<GroupSpec> {
        let key = expr_from_value(self.id)
            .map_err(|e| anyhow::anyhow!("tumbling_window.group._id: {e}"))?;

        let mut accumulators = Vec::with_capacity(self.fields.len());
        for (name, def) in self.fields {
            if name.starts_with('_') {
                anyhow::bail!(
                    "tumbling_window.group.fields.{name}: names starting with '_' are reserved"
                );
            }
            let mut entries = def.into_iter();
            let (op, arg) = match (entries.next(), entries.next()) {
                (Some(single), None) => single,
                _ => anyhow::bail!(
                    "tumbling_window.group.fields.{name}: expected exactly one operator, \
                     e.g. {{ sum = \"$x\" }}"
                ),
            };
            let op: AccumulatorOp = op
                .parse()
                .map_err(|e| anyhow::anyhow!("tumbling_window.group.fields.{name}: {e}"))?;
            let expr = expr_from_value(arg)
                .map_err(|e| anyhow::anyhow!("tumbling_window.group.fields.{name}: {e}"))?;
            accumulators.push(AccumulatorSpec { name, op, expr });
        }

        Ok(GroupSpec { key, accumulators })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
