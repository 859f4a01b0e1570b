use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rill_lang::{Expr, FieldPath, expr_from_value, parse_field_path};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{FieldType, ValidationAction};
use crate::window::{WindowDefaults, WindowSpec, WindowStage};

// ---------------------------------------------------------------------------
// Raw stage definitions: one `[[stages]]` entry each
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageDef {
    Source(SourceStage),
    Validate(ValidateStage),
    TumblingWindow(WindowStage),
    Merge(MergeStage),
}

impl StageDef {
    fn kind(&self) -> &'static str {
        match self {
            StageDef::Source(_) => "source",
            StageDef::Validate(_) => "validate",
            StageDef::TumblingWindow(_) => "tumbling_window",
            StageDef::Merge(_) => "merge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceConnector {
    Inline,
    Jsonl,
    Tcp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceStage {
    pub connector: SourceConnector,
    /// `inline`: documents listed in the processor file.
    #[serde(default)]
    pub documents: Vec<Value>,
    /// `jsonl`: file with one document per line.
    pub path: Option<PathBuf>,
    /// `tcp`: `tcp://host:port`.
    pub listen: Option<String>,
    /// Field carrying the event time. Absent: ingestion time is used.
    pub time_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateStage {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    #[serde(default = "default_validation_action")]
    pub action: ValidationAction,
}

fn default_validation_action() -> ValidationAction {
    ValidationAction::Dlq
}

/// A `[[stages.properties]]` entry. Declaration order is checking order.
#[derive(Debug, Clone, Deserialize)]
pub struct PropertyDef {
    pub field: String,
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeStage {
    pub into: SinkTarget,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub when_matched: WhenMatchedDef,
    #[serde(default)]
    pub when_not_matched: WhenNotMatched,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WhenMatchedDef {
    Mode(WhenMatchedMode),
    Pipeline(Vec<UpdateStageDef>),
}

impl Default for WhenMatchedDef {
    fn default() -> Self {
        WhenMatchedDef::Mode(WhenMatchedMode::Merge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenMatchedMode {
    Replace,
    Merge,
    KeepExisting,
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStageDef {
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub unset: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenNotMatched {
    #[default]
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkConnector {
    Memory,
    File,
}

/// Sink reference used by `merge.into` and the processor-level `[dlq]`.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkTarget {
    pub connector: SinkConnector,
    pub name: Option<String>,
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SourceKind {
    Inline { documents: Vec<Value> },
    Jsonl { path: PathBuf },
    Tcp { addr: String },
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub time_field: Option<FieldPath>,
}

/// One check applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Type(FieldType),
    Minimum(f64),
    Maximum(f64),
    MinLength(usize),
    MaxLength(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRule {
    pub field: FieldPath,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone)]
pub struct ValidateSpec {
    pub required: Vec<FieldPath>,
    pub properties: Vec<PropertyRule>,
    pub action: ValidationAction,
}

/// A `$set` / `$unset` step of a `when_matched` pipeline. Expressions see
/// the existing document as `$field` and the incoming record as `$$new`.
/// `set` is ordered by path and holds no two paths where one is a prefix of
/// the other.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStage {
    pub set: Vec<(FieldPath, Expr)>,
    pub unset: Vec<FieldPath>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhenMatched {
    Replace,
    Merge,
    KeepExisting,
    Fail,
    Pipeline(Vec<UpdateStage>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkSpec {
    Memory { name: String },
    File { path: PathBuf },
}

impl fmt::Display for SinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSpec::Memory { name } => write!(f, "memory:{name}"),
            SinkSpec::File { path } => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeSpec {
    pub into: SinkSpec,
    pub on: Vec<FieldPath>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

/// The stage sequence after ordering checks:
/// `source → [validate] → tumbling_window → merge`.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub source: SourceSpec,
    pub validate: Option<ValidateSpec>,
    pub window: WindowSpec,
    pub merge: MergeSpec,
}

impl Pipeline {
    /// Check stage ordering and resolve every stage.
    pub fn from_stages(stages: Vec<StageDef>, defaults: &WindowDefaults) -> anyhow::Result<Self> {
        if stages.is_empty() {
            anyhow::bail!("stages: pipeline is empty");
        }
        let last = stages.len() - 1;

        let mut source = None;
        let mut validate = None;
        let mut window = None;
        let mut merge = None;

        for (i, stage) in stages.into_iter().enumerate() {
            let kind = stage.kind();
            match stage {
                StageDef::Source(s) => {
                    if i != 0 {
                        anyhow::bail!("stages[{i}]: source must be the first stage");
                    }
                    source = Some(
                        s.resolve()
                            .map_err(|e| anyhow::anyhow!("stages[{i}] ({kind}): {e}"))?,
                    );
                }
                StageDef::Validate(v) => {
                    if validate.is_some() {
                        anyhow::bail!("stages[{i}]: at most one validate stage is allowed");
                    }
                    if window.is_some() {
                        anyhow::bail!("stages[{i}]: validate must come before tumbling_window");
                    }
                    validate = Some(
                        v.resolve()
                            .map_err(|e| anyhow::anyhow!("stages[{i}] ({kind}): {e}"))?,
                    );
                }
                StageDef::TumblingWindow(w) => {
                    if window.is_some() {
                        anyhow::bail!("stages[{i}]: exactly one tumbling_window is allowed");
                    }
                    window = Some(
                        w.resolve(defaults)
                            .map_err(|e| anyhow::anyhow!("stages[{i}] ({kind}): {e}"))?,
                    );
                }
                StageDef::Merge(m) => {
                    if i != last {
                        anyhow::bail!("stages[{i}]: merge must be the last stage");
                    }
                    merge = Some(
                        m.resolve()
                            .map_err(|e| anyhow::anyhow!("stages[{i}] ({kind}): {e}"))?,
                    );
                }
            }
        }

        let source = source.ok_or_else(|| anyhow::anyhow!("stages[0]: first stage must be source"))?;
        let window =
            window.ok_or_else(|| anyhow::anyhow!("stages: a tumbling_window stage is required"))?;
        let merge =
            merge.ok_or_else(|| anyhow::anyhow!("stages[{last}]: last stage must be merge"))?;

        Ok(Pipeline {
            source,
            validate,
            window,
            merge,
        })
    }

    /// Rebase relative file paths onto `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if let SourceKind::Jsonl { path } = &mut self.source.kind {
            rebase(path, base);
        }
        self.merge.into.resolve_paths(base);
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source.kind {
            SourceKind::Inline { documents } => format!("inline ({} documents)", documents.len()),
            SourceKind::Jsonl { path } => format!("jsonl {}", path.display()),
            SourceKind::Tcp { addr } => format!("tcp {addr}"),
        };
        write!(f, "source           {source}")?;
        if let Some(tf) = &self.source.time_field {
            write!(f, ", time_field = {tf}")?;
        }
        writeln!(f)?;

        if let Some(v) = &self.validate {
            writeln!(
                f,
                "validate         {} required, {} properties, action = {:?}",
                v.required.len(),
                v.properties.len(),
                v.action,
            )?;
        }

        let w = &self.window;
        writeln!(
            f,
            "tumbling_window  size = {}, watermark = {}, allowed_lateness = {}, late_policy = {:?}",
            crate::types::HumanDuration::from(w.size),
            w.watermark,
            w.allowed_lateness,
            w.late_policy,
        )?;
        writeln!(f, "  _id            {}", w.group.key)?;
        for acc in &w.group.accumulators {
            writeln!(f, "  {:<14} {}({})", acc.name, acc.op, acc.expr)?;
        }

        let on: Vec<String> = self.merge.on.iter().map(ToString::to_string).collect();
        write!(
            f,
            "merge            into = {}, on = [{}], when_matched = {}, when_not_matched = {:?}",
            self.merge.into,
            on.join(", "),
            match &self.merge.when_matched {
                WhenMatched::Pipeline(stages) => format!("pipeline({} stages)", stages.len()),
                other => format!("{other:?}"),
            },
            self.merge.when_not_matched,
        )
    }
}

// ---------------------------------------------------------------------------
// Per-stage resolution
// ---------------------------------------------------------------------------

impl SourceStage {
    fn resolve(self) -> anyhow::Result<SourceSpec> {
        let time_field = self
            .time_field
            .as_deref()
            .map(parse_field_path)
            .transpose()
            .map_err(|e| anyhow::anyhow!("time_field: {e}"))?;

        let kind = match self.connector {
            SourceConnector::Inline => {
                if let Some(i) = self.documents.iter().position(|d| !d.is_object()) {
                    anyhow::bail!("documents[{i}]: must be a table");
                }
                SourceKind::Inline {
                    documents: self.documents,
                }
            }
            SourceConnector::Jsonl => {
                let path = self
                    .path
                    .ok_or_else(|| anyhow::anyhow!("path is required for connector \"jsonl\""))?;
                SourceKind::Jsonl { path }
            }
            SourceConnector::Tcp => {
                let listen = self
                    .listen
                    .ok_or_else(|| anyhow::anyhow!("listen is required for connector \"tcp\""))?;
                let addr = listen.strip_prefix("tcp://").ok_or_else(|| {
                    anyhow::anyhow!("listen must start with \"tcp://\", got {listen:?}")
                })?;
                SourceKind::Tcp {
                    addr: addr.to_string(),
                }
            }
        };

        Ok(SourceSpec { kind, time_field })
    }
}

impl ValidateStage {
    fn resolve(self) -> anyhow::Result<ValidateSpec> {
        let required = self
            .required
            .iter()
            .map(|f| parse_field_path(f).map_err(|e| anyhow::anyhow!("required: {e}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut properties = Vec::with_capacity(self.properties.len());
        for prop in self.properties {
            properties.push(
                prop.resolve()
                    .map_err(|e| anyhow::anyhow!("properties: {e}"))?,
            );
        }

        Ok(ValidateSpec {
            required,
            properties,
            action: self.action,
        })
    }
}

impl PropertyDef {
    fn resolve(self) -> anyhow::Result<PropertyRule> {
        let name = &self.field;
        let field = parse_field_path(name)?;

        let numeric = matches!(
            self.field_type,
            None | Some(FieldType::Int | FieldType::Long | FieldType::Double | FieldType::Number)
        );
        let sized = matches!(
            self.field_type,
            None | Some(FieldType::String | FieldType::Array)
        );

        if (self.minimum.is_some() || self.maximum.is_some()) && !numeric {
            anyhow::bail!("{name}: minimum/maximum only apply to numeric types");
        }
        if (self.min_length.is_some() || self.max_length.is_some()) && !sized {
            anyhow::bail!("{name}: min_length/max_length only apply to string or array");
        }
        if let (Some(lo), Some(hi)) = (self.minimum, self.maximum)
            && lo > hi
        {
            anyhow::bail!("{name}: minimum ({lo}) is greater than maximum ({hi})");
        }
        if let (Some(lo), Some(hi)) = (self.min_length, self.max_length)
            && lo > hi
        {
            anyhow::bail!("{name}: min_length ({lo}) is greater than max_length ({hi})");
        }

        let mut constraints = Vec::new();
        if let Some(t) = self.field_type {
            constraints.push(Constraint::Type(t));
        }
        if let Some(v) = self.minimum {
            constraints.push(Constraint::Minimum(v));
        }
        if let Some(v) = self.maximum {
            constraints.push(Constraint::Maximum(v));
        }
        if let Some(v) = self.min_length {
            constraints.push(Constraint::MinLength(v));
        }
        if let Some(v) = self.max_length {
            constraints.push(Constraint::MaxLength(v));
        }
        if constraints.is_empty() {
            anyhow::bail!("{name}: property declares no constraint");
        }

        Ok(PropertyRule { field, constraints })
    }
}

impl MergeStage {
    fn resolve(self) -> anyhow::Result<MergeSpec> {
        let into = self.into.resolve().map_err(|e| anyhow::anyhow!("into: {e}"))?;

        let on = if self.on.is_empty() {
            vec![FieldPath::from_dotted("_id"), FieldPath::from_dotted("_window")]
        } else {
            self.on
                .iter()
                .map(|f| parse_field_path(f).map_err(|e| anyhow::anyhow!("on: {e}")))
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        let when_matched = match self.when_matched {
            WhenMatchedDef::Mode(WhenMatchedMode::Replace) => WhenMatched::Replace,
            WhenMatchedDef::Mode(WhenMatchedMode::Merge) => WhenMatched::Merge,
            WhenMatchedDef::Mode(WhenMatchedMode::KeepExisting) => WhenMatched::KeepExisting,
            WhenMatchedDef::Mode(WhenMatchedMode::Fail) => WhenMatched::Fail,
            WhenMatchedDef::Pipeline(defs) => {
                if defs.is_empty() {
                    anyhow::bail!("when_matched: pipeline must contain at least one stage");
                }
                let mut stages = Vec::with_capacity(defs.len());
                for (i, def) in defs.into_iter().enumerate() {
                    stages.push(
                        def.resolve()
                            .map_err(|e| anyhow::anyhow!("when_matched[{i}]: {e}"))?,
                    );
                }
                WhenMatched::Pipeline(stages)
            }
        };

        Ok(MergeSpec {
            into,
            on,
            when_matched,
            when_not_matched: self.when_not_matched,
        })
    }
}

impl UpdateStageDef {
    fn resolve(self) -> anyhow::Result<UpdateStage> {
        if self.set.is_empty() && self.unset.is_empty() {
            anyhow::bail!("stage has neither set nor unset");
        }
        let mut set = Vec::with_capacity(self.set.len());
        for (field, value) in self.set {
            let path = parse_field_path(&field)?;
            let expr = expr_from_value(value).map_err(|e| anyhow::anyhow!("set.{field}: {e}"))?;
            set.push((path, expr));
        }
        // Assignments run in path order, so a path and its own prefix in one
        // stage would write the same subtree twice.
        for (i, (a, _)) in set.iter().enumerate() {
            for (b, _) in &set[i + 1..] {
                if a.segments().starts_with(b.segments()) || b.segments().starts_with(a.segments()) {
                    anyhow::bail!("set: paths {a} and {b} overlap; split them into separate stages");
                }
            }
        }
        let unset = self
            .unset
            .iter()
            .map(|f| parse_field_path(f))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(UpdateStage { set, unset })
    }
}

impl SinkTarget {
    pub fn resolve(self) -> anyhow::Result<SinkSpec> {
        match self.connector {
            SinkConnector::Memory => {
                let name = self
                    .name
                    .ok_or_else(|| anyhow::anyhow!("name is required for connector \"memory\""))?;
                if name.is_empty() {
                    anyhow::bail!("name must not be empty");
                }
                Ok(SinkSpec::Memory { name })
            }
            SinkConnector::File => {
                let path = self
                    .path
                    .ok_or_else(|| anyhow::anyhow!("path is required for connector \"file\""))?;
                Ok(SinkSpec::File { path })
            }
        }
    }
}

impl SinkSpec {
    pub fn resolve_paths(&mut self, base: &Path) {
        if let SinkSpec::File { path } = self {
            rebase(path, base);
        }
    }
}

fn rebase(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
