use std::collections::{BTreeMap, HashMap};

use rill_config::{GroupSpec, LatePolicy, WindowSpec};
use serde_json::{Map, Value};

use super::assigner::{WindowAssigner, WindowBounds, WindowId};
use super::watermark::NO_WATERMARK;
use crate::aggregate::{FoldError, GroupKey, GroupState};
use crate::document::Document;

// ---------------------------------------------------------------------------
// WindowPhase
// ---------------------------------------------------------------------------

/// `Open → Closing → Emitted`, then removed from the store (evicted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    /// Accepting documents.
    Open,
    /// Closed by the watermark; final values not yet acknowledged.
    Closing,
    /// Every group acknowledged by the sink.
    Emitted,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    Folded,
    /// Folded into an already-closed window under `late_policy = "revise"`.
    /// The window is re-emitted at the next watermark advance.
    Revised(WindowBounds),
    /// The document's window has closed; apply the late policy. Under
    /// `revise` this means the window is past its retention.
    Late(WindowBounds),
    /// An accumulator rejected the document. No state changed.
    Rejected(FoldError),
}

/// Final values of one closing window, one entry per group in first-seen
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEmission {
    pub window: WindowId,
    pub bounds: WindowBounds,
    /// 0 for the first emission, incremented by each revision.
    pub revision: u32,
    pub groups: Vec<(GroupKey, Map<String, Value>)>,
}

// ---------------------------------------------------------------------------
// WindowState
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowState {
    bounds: WindowBounds,
    phase: WindowPhase,
    revision: u32,
    groups: Vec<(GroupKey, GroupState)>,
    index: HashMap<GroupKey, usize>,
}

impl WindowState {
    fn new(bounds: WindowBounds, phase: WindowPhase, revision: u32) -> Self {
        Self {
            bounds,
            phase,
            revision,
            groups: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn fold(&mut self, spec: &GroupSpec, key: GroupKey, doc: &Document) -> Result<(), FoldError> {
        if let Some(&i) = self.index.get(&key) {
            return self.groups[i].1.fold(spec, doc);
        }
        // A new group only exists once its first document folds cleanly.
        let mut state = GroupState::new(spec);
        state.fold(spec, doc)?;
        self.index.insert(key.clone(), self.groups.len());
        self.groups.push((key, state));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WindowStore
// ---------------------------------------------------------------------------

/// Window state owned by one worker: every window of its partition, keyed by
/// window id.
#[derive(Debug)]
pub struct WindowStore {
    assigner: WindowAssigner,
    lateness_ms: i64,
    late_policy: LatePolicy,
    retention_ms: i64,
    group: GroupSpec,
    windows: BTreeMap<WindowId, WindowState>,
    watermark: i64,
    /// Highest end of any evicted window.
    evicted_through: Option<i64>,
}

impl WindowStore {
    pub fn new(spec: &WindowSpec) -> Self {
        Self {
            assigner: WindowAssigner::new(spec.size_millis()),
            lateness_ms: spec.allowed_lateness.as_millis_i64(),
            late_policy: spec.late_policy,
            retention_ms: i64::try_from(spec.revise_retention.as_millis()).unwrap_or(i64::MAX),
            group: spec.group.clone(),
            windows: BTreeMap::new(),
            watermark: NO_WATERMARK,
            evicted_through: None,
        }
    }

    pub fn assigner(&self) -> &WindowAssigner {
        &self.assigner
    }

    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    /// Windows currently held, in any phase.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn phase(&self, window: WindowId) -> Option<WindowPhase> {
        self.windows.get(&window).map(|w| w.phase)
    }

    /// A window is closed once `end + allowed_lateness <= watermark`, or when
    /// a window at or past it has already been evicted.
    fn is_closed(&self, bounds: &WindowBounds) -> bool {
        bounds.end_ms.saturating_add(self.lateness_ms) <= self.watermark
            || self.evicted_through.is_some_and(|e| bounds.end_ms <= e)
    }

    /// A closed window absent from the store whose retention has run out.
    /// Every evicted window qualifies.
    fn past_retention(&self, id: WindowId, bounds: &WindowBounds) -> bool {
        !self.windows.contains_key(&id)
            && bounds
                .end_ms
                .saturating_add(self.lateness_ms)
                .saturating_add(self.retention_ms)
                <= self.watermark
    }

    /// Assign `doc` to its window and fold it into the group `key`.
    pub fn fold(&mut self, key: GroupKey, doc: &Document) -> FoldOutcome {
        let id = self.assigner.assign(doc.event_time_ms());
        let bounds = self.assigner.bounds(id);

        if !self.is_closed(&bounds) {
            let window = self
                .windows
                .entry(id)
                .or_insert_with(|| WindowState::new(bounds, WindowPhase::Open, 0));
            return match window.fold(&self.group, key, doc) {
                Ok(()) => FoldOutcome::Folded,
                Err(e) => FoldOutcome::Rejected(e),
            };
        }

        if self.late_policy != LatePolicy::Revise {
            return FoldOutcome::Late(bounds);
        }

        // Revise folds into retained state only. Once a window is past
        // retention its aggregate lives in the sink alone, and a partial
        // revision would overwrite it.
        if self.past_retention(id, &bounds) {
            return FoldOutcome::Late(bounds);
        }
        let window = self
            .windows
            .entry(id)
            .or_insert_with(|| WindowState::new(bounds, WindowPhase::Closing, 0));
        match window.fold(&self.group, key, doc) {
            Ok(()) => {
                if window.phase == WindowPhase::Emitted {
                    window.revision += 1;
                }
                window.phase = WindowPhase::Closing;
                FoldOutcome::Revised(bounds)
            }
            Err(e) => FoldOutcome::Rejected(e),
        }
    }

    /// Advance the watermark and move every open window it passes to
    /// `Closing`. Returns the number of windows closed.
    pub fn advance(&mut self, watermark: i64) -> usize {
        self.watermark = self.watermark.max(watermark);
        let wm = self.watermark;
        let lateness = self.lateness_ms;
        let mut closed = 0;
        for w in self.windows.values_mut() {
            if w.phase == WindowPhase::Open && w.bounds.end_ms.saturating_add(lateness) <= wm {
                w.phase = WindowPhase::Closing;
                closed += 1;
            }
        }
        closed
    }

    /// Close every open window regardless of the watermark.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for w in self.windows.values_mut() {
            if w.phase == WindowPhase::Open {
                w.phase = WindowPhase::Closing;
                closed += 1;
            }
        }
        closed
    }

    /// Final values of every `Closing` window, oldest first.
    pub fn closing(&self) -> Vec<WindowEmission> {
        self.windows
            .iter()
            .filter(|(_, w)| w.phase == WindowPhase::Closing)
            .map(|(id, w)| WindowEmission {
                window: *id,
                bounds: w.bounds,
                revision: w.revision,
                groups: w
                    .groups
                    .iter()
                    .map(|(key, state)| (key.clone(), state.finalize(&self.group)))
                    .collect(),
            })
            .collect()
    }

    /// Record that every record of `window` was acknowledged.
    pub fn mark_emitted(&mut self, window: WindowId) {
        if let Some(w) = self.windows.get_mut(&window)
            && w.phase == WindowPhase::Closing
        {
            w.phase = WindowPhase::Emitted;
        }
    }

    /// Free emitted windows. Under `revise` they stay for the retention
    /// period past their close. Returns the number of windows evicted.
    pub fn evict(&mut self) -> usize {
        let wm = self.watermark;
        let keep_for = (self.late_policy == LatePolicy::Revise)
            .then(|| self.lateness_ms.saturating_add(self.retention_ms));

        let expired: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|(_, w)| {
                w.phase == WindowPhase::Emitted
                    && keep_for.is_none_or(|k| w.bounds.end_ms.saturating_add(k) <= wm)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(w) = self.windows.remove(id) {
                self.evicted_through = Some(
                    self.evicted_through
                        .map_or(w.bounds.end_ms, |e| e.max(w.bounds.end_ms)),
                );
            }
        }
        expired.len()
    }

    /// Drop all window state.
    pub fn release(&mut self) {
        self.windows.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rill_config::{AccumulatorOp, AccumulatorSpec, HumanDuration};
    use rill_lang::{Expr, FieldPath};
    use serde_json::json;
    use std::time::Duration;

    fn spec(lateness_ms: u64, policy: LatePolicy) -> WindowSpec {
        WindowSpec {
            size: Duration::from_secs(3),
            watermark: HumanDuration::from(Duration::ZERO),
            allowed_lateness: HumanDuration::from(Duration::from_millis(lateness_ms)),
            late_policy: policy,
            revise_retention: Duration::from_secs(3),
            group: GroupSpec {
                key: Expr::Field(FieldPath::from_dotted("color")),
                accumulators: vec![AccumulatorSpec {
                    name: "n".into(),
                    op: AccumulatorOp::Sum,
                    expr: Expr::Field(FieldPath::from_dotted("x")),
                }],
            },
        }
    }

    fn doc(t: i64, color: &str, x: Value) -> (GroupKey, Document) {
        let d = Document::from_value(json!({"color": color, "x": x}), None, t, 0).unwrap();
        (GroupKey::new(json!(color)), d)
    }

    fn fold(store: &mut WindowStore, t: i64, color: &str, x: Value) -> FoldOutcome {
        let (k, d) = doc(t, color, x);
        store.fold(k, &d)
    }

    fn sums(e: &WindowEmission) -> Vec<(Value, Value)> {
        e.groups
            .iter()
            .map(|(k, f)| (k.value().clone(), f["n"].clone()))
            .collect()
    }

    #[test]
    fn colors_in_one_window() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Drop));
        assert_eq!(fold(&mut s, 0, "red", json!(1)), FoldOutcome::Folded);
        assert_eq!(fold(&mut s, 1000, "red", json!(2)), FoldOutcome::Folded);
        assert_eq!(fold(&mut s, 2000, "blue", json!(4)), FoldOutcome::Folded);

        assert_eq!(s.advance(2999), 0);
        assert!(s.closing().is_empty());

        assert_eq!(s.advance(3000), 1);
        let out = s.closing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].revision, 0);
        assert_eq!(
            sums(&out[0]),
            vec![(json!("red"), json!(3)), (json!("blue"), json!(4))]
        );

        s.mark_emitted(out[0].window);
        assert_eq!(s.phase(out[0].window), Some(WindowPhase::Emitted));
        assert_eq!(s.evict(), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn closing_survives_until_acknowledged() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Drop));
        fold(&mut s, 0, "red", json!(1));
        s.advance(3000);
        // Not acknowledged: stays closing and is offered again.
        assert_eq!(s.evict(), 0);
        assert_eq!(s.closing().len(), 1);
        assert_eq!(s.phase(WindowId(0)), Some(WindowPhase::Closing));
    }

    #[test]
    fn allowed_lateness_delays_close() {
        let mut s = WindowStore::new(&spec(1000, LatePolicy::Drop));
        fold(&mut s, 100, "red", json!(1));
        assert_eq!(s.advance(3500), 0);
        // Still inside the grace period.
        assert_eq!(fold(&mut s, 200, "red", json!(1)), FoldOutcome::Folded);
        assert_eq!(s.advance(4000), 1);
        assert_eq!(sums(&s.closing()[0]), vec![(json!("red"), json!(2))]);
    }

    #[test]
    fn late_document_reported_after_close() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Dlq));
        fold(&mut s, 0, "red", json!(1));
        s.advance(3000);
        s.mark_emitted(WindowId(0));
        s.evict();
        let out = fold(&mut s, 10, "red", json!(9));
        assert_eq!(
            out,
            FoldOutcome::Late(WindowBounds {
                start_ms: 0,
                end_ms: 3000
            })
        );
        assert!(s.is_empty());
    }

    #[test]
    fn revise_reuses_retained_window() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Revise));
        fold(&mut s, 0, "red", json!(1));
        s.advance(3000);
        s.mark_emitted(WindowId(0));
        // Retained: 3000 + 0 + 3000 > 3000.
        assert_eq!(s.evict(), 0);

        assert!(matches!(fold(&mut s, 10, "red", json!(5)), FoldOutcome::Revised(_)));
        let out = s.closing();
        assert_eq!(out[0].revision, 1);
        assert_eq!(sums(&out[0]), vec![(json!("red"), json!(6))]);

        s.mark_emitted(WindowId(0));
        s.advance(6000);
        assert_eq!(s.evict(), 1);

        // Past retention the sink holds the only copy of the aggregate.
        assert_eq!(
            fold(&mut s, 20, "red", json!(7)),
            FoldOutcome::Late(WindowBounds {
                start_ms: 0,
                end_ms: 3000
            })
        );
        assert!(s.is_empty());
        assert!(s.closing().is_empty());
    }

    #[test]
    fn revise_opens_unseen_window_within_retention() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Revise));
        fold(&mut s, 3500, "red", json!(1));
        s.advance(4000);
        // Window [0, 3000) is closed but never held data, so nothing was
        // emitted for it yet.
        assert!(matches!(fold(&mut s, 10, "red", json!(2)), FoldOutcome::Revised(_)));
        let out = s.closing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].revision, 0);
        assert_eq!(sums(&out[0]), vec![(json!("red"), json!(2))]);
    }

    #[test]
    fn rejected_fold_leaves_no_group() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Drop));
        assert!(matches!(
            fold(&mut s, 0, "red", json!("22")),
            FoldOutcome::Rejected(_)
        ));
        fold(&mut s, 0, "blue", json!(4));
        s.advance(3000);
        assert_eq!(sums(&s.closing()[0]), vec![(json!("blue"), json!(4))]);
    }

    #[test]
    fn close_all_flushes_open_windows() {
        let mut s = WindowStore::new(&spec(0, LatePolicy::Drop));
        fold(&mut s, 0, "red", json!(1));
        fold(&mut s, 9000, "red", json!(2));
        assert_eq!(s.close_all(), 2);
        let out = s.closing();
        assert_eq!(out.len(), 2);
        assert!(out[0].bounds.start_ms < out[1].bounds.start_ms);
        s.release();
        assert!(s.is_empty());
    }
}
