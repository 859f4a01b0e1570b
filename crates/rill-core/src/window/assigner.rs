use serde_json::{Map, Value};

use crate::document::format_millis;

/// Index of a tumbling window: `floor(event_time / size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub i64);

/// Half-open event-time range `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowBounds {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl WindowBounds {
    pub fn contains(&self, t: i64) -> bool {
        self.start_ms <= t && t < self.end_ms
    }

    /// `{ start, end }` as RFC 3339 strings.
    pub fn to_value(&self) -> Value {
        let mut m = Map::new();
        m.insert("start".into(), format_millis(self.start_ms));
        m.insert("end".into(), format_millis(self.end_ms));
        Value::Object(m)
    }
}

/// Maps event times onto fixed-size, non-overlapping windows.
#[derive(Debug, Clone, Copy)]
pub struct WindowAssigner {
    size_ms: i64,
}

impl WindowAssigner {
    /// `size_ms` is clamped to at least 1.
    pub fn new(size_ms: i64) -> Self {
        Self {
            size_ms: size_ms.max(1),
        }
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Floor division, so negative event times land in the window below zero.
    pub fn assign(&self, event_time_ms: i64) -> WindowId {
        WindowId(event_time_ms.div_euclid(self.size_ms))
    }

    pub fn bounds(&self, id: WindowId) -> WindowBounds {
        let start_ms = id.0.saturating_mul(self.size_ms);
        WindowBounds {
            start_ms,
            end_ms: start_ms.saturating_add(self.size_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assign_positive_times() {
        let a = WindowAssigner::new(3000);
        assert_eq!(a.assign(0), WindowId(0));
        assert_eq!(a.assign(2999), WindowId(0));
        assert_eq!(a.assign(3000), WindowId(1));
        assert_eq!(
            a.bounds(WindowId(1)),
            WindowBounds {
                start_ms: 3000,
                end_ms: 6000
            }
        );
    }

    #[test]
    fn assign_negative_times_floors() {
        let a = WindowAssigner::new(1000);
        assert_eq!(a.assign(-1), WindowId(-1));
        assert_eq!(a.assign(-1000), WindowId(-1));
        assert_eq!(a.assign(-1001), WindowId(-2));
        assert!(a.bounds(a.assign(-1)).contains(-1));
    }

    #[test]
    fn windows_partition_time_without_overlap() {
        let a = WindowAssigner::new(7);
        for t in -50..50 {
            let b = a.bounds(a.assign(t));
            assert!(b.contains(t), "{t} not in {b:?}");
            // The neighbouring windows never contain t.
            assert!(!a.bounds(WindowId(a.assign(t).0 + 1)).contains(t));
            assert!(!a.bounds(WindowId(a.assign(t).0 - 1)).contains(t));
        }
    }

    #[test]
    fn bounds_render_rfc3339() {
        let a = WindowAssigner::new(3000);
        assert_eq!(
            a.bounds(WindowId(0)).to_value(),
            json!({"start": "1970-01-01T00:00:00.000Z", "end": "1970-01-01T00:00:03.000Z"})
        );
    }
}
