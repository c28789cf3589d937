//! Traversal constraints: time window and count limits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Limits a traversal honors when merging new objects.
///
/// Unset dimensions are unbounded. The time window is pushed down to
/// stores that support it; count limits are enforced by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraint {
    /// Inclusive start of the time window.
    pub start: Option<DateTime<Utc>>,

    /// Inclusive end of the time window.
    pub end: Option<DateTime<Utc>>,

    /// Maximum objects stored per class node.
    pub limit_per_class: Option<usize>,

    /// Maximum objects merged from stores across the whole traversal.
    /// Seed objects do not count against this limit.
    pub limit_total: Option<usize>,

    /// Maximum objects taken from any single query resolution.
    pub limit_per_step: Option<usize>,
}

impl Constraint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_limit_per_class(mut self, limit: usize) -> Self {
        self.limit_per_class = Some(limit);
        self
    }

    pub fn with_limit_total(mut self, limit: usize) -> Self {
        self.limit_total = Some(limit);
        self
    }

    pub fn with_limit_per_step(mut self, limit: usize) -> Self {
        self.limit_per_step = Some(limit);
        self
    }

    /// True when `t` falls inside the window.
    pub fn allows_time(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t <= e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_unbounded_allows_everything() {
        let c = Constraint::default();
        assert!(c.allows_time(Utc::now()));
        assert_eq!(c.limit_total, None);
    }

    #[test]
    fn test_window_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let c = Constraint::new().with_window(start, end);

        assert!(c.allows_time(start));
        assert!(c.allows_time(end));
        assert!(!c.allows_time(end + chrono::Duration::seconds(1)));
        assert!(!c.allows_time(start - chrono::Duration::seconds(1)));
    }
}
