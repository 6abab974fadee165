//! Sitemap diff: what to crawl and what to delete since the last run.

use serde::{Deserialize, Serialize};
use siteindexer_shared::TaskSet;

/// Additions and deletions between the live sitemap and the baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDiff {
    /// Live tasks absent from the baseline, including URLs whose lastmod
    /// changed.
    pub to_add: TaskSet,
    /// Baseline tasks absent from the live set, including stale versions of
    /// URLs that are still listed.
    pub to_delete: TaskSet,
}

impl TaskDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }

    /// Cap the additions to the first `cap` tasks in set order. Deletions are
    /// never capped.
    pub fn sample(self, cap: Option<usize>) -> Self {
        match cap {
            Some(cap) if cap < self.to_add.len() => Self {
                to_add: self.to_add.prefix(cap),
                to_delete: self.to_delete,
            },
            _ => self,
        }
    }
}

/// Compare `live` against `cached` by `(url, lastmod)` identity.
pub fn diff(live: &TaskSet, cached: &TaskSet) -> TaskDiff {
    TaskDiff {
        to_add: live.difference(cached),
        to_delete: cached.difference(live),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use siteindexer_shared::Task;

    use super::*;

    fn t(url: &str, date: &str) -> Task {
        Task::new(
            url,
            NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        )
    }

    fn set(tasks: &[Task]) -> TaskSet {
        tasks.iter().cloned().collect()
    }

    #[test]
    fn changed_lastmod_is_add_and_delete() {
        let live = set(&[t("/a", "2024-01-01"), t("/b", "2024-01-02")]);
        let cached = set(&[t("/a", "2024-01-01"), t("/c", "2023-12-01")]);

        let d = diff(&live, &cached);
        assert_eq!(d.to_add, set(&[t("/b", "2024-01-02")]));
        assert_eq!(d.to_delete, set(&[t("/c", "2023-12-01")]));

        let live = set(&[t("/a", "2024-02-01")]);
        let cached = set(&[t("/a", "2024-01-01")]);
        let d = diff(&live, &cached);
        assert_eq!(d.to_add, live);
        assert_eq!(d.to_delete, cached);
    }

    #[test]
    fn identical_and_first_run() {
        let live = set(&[t("/a", "2024-01-01"), t("/b", "2024-01-02")]);

        assert!(diff(&live, &live).is_empty());

        let first = diff(&live, &TaskSet::new());
        assert_eq!(first.to_add, live);
        assert!(first.to_delete.is_empty());
    }

    #[test]
    fn sample_is_a_stable_prefix() {
        let live: TaskSet = (1..=5)
            .map(|i| t(&format!("/p{i}"), "2024-01-01"))
            .collect();
        let d = diff(&live, &TaskSet::new());

        let a = d.clone().sample(Some(1));
        let b = d.clone().sample(Some(1));
        assert_eq!(a.to_add.len(), 1);
        assert_eq!(a, b);
        assert_eq!(a.to_add.iter().next(), live.iter().next());

        assert_eq!(d.clone().sample(None), d);
        assert_eq!(d.clone().sample(Some(10)), d);
    }
}
