//! Path-prefix retry policy for items not yet indexed on a target.

use crate::config::PathSyncPolicy;

/// Resolved retry budget for one item path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `-1` = unbounded, `0` = fail immediately.
    pub max_attempts: i64,
    pub delay_seconds: i64,
}

impl RetryPolicy {
    pub const FAIL_FAST: RetryPolicy = RetryPolicy {
        max_attempts: 0,
        delay_seconds: 0,
    };

    pub fn is_unbounded(&self) -> bool {
        self.max_attempts == -1
    }
}

/// Longest-prefix policy selection. Consulted only when an item is absent
/// on the target; no matching rule means the event fails immediately.
pub struct PolicyEngine {
    rules: Vec<PathSyncPolicy>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PathSyncPolicy>) -> Self {
        Self { rules }
    }

    pub fn policy_for(&self, path: Option<&str>) -> RetryPolicy {
        let Some(path) = path else {
            return RetryPolicy::FAIL_FAST;
        };

        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| RetryPolicy {
                max_attempts: rule.absent_retry_count,
                delay_seconds: rule.retry_delay_seconds,
            })
            .unwrap_or(RetryPolicy::FAIL_FAST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(prefix: &str, count: i64, delay: i64) -> PathSyncPolicy {
        PathSyncPolicy {
            prefix: prefix.into(),
            absent_retry_count: count,
            retry_delay_seconds: delay,
        }
    }

    #[test]
    fn test_no_rules_fails_fast() {
        let engine = PolicyEngine::new(vec![]);
        assert_eq!(
            engine.policy_for(Some("/mnt/nfs/movies/x.mkv")),
            RetryPolicy::FAIL_FAST
        );
    }

    #[test]
    fn test_no_path_fails_fast() {
        let engine = PolicyEngine::new(vec![rule("/mnt", -1, 60)]);
        assert_eq!(engine.policy_for(None), RetryPolicy::FAIL_FAST);
    }

    #[test]
    fn test_exact_prefix_match() {
        let engine = PolicyEngine::new(vec![rule("/mnt/nfs/movies", 2, 600)]);
        let policy = engine.policy_for(Some("/mnt/nfs/movies/x.mkv"));
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.delay_seconds, 600);
    }

    #[test]
    fn test_path_equal_to_prefix_matches() {
        let engine = PolicyEngine::new(vec![rule("/mnt/nfs/movies", 3, 60)]);
        assert_eq!(engine.policy_for(Some("/mnt/nfs/movies")).max_attempts, 3);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let engine = PolicyEngine::new(vec![
            rule("/mnt", 1, 60),
            rule("/mnt/nfs/movies", 5, 600),
            rule("/mnt/nfs", 3, 300),
        ]);
        let policy = engine.policy_for(Some("/mnt/nfs/movies/x.mkv"));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_seconds, 600);
    }

    #[test]
    fn test_longest_prefix_order_independent() {
        let forward = PolicyEngine::new(vec![rule("/a", 1, 1), rule("/a/b", 2, 2)]);
        let reverse = PolicyEngine::new(vec![rule("/a/b", 2, 2), rule("/a", 1, 1)]);
        assert_eq!(
            forward.policy_for(Some("/a/b/c")),
            reverse.policy_for(Some("/a/b/c"))
        );
        assert_eq!(forward.policy_for(Some("/a/b/c")).max_attempts, 2);
    }

    #[test]
    fn test_non_matching_prefix_fails_fast() {
        let engine = PolicyEngine::new(vec![rule("/mnt/nfs/movies", 2, 600)]);
        assert_eq!(
            engine.policy_for(Some("/srv/media/x.mkv")),
            RetryPolicy::FAIL_FAST
        );
    }

    #[test]
    fn test_unbounded_policy() {
        let engine = PolicyEngine::new(vec![rule("/mnt", -1, 120)]);
        let policy = engine.policy_for(Some("/mnt/x.mkv"));
        assert!(policy.is_unbounded());
        assert_eq!(policy.delay_seconds, 120);
    }
}
