//! Anti-echo cooldowns.
//!
//! After a field is written to node T, the same `(user, item, field)`
//! tuple arriving *from* T within the cooldown window is the write coming
//! back around, not a new user action. Keys use the cross-node item
//! identity (path or provider tuple) so the check runs before any remote
//! resolution. Deadlines live on a monotonic clock; wall-clock jumps must
//! not reopen the loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_COOLDOWN_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    node: String,
    username: String,
    item_key: String,
    field: &'static str,
}

#[derive(Debug)]
pub struct CooldownMap {
    ttl: Duration,
    entries: HashMap<CooldownKey, Instant>,
}

impl CooldownMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn key(node: &str, username: &str, item_key: &str, field: &'static str) -> CooldownKey {
        CooldownKey {
            node: node.to_string(),
            username: username.to_lowercase(),
            item_key: item_key.to_string(),
            field,
        }
    }

    /// Arm the tuple after a successful apply to `node`.
    pub fn arm(&mut self, node: &str, username: &str, item_key: &str, field: &'static str) {
        self.entries
            .insert(Self::key(node, username, item_key, field), Instant::now() + self.ttl);
    }

    /// True while the tuple's deadline has not passed. Expired entries are
    /// removed on probe.
    pub fn is_active(
        &mut self,
        node: &str,
        username: &str,
        item_key: &str,
        field: &'static str,
    ) -> bool {
        let key = Self::key(node, username, item_key, field);
        match self.entries.get(&key) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry; called once per worker tick.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, deadline| now < *deadline);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CooldownMap {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_COOLDOWN_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_tuple_is_active() {
        let mut map = CooldownMap::default();
        map.arm("lan", "alice", "path:/mnt/x.mkv", "position");
        assert!(map.is_active("lan", "alice", "path:/mnt/x.mkv", "position"));
    }

    #[test]
    fn test_unarmed_tuple_is_inactive() {
        let mut map = CooldownMap::default();
        assert!(!map.is_active("lan", "alice", "path:/mnt/x.mkv", "position"));
    }

    #[test]
    fn test_different_field_is_independent() {
        let mut map = CooldownMap::default();
        map.arm("lan", "alice", "path:/mnt/x.mkv", "position");
        assert!(!map.is_active("lan", "alice", "path:/mnt/x.mkv", "played"));
    }

    #[test]
    fn test_different_node_is_independent() {
        let mut map = CooldownMap::default();
        map.arm("lan", "alice", "path:/mnt/x.mkv", "position");
        assert!(!map.is_active("wan", "alice", "path:/mnt/x.mkv", "position"));
    }

    #[test]
    fn test_username_match_is_case_insensitive() {
        let mut map = CooldownMap::default();
        map.arm("lan", "Alice", "path:/mnt/x.mkv", "position");
        assert!(map.is_active("lan", "alice", "path:/mnt/x.mkv", "position"));
    }

    #[test]
    fn test_expired_entry_is_inactive_and_removed() {
        let mut map = CooldownMap::new(Duration::ZERO);
        map.arm("lan", "alice", "path:/mnt/x.mkv", "position");
        assert!(!map.is_active("lan", "alice", "path:/mnt/x.mkv", "position"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_sweep_drops_expired_only() {
        let mut map = CooldownMap::new(Duration::ZERO);
        map.arm("lan", "alice", "path:/a", "position");
        let mut live = CooldownMap::default();
        live.arm("lan", "alice", "path:/a", "position");

        map.sweep();
        live.sweep();
        assert!(map.is_empty());
        assert_eq!(live.len(), 1);
    }
}
