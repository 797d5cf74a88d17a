//! Redundancy groups: a low/high-priority queue pair shared by every
//! connection whose peer address matches the group's allow-list, grounded
//! on `original_source`'s `CS104_RedundancyGroup` and
//! `getMatchingRedundancyGroup`.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use crate::config::QueueConfig;
use crate::ip::AllowedClient;
use crate::queue::{HighPriorityQueue, LowPriorityQueue};

pub struct RedundancyGroup {
    pub name: Option<String>,
    allowed_clients: Vec<AllowedClient>,
    pub low_priority: Mutex<LowPriorityQueue>,
    pub high_priority: Mutex<HighPriorityQueue>,
}

impl RedundancyGroup {
    pub fn new(name: Option<String>, allowed_clients: Vec<AllowedClient>, queue: QueueConfig) -> Self {
        RedundancyGroup {
            name,
            allowed_clients,
            low_priority: Mutex::new(LowPriorityQueue::new(queue.low_priority_capacity_bytes)),
            high_priority: Mutex::new(HighPriorityQueue::new(queue.high_priority_capacity_entries)),
        }
    }

    /// A group with no allow-list matches any peer (the "catch-all" group).
    pub fn is_catch_all(&self) -> bool {
        self.allowed_clients.is_empty()
    }

    pub fn matches(&self, peer: IpAddr) -> bool {
        self.allowed_clients.iter().any(|c| c.matches(peer))
    }
}

/// Resolves the redundancy group a newly accepted connection belongs to:
/// first allow-list match wins, falling back to the first catch-all group.
pub fn resolve_group<'a>(
    groups: &'a [Arc<RedundancyGroup>],
    peer: IpAddr,
) -> Option<&'a Arc<RedundancyGroup>> {
    groups
        .iter()
        .find(|g| !g.is_catch_all() && g.matches(peer))
        .or_else(|| groups.iter().find(|g| g.is_catch_all()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn group(allowed: Vec<&str>) -> Arc<RedundancyGroup> {
        Arc::new(RedundancyGroup::new(
            None,
            allowed
                .into_iter()
                .map(|s| AllowedClient(s.parse().unwrap()))
                .collect(),
            QueueConfig::default(),
        ))
    }

    #[test]
    fn matches_by_allow_list_before_catch_all() {
        let groups = vec![group(vec!["10.0.0.1"]), group(vec![])];
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let resolved = resolve_group(&groups, peer).unwrap();
        assert!(!resolved.is_catch_all());
    }

    #[test]
    fn falls_back_to_catch_all() {
        let groups = vec![group(vec!["10.0.0.1"]), group(vec![])];
        let peer = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5));
        let resolved = resolve_group(&groups, peer).unwrap();
        assert!(resolved.is_catch_all());
    }

    #[test]
    fn no_match_and_no_catch_all_rejects() {
        let groups = vec![group(vec!["10.0.0.1"])];
        let peer = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 5));
        assert!(resolve_group(&groups, peer).is_none());
    }
}
