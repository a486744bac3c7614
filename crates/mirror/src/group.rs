//! Connection groups for fan-out sends.

use std::collections::{HashMap, HashSet};

use crate::control::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u16);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group:{}", self.0)
    }
}

/// The built-in group holding every current connection. Always exists and
/// cannot be destroyed; membership tracks the connection table.
pub const GROUP_ALL: GroupId = GroupId(1);

#[derive(Debug)]
pub struct GroupManager {
    groups: HashMap<GroupId, HashSet<ConnId>>,
    next_id: u16,
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupManager {
    pub fn new() -> Self {
        let mut groups = HashMap::new();
        groups.insert(GROUP_ALL, HashSet::new());
        Self { groups, next_id: 2 }
    }

    pub fn create_group(&mut self) -> GroupId {
        let id = GroupId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(2);
        self.groups.insert(id, HashSet::new());
        id
    }

    /// Returns false for `GROUP_ALL` and unknown groups.
    pub fn destroy_group(&mut self, id: GroupId) -> bool {
        if id == GROUP_ALL {
            return false;
        }
        self.groups.remove(&id).is_some()
    }

    pub fn group_exists(&self, id: GroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub fn add(&mut self, id: GroupId, conn: ConnId) -> bool {
        match self.groups.get_mut(&id) {
            Some(members) => members.insert(conn),
            None => false,
        }
    }

    pub fn remove(&mut self, id: GroupId, conn: ConnId) -> bool {
        match self.groups.get_mut(&id) {
            Some(members) => members.remove(&conn),
            None => false,
        }
    }

    pub fn contains(&self, id: GroupId, conn: ConnId) -> bool {
        self.groups.get(&id).is_some_and(|m| m.contains(&conn))
    }

    pub fn len(&self, id: GroupId) -> usize {
        self.groups.get(&id).map_or(0, HashSet::len)
    }

    pub fn is_empty(&self, id: GroupId) -> bool {
        self.len(id) == 0
    }

    pub fn members(&self, id: GroupId) -> Vec<ConnId> {
        self.groups
            .get(&id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Called by the control when a connection is established.
    pub(crate) fn connection_opened(&mut self, conn: ConnId) {
        if let Some(all) = self.groups.get_mut(&GROUP_ALL) {
            all.insert(conn);
        }
    }

    /// Called by the control when a connection goes away; strips the id
    /// from every group, not just `GROUP_ALL`.
    pub(crate) fn connection_closed(&mut self, conn: ConnId) {
        for members in self.groups.values_mut() {
            members.remove(&conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_all_always_exists() {
        let mut groups = GroupManager::new();
        assert!(groups.group_exists(GROUP_ALL));
        assert!(!groups.destroy_group(GROUP_ALL));
        assert!(groups.group_exists(GROUP_ALL));
    }

    #[test]
    fn group_all_tracks_connections() {
        let mut groups = GroupManager::new();
        let a = ConnId(1);
        let b = ConnId(2);
        groups.connection_opened(a);
        groups.connection_opened(b);
        assert_eq!(groups.len(GROUP_ALL), 2);

        groups.connection_closed(a);
        assert!(!groups.contains(GROUP_ALL, a));
        assert!(groups.contains(GROUP_ALL, b));
    }

    #[test]
    fn create_add_remove_destroy() {
        let mut groups = GroupManager::new();
        let g = groups.create_group();
        assert!(groups.group_exists(g));
        assert!(groups.add(g, ConnId(7)));
        assert!(groups.contains(g, ConnId(7)));
        assert!(groups.remove(g, ConnId(7)));
        assert!(!groups.remove(g, ConnId(7)));
        assert!(groups.destroy_group(g));
        assert!(!groups.group_exists(g));
        assert!(!groups.add(g, ConnId(7)));
    }

    #[test]
    fn closing_connection_strips_all_groups() {
        let mut groups = GroupManager::new();
        let g = groups.create_group();
        groups.connection_opened(ConnId(3));
        groups.add(g, ConnId(3));
        groups.connection_closed(ConnId(3));
        assert!(!groups.contains(g, ConnId(3)));
        assert!(!groups.contains(GROUP_ALL, ConnId(3)));
    }
}
