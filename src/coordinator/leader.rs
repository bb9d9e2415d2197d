//! Leadership role tracking
//!
//! Election happens elsewhere; this only records what this server was told
//! about its role so the leadership hook can ignore duplicate transitions.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderRole {
    Follower,
    Leader,
}

impl std::fmt::Display for LeaderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderRole::Follower => write!(f, "follower"),
            LeaderRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug)]
struct RoleState {
    role: LeaderRole,
    term: u64,
    leader_id: Option<String>,
}

/// This server's view of the current leader
#[derive(Debug)]
pub struct LeaderState {
    node_id: String,
    state: Mutex<RoleState>,
}

impl LeaderState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(RoleState {
                role: LeaderRole::Follower,
                term: 0,
                leader_id: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.lock().role == LeaderRole::Leader
    }

    pub fn get_role(&self) -> LeaderRole {
        self.lock().role
    }

    pub fn get_term(&self) -> u64 {
        self.lock().term
    }

    pub fn get_leader(&self) -> Option<String> {
        self.lock().leader_id.clone()
    }

    /// Take leadership for `term`. Returns false if already leader or the
    /// term is older than one already seen.
    pub fn become_leader(&self, term: u64) -> bool {
        let mut state = self.lock();
        if term < state.term || (state.role == LeaderRole::Leader && term == state.term) {
            return false;
        }
        state.role = LeaderRole::Leader;
        state.term = term;
        state.leader_id = Some(self.node_id.clone());
        true
    }

    /// Step down to follower. Returns false if this server was not leader.
    pub fn step_down(&self, term: u64, leader_id: Option<String>) -> bool {
        let mut state = self.lock();
        let was_leader = state.role == LeaderRole::Leader;
        state.role = LeaderRole::Follower;
        state.term = state.term.max(term);
        state.leader_id = leader_id;
        was_leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_transitions() {
        let leader = LeaderState::new("server-1");
        assert_eq!(leader.get_role(), LeaderRole::Follower);
        assert!(leader.become_leader(3));
        assert!(!leader.become_leader(3));
        assert_eq!(leader.get_leader().as_deref(), Some("server-1"));
        assert_eq!(leader.get_role().to_string(), "leader");

        assert!(leader.step_down(4, Some("server-2".into())));
        assert!(!leader.step_down(4, None));
        assert_eq!(leader.get_term(), 4);
        assert!(!leader.become_leader(2));
        assert!(leader.become_leader(5));
    }
}
