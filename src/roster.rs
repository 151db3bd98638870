//! Known-agent roster: stable agent id to session key and display name.
//!
//! The roster is the daemon's view of "every agent worth polling". It is
//! loaded from config at startup; delivery correctness lives in the
//! notification rows, so a restart with an updated roster simply picks up
//! whatever is still undelivered.

use crate::config::AgentEntry;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Roster {
    entries: Vec<AgentEntry>,
    by_id: HashMap<String, usize>,
}

impl Roster {
    pub fn from_entries(entries: Vec<AgentEntry>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id.clone(), index))
            .collect();
        Self { entries, by_id }
    }

    /// Agent ids in roster order.
    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.id.as_str())
    }

    /// Gateway session key for an agent, if one is configured.
    pub fn session_key_for(&self, agent_id: &str) -> Option<&str> {
        self.by_id
            .get(agent_id)
            .and_then(|&index| self.entries[index].session_key.as_deref())
    }

    /// Display name for an agent, falling back to the raw id for agents
    /// outside the roster or without a configured name.
    pub fn display_name<'a>(&'a self, agent_id: &'a str) -> &'a str {
        self.by_id
            .get(agent_id)
            .and_then(|&index| self.entries[index].name.as_deref())
            .unwrap_or(agent_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: Option<&str>, session_key: Option<&str>) -> AgentEntry {
        AgentEntry {
            id: id.to_string(),
            name: name.map(String::from),
            session_key: session_key.map(String::from),
        }
    }

    #[test]
    fn looks_up_session_keys_and_names() {
        let roster = Roster::from_entries(vec![
            entry("jarvis", Some("Jarvis"), Some("agent:jarvis:main")),
            entry("designer", None, None),
        ]);

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.session_key_for("jarvis"), Some("agent:jarvis:main"));
        assert_eq!(roster.session_key_for("designer"), None);
        assert_eq!(roster.session_key_for("ghost"), None);
        assert_eq!(roster.display_name("jarvis"), "Jarvis");
        assert_eq!(roster.display_name("designer"), "designer");
        assert_eq!(roster.display_name("ghost"), "ghost");
    }

    #[test]
    fn iterates_in_roster_order() {
        let roster = Roster::from_entries(vec![
            entry("b", None, None),
            entry("a", None, None),
        ]);
        let ids: Vec<&str> = roster.agent_ids().collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
