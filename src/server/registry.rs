//! Registry of live agent sessions, keyed by subdomain.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Tracks which subdomains currently have a connected agent.
///
/// The sockets themselves are owned by their sessions; the registry only
/// enforces the one-agent-per-subdomain rule and remembers the optional
/// client id for logging.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
}

struct AgentEntry {
    client_id: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims `subdomain` for a new session.
    ///
    /// Returns false when another agent already holds it, in which case the
    /// existing session is left untouched.
    pub fn try_add(&self, subdomain: &str, client_id: Option<String>) -> bool {
        match self.agents.entry(subdomain.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(AgentEntry { client_id });
                true
            }
        }
    }

    /// Releases `subdomain`. Safe to call for subdomains that were never
    /// added or were already removed.
    pub fn remove(&self, subdomain: &str) {
        self.agents.remove(subdomain);
    }

    pub fn has(&self, subdomain: &str) -> bool {
        self.agents.contains_key(subdomain)
    }

    /// Client id the agent announced at connect time, if any.
    pub fn client_id(&self, subdomain: &str) -> Option<String> {
        self.agents
            .get(subdomain)
            .and_then(|entry| entry.client_id.clone())
    }

    pub fn subdomains(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
