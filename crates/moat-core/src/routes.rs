//! Process-wide routing table
//!
//! Maps agent names to their exposed service endpoints. An external routing
//! proxy consumes this to forward `name.localhost` traffic; the core only
//! registers and unregisters entries. Add/remove are serialized by the
//! table's own lock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One exposed service of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub host_port: u16,
}

/// Shared routing table, `agent-name -> endpoints`
#[derive(Debug, Default)]
pub struct RoutingTable {
    inner: Mutex<HashMap<String, Vec<ServiceEndpoint>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the endpoints for a name
    pub fn register(&self, name: &str, endpoints: Vec<ServiceEndpoint>) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(name.to_string(), endpoints);
    }

    /// Remove a name; removing an absent name is a no-op
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    pub fn endpoints(&self, name: &str) -> Option<Vec<ServiceEndpoint>> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let table = RoutingTable::new();
        table.register(
            "agent-a",
            vec![ServiceEndpoint {
                service: "web".to_string(),
                host_port: 49321,
            }],
        );
        assert!(table.contains("agent-a"));
        assert_eq!(table.endpoints("agent-a").unwrap()[0].host_port, 49321);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let table = RoutingTable::new();
        table.unregister("ghost");
        assert!(!table.contains("ghost"));
    }

    #[test]
    fn test_register_replaces() {
        let table = RoutingTable::new();
        table.register(
            "agent-a",
            vec![ServiceEndpoint {
                service: "web".to_string(),
                host_port: 1,
            }],
        );
        table.register(
            "agent-a",
            vec![ServiceEndpoint {
                service: "web".to_string(),
                host_port: 2,
            }],
        );
        assert_eq!(table.endpoints("agent-a").unwrap()[0].host_port, 2);
    }
}
