//! Endpoint lifecycle: Discovered -> Connecting -> Connected -> Disconnected.
//!
//! Disconnected is terminal for an entry: the entry is dropped and a later
//! discovery of the same id starts a fresh one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::EndpointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

impl EndpointState {
    pub fn can_transition_to(self, next: EndpointState) -> bool {
        use EndpointState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Discovered, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Discovered, Disconnected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub state: EndpointState,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint {0} is unknown")]
    Unknown(EndpointId),
    #[error("endpoint {id} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        id: EndpointId,
        from: EndpointState,
        to: EndpointState,
    },
}

/// Current endpoint entries keyed by id.
#[derive(Debug, Default, Clone)]
pub struct EndpointTable {
    entries: BTreeMap<EndpointId, Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery event. Returns true if this created a new entry.
    pub fn on_found(&mut self, id: EndpointId, name: &str) -> bool {
        match self.entries.get_mut(&id) {
            Some(existing) => {
                existing.name = name.to_string();
                false
            }
            None => {
                self.entries.insert(
                    id,
                    Endpoint {
                        id,
                        name: name.to_string(),
                        state: EndpointState::Discovered,
                    },
                );
                true
            }
        }
    }

    /// Loss event. A live connection outlives the loss of its beacon; anything else is dropped.
    pub fn on_lost(&mut self, id: EndpointId) -> Option<Endpoint> {
        match self.entries.get(&id).map(|e| e.state) {
            Some(EndpointState::Connected) | Some(EndpointState::Connecting) | None => None,
            Some(_) => self.entries.remove(&id),
        }
    }

    pub fn on_connecting(&mut self, id: EndpointId) -> Result<&Endpoint, EndpointError> {
        self.transition(id, EndpointState::Connecting)
    }

    /// Connected. An inbound connection from an endpoint we never discovered creates its entry.
    pub fn on_connected(&mut self, id: EndpointId, name: Option<&str>) -> Result<&Endpoint, EndpointError> {
        if !self.entries.contains_key(&id) {
            self.entries.insert(
                id,
                Endpoint {
                    id,
                    name: name.unwrap_or_default().to_string(),
                    state: EndpointState::Connected,
                },
            );
            return self.entries.get(&id).ok_or(EndpointError::Unknown(id));
        }
        if let (Some(name), Some(entry)) = (name, self.entries.get_mut(&id)) {
            if !name.is_empty() {
                entry.name = name.to_string();
            }
        }
        self.transition(id, EndpointState::Connected)
    }

    /// Disconnection ends the entry. Returns it with state Disconnected.
    pub fn on_disconnected(&mut self, id: EndpointId) -> Result<Endpoint, EndpointError> {
        let entry = self.entries.get(&id).ok_or(EndpointError::Unknown(id))?;
        if !entry.state.can_transition_to(EndpointState::Disconnected) {
            return Err(EndpointError::InvalidTransition {
                id,
                from: entry.state,
                to: EndpointState::Disconnected,
            });
        }
        let mut entry = self.entries.remove(&id).ok_or(EndpointError::Unknown(id))?;
        entry.state = EndpointState::Disconnected;
        Ok(entry)
    }

    fn transition(&mut self, id: EndpointId, to: EndpointState) -> Result<&Endpoint, EndpointError> {
        let entry = self.entries.get_mut(&id).ok_or(EndpointError::Unknown(id))?;
        if entry.state == to {
            return Ok(entry);
        }
        if !entry.state.can_transition_to(to) {
            return Err(EndpointError::InvalidTransition {
                id,
                from: entry.state,
                to,
            });
        }
        entry.state = to;
        Ok(entry)
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.entries.get(id)
    }

    /// All current entries (discovered, connecting or connected).
    pub fn discovered(&self) -> Vec<Endpoint> {
        self.entries.values().cloned().collect()
    }

    pub fn connected(&self) -> Vec<Endpoint> {
        self.entries
            .values()
            .filter(|e| e.state == EndpointState::Connected)
            .cloned()
            .collect()
    }

    /// Resolve an operator-typed id prefix; None if absent or ambiguous.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&Endpoint> {
        let mut hits = self.entries.values().filter(|e| e.id.matches_prefix(prefix));
        let first = hits.next()?;
        if hits.next().is_some() {
            return None;
        }
        Some(first)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn id() -> EndpointId {
        Keypair::generate().endpoint_id()
    }

    #[test]
    fn full_lifecycle() {
        let mut table = EndpointTable::new();
        let a = id();
        assert!(table.on_found(a, "Tablet A"));
        assert!(!table.on_found(a, "Tablet A (renamed)"));
        assert_eq!(table.get(&a).unwrap().name, "Tablet A (renamed)");

        assert_eq!(table.on_connecting(a).unwrap().state, EndpointState::Connecting);
        assert_eq!(table.on_connected(a, None).unwrap().state, EndpointState::Connected);
        assert_eq!(table.connected().len(), 1);

        let gone = table.on_disconnected(a).unwrap();
        assert_eq!(gone.state, EndpointState::Disconnected);
        assert!(table.get(&a).is_none());

        // Rediscovery starts a new entry.
        assert!(table.on_found(a, "Tablet A"));
        assert_eq!(table.get(&a).unwrap().state, EndpointState::Discovered);
    }

    #[test]
    fn loss_keeps_live_connections() {
        let mut table = EndpointTable::new();
        let (a, b) = (id(), id());
        table.on_found(a, "A");
        table.on_found(b, "B");
        table.on_connected(b, None).unwrap();

        assert!(table.on_lost(a).is_some());
        assert!(table.on_lost(b).is_none());
        assert_eq!(table.discovered().len(), 1);
        assert_eq!(table.connected()[0].id, b);
    }

    #[test]
    fn inbound_connection_from_unknown_endpoint_creates_entry() {
        let mut table = EndpointTable::new();
        let a = id();
        let entry = table.on_connected(a, Some("Phone")).unwrap();
        assert_eq!(entry.state, EndpointState::Connected);
        assert_eq!(entry.name, "Phone");
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut table = EndpointTable::new();
        let a = id();
        assert_eq!(table.on_connecting(a).unwrap_err(), EndpointError::Unknown(a));
        table.on_found(a, "A");
        table.on_connected(a, None).unwrap();
        assert!(matches!(
            table.on_connecting(a),
            Err(EndpointError::InvalidTransition {
                from: EndpointState::Connected,
                to: EndpointState::Connecting,
                ..
            })
        ));
        assert!(table
            .on_disconnected(id())
            .unwrap_err()
            .to_string()
            .contains("unknown"));
    }

    #[test]
    fn prefix_lookup() {
        let mut table = EndpointTable::new();
        let a = id();
        table.on_found(a, "A");
        let text = a.to_string();
        assert_eq!(table.find_by_prefix(&text[..10]).unwrap().id, a);
        assert!(table.find_by_prefix("zz").is_none());
    }
}
