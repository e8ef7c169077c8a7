//! Connection registry indexed by id and by remote endpoint.
//!
//! Both indices must agree at all times. An insert that finds its id already
//! present, or a removal that finds either index out of step, is reported as
//! [`ProtocolError::InvariantViolation`] and treated as fatal by the event
//! loop.

use crate::core::endpoint::Endpoint;
use crate::error::{constants, ProtocolError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Anything stored in a [`ConnectionTable`]
pub trait Keyed {
    fn id(&self) -> u64;
    fn endpoint(&self) -> Endpoint;
}

#[derive(Debug)]
pub struct ConnectionTable<T> {
    by_id: DashMap<u64, Arc<T>>,
    by_endpoint: DashMap<Endpoint, u64>,
}

impl<T: Keyed> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Keyed> ConnectionTable<T> {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_endpoint: DashMap::new(),
        }
    }

    /// Add a connection to both indices.
    ///
    /// Fails with [`ProtocolError::AlreadyConnected`] if the endpoint is in
    /// use, leaving the table unchanged.
    pub fn insert(&self, conn: Arc<T>) -> Result<()> {
        let id = conn.id();
        let endpoint = conn.endpoint();

        match self.by_id.entry(id) {
            Entry::Occupied(_) => {
                return Err(ProtocolError::InvariantViolation(format!(
                    "{} (id {id})",
                    constants::ERR_DUPLICATE_ID
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(conn);
            }
        }

        let conflict = match self.by_endpoint.entry(endpoint) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(id);
                false
            }
        };

        if conflict {
            if self.by_id.remove(&id).is_none() {
                return Err(ProtocolError::InvariantViolation(format!(
                    "{} (id {id})",
                    constants::ERR_ROLLBACK
                )));
            }
            return Err(ProtocolError::AlreadyConnected(endpoint.to_string()));
        }
        Ok(())
    }

    /// Remove a connection from both indices
    pub fn remove(&self, id: u64, endpoint: &Endpoint) -> Result<Arc<T>> {
        let (_, conn) = self.by_id.remove(&id).ok_or_else(|| {
            ProtocolError::InvariantViolation(format!(
                "{} (id {id})",
                constants::ERR_ID_INDEX_REMOVE
            ))
        })?;
        self.by_endpoint
            .remove_if(endpoint, |_, mapped| *mapped == id)
            .ok_or_else(|| {
                ProtocolError::InvariantViolation(format!(
                    "{} (id {id}, endpoint {endpoint})",
                    constants::ERR_ENDPOINT_INDEX_REMOVE
                ))
            })?;
        Ok(conn)
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_by_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<T>> {
        let id = *self.by_endpoint.get(endpoint)?;
        self.get(id)
    }

    pub fn contains_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.by_endpoint.contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Snapshot of all connections
    pub fn values(&self) -> Vec<Arc<T>> {
        self.by_id.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Snapshot of all connected endpoints
    pub fn endpoints(&self) -> HashSet<Endpoint> {
        self.by_endpoint.iter().map(|e| *e.key()).collect()
    }

    /// Whether any connection satisfies `predicate`
    pub fn any<F: Fn(&T) -> bool>(&self, predicate: F) -> bool {
        self.by_id.iter().any(|e| predicate(e.value()))
    }

    /// Number of connections satisfying `predicate`
    pub fn count<F: Fn(&T) -> bool>(&self, predicate: F) -> usize {
        self.by_id.iter().filter(|e| predicate(e.value())).count()
    }
}
