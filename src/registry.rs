use std::sync::Arc;

use ahash::AHashMap as HashMap;

use crate::errors::{Result, UowError};
use crate::participant::{Participant, ParticipantId};

/// A participant enlisted in one transaction.
#[derive(Clone)]
pub struct Registration {
    pub id: ParticipantId,
    pub name: String,
    pub participant: Arc<dyn Participant>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Holds the participants enlisted for the lifetime of one transaction attempt.
///
/// The registry itself knows nothing about transaction status; the coordinator
/// decides whether registration is still allowed and seals the registry when
/// PREPARE starts.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    entries: Vec<Registration>,
    names: Vec<String>,
    by_name: HashMap<String, ParticipantId>,
    sealed: bool,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enlists `participant` under `name` and returns its id.
    ///
    /// Does not contact the participant.
    ///
    /// # Errors
    ///
    /// * [`UowError::EmptyParticipantName`] if `name` is empty or blank.
    /// * [`UowError::DuplicateParticipant`] if `name` was already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        participant: Arc<dyn Participant>,
    ) -> Result<ParticipantId> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(UowError::EmptyParticipantName);
        }
        if self.by_name.contains_key(&name) {
            return Err(UowError::DuplicateParticipant(name));
        }
        let id = ParticipantId::new(self.names.len());
        self.by_name.insert(name.clone(), id);
        self.names.push(name.clone());
        self.entries.push(Registration {
            id,
            name,
            participant,
        });
        Ok(id)
    }

    /// Registrations in insertion order.
    pub fn list(&self) -> &[Registration] {
        &self.entries
    }

    /// `(id, name)` pairs in registration order. Survives [`Self::release`].
    pub fn names(&self) -> Vec<(ParticipantId, String)> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| (ParticipantId::new(index), name.clone()))
            .collect()
    }

    pub fn name_of(&self, id: ParticipantId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    pub fn id_of(&self, name: &str) -> Option<ParticipantId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Freezes the membership; called when PREPARE starts.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Drops every participant handle once the transaction is over.
    pub(crate) fn release(&mut self) {
        self.entries.clear();
    }
}
