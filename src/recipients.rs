use std::collections::BTreeSet;

use crate::config::{Role, RoleEntry};

/// Maps an entity to the users that should hear about it
pub trait RecipientResolver: Send + Sync {
    /// Distinct recipient ids, ascending.
    fn recipients_for(&self, entity_id: i64) -> Vec<i64>;
}

/// Static role assignments loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    entries: Vec<RoleEntry>,
}

impl RoleTable {
    pub fn new(entries: Vec<RoleEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RecipientResolver for RoleTable {
    fn recipients_for(&self, entity_id: i64) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|entry| match entry.role {
                Role::UnionHead => true,
                Role::RegionHead | Role::ClubOwner => entry.clubs.contains(&entity_id),
            })
            .map(|entry| entry.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
