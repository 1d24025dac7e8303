use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreOwner {
    pub owner_id: String,
    pub expires_at_utc: DateTime<Utc>,
}

/// The value guarded by a distributed semaphore row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SemaphoreOwners {
    pub name: String,
    #[serde(default)]
    pub owners: Vec<SemaphoreOwner>,
}

impl SemaphoreOwners {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owners: Vec::new(),
        }
    }

    /// Drops every owner whose lease has run out. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.owners.len();
        self.owners.retain(|owner| owner.expires_at_utc > now);
        before - self.owners.len()
    }

    pub fn contains(&self, owner_id: &str) -> bool {
        self.owners.iter().any(|owner| owner.owner_id == owner_id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Extends an existing lease. Returns false when `owner_id` holds none.
    pub fn extend(&mut self, owner_id: &str, expires_at_utc: DateTime<Utc>) -> bool {
        match self.owners.iter_mut().find(|owner| owner.owner_id == owner_id) {
            Some(owner) => {
                owner.expires_at_utc = expires_at_utc;
                true
            }
            None => false,
        }
    }

    pub fn add(&mut self, owner_id: impl Into<String>, expires_at_utc: DateTime<Utc>) {
        self.owners.push(SemaphoreOwner {
            owner_id: owner_id.into(),
            expires_at_utc,
        });
    }

    pub fn remove(&mut self, owner_id: &str) -> bool {
        let before = self.owners.len();
        self.owners.retain(|owner| owner.owner_id != owner_id);
        before != self.owners.len()
    }
}

/// A semaphore value together with the row version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedSemaphoreOwners {
    pub owners: SemaphoreOwners,
    pub concurrency_token: Uuid,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn purge_drops_only_lapsed_leases() {
        let now = Utc::now();
        let mut value = SemaphoreOwners::empty("outbox");
        value.add("a", now - Duration::seconds(1));
        value.add("b", now);
        value.add("c", now + Duration::seconds(5));

        assert_eq!(value.purge_expired(now), 2);
        assert!(value.contains("c"));
        assert_eq!(value.len(), 1);
    }

    #[test]
    fn extend_and_remove() {
        let now = Utc::now();
        let mut value = SemaphoreOwners::empty("outbox");
        value.add("a", now);

        assert!(value.extend("a", now + Duration::seconds(30)));
        assert!(!value.extend("b", now));
        assert_eq!(value.owners[0].expires_at_utc, now + Duration::seconds(30));
        assert!(value.remove("a"));
        assert!(!value.remove("a"));
        assert!(value.is_empty());
    }
}
