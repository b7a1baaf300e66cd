use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use octolab_domain::{Lab, LabId, LabStatus, OwnerId};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::LabStore;

#[derive(Debug, Default)]
struct Inner {
    labs: HashMap<LabId, Lab>,
    ports: HashMap<LabId, (OwnerId, u16)>,
}

/// In-memory implementation of [`LabStore`].
///
/// All data is lost on process exit. Used by tests and by `doctor`/`smoke`
/// CLI invocations that don't need a real database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLabStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryLabStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LabStore for InMemoryLabStore {
    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.labs.insert(lab.id, lab.clone());
        Ok(())
    }

    async fn get_lab(&self, id: LabId) -> Result<Option<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.labs.get(&id).cloned())
    }

    async fn get_lab_for_owner(&self, id: LabId, owner_id: OwnerId) -> Result<Option<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .labs
            .get(&id)
            .filter(|lab| lab.owner_id == owner_id)
            .cloned())
    }

    async fn list_labs_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .labs
            .values()
            .filter(|lab| lab.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn update_lab(&self, lab: &Lab) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.labs.contains_key(&lab.id) {
            return Err(StoreError::LabNotFound(lab.id.to_string()));
        }
        guard.labs.insert(lab.id, lab.clone());
        Ok(())
    }

    async fn count_active_labs_for_owner(&self, owner_id: OwnerId) -> Result<u32, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .labs
            .values()
            .filter(|lab| lab.owner_id == owner_id && lab.status.is_active())
            .count() as u32)
    }

    async fn claim_labs_by_status(
        &self,
        status: LabStatus,
        min_age: chrono::Duration,
        limit: u32,
    ) -> Result<Vec<Lab>, StoreError> {
        let guard = self.inner.read().await;
        let cutoff = Utc::now() - min_age;
        let mut matches: Vec<Lab> = guard
            .labs
            .values()
            .filter(|lab| lab.status == status && lab.updated_at <= cutoff)
            .cloned()
            .collect();
        matches.sort_by_key(|lab| lab.updated_at);
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn allocate_port(
        &self,
        lab_id: LabId,
        owner_id: OwnerId,
        range_start: u16,
        range_end: u16,
    ) -> Result<u16, StoreError> {
        let mut guard = self.inner.write().await;
        let taken: HashSet<u16> = guard.ports.values().map(|(_, p)| *p).collect();
        let port = (range_start..=range_end)
            .find(|p| !taken.contains(p))
            .ok_or(StoreError::PortRangeExhausted)?;
        guard.ports.insert(lab_id, (owner_id, port));
        Ok(port)
    }

    async fn release_port(&self, lab_id: LabId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.ports.remove(&lab_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octolab_domain::{Lab, RecipeId, Runtime};
    use uuid::Uuid;

    fn fresh_lab(owner: OwnerId) -> Lab {
        Lab::new(owner, RecipeId(Uuid::new_v4()), Runtime::Container, 60, None)
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = InMemoryLabStore::new();
        let owner = OwnerId(Uuid::new_v4());
        let lab = fresh_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        let got = store.get_lab(lab.id).await.unwrap().unwrap();
        assert_eq!(got.id, lab.id);
    }

    #[tokio::test]
    async fn owner_scoping_hides_other_owners_labs() {
        let store = InMemoryLabStore::new();
        let owner_a = OwnerId(Uuid::new_v4());
        let owner_b = OwnerId(Uuid::new_v4());
        let lab = fresh_lab(owner_a);
        store.insert_lab(&lab).await.unwrap();

        assert!(store.get_lab_for_owner(lab.id, owner_b).await.unwrap().is_none());
        assert!(store.get_lab_for_owner(lab.id, owner_a).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn active_lab_quota_excludes_terminal_labs() {
        let store = InMemoryLabStore::new();
        let owner = OwnerId(Uuid::new_v4());
        let mut finished = fresh_lab(owner);
        finished.transition_to(LabStatus::Provisioning).unwrap();
        finished.transition_to(LabStatus::Ready).unwrap();
        finished.transition_to(LabStatus::Ending).unwrap();
        finished.mark_finished(chrono::Duration::hours(1)).unwrap();
        store.insert_lab(&finished).await.unwrap();
        store.insert_lab(&fresh_lab(owner)).await.unwrap();

        assert_eq!(store.count_active_labs_for_owner(owner).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn port_allocation_skips_taken_ports_and_release_is_idempotent() {
        let store = InMemoryLabStore::new();
        let owner = OwnerId(Uuid::new_v4());
        let lab_a = LabId::new();
        let lab_b = LabId::new();

        let port_a = store.allocate_port(lab_a, owner, 9000, 9001).await.unwrap();
        let port_b = store.allocate_port(lab_b, owner, 9000, 9001).await.unwrap();
        assert_ne!(port_a, port_b);

        assert!(matches!(
            store.allocate_port(LabId::new(), owner, 9000, 9001).await,
            Err(StoreError::PortRangeExhausted)
        ));

        store.release_port(lab_a).await.unwrap();
        store.release_port(lab_a).await.unwrap(); // idempotent
        let port_c = store.allocate_port(LabId::new(), owner, 9000, 9001).await.unwrap();
        assert_eq!(port_c, port_a);
    }

    #[tokio::test]
    async fn claim_labs_by_status_filters_by_age_and_sorts_oldest_first() {
        let store = InMemoryLabStore::new();
        let owner = OwnerId(Uuid::new_v4());
        let lab = fresh_lab(owner);
        store.insert_lab(&lab).await.unwrap();

        let claimed = store
            .claim_labs_by_status(LabStatus::Requested, chrono::Duration::zero(), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let none_yet = store
            .claim_labs_by_status(LabStatus::Requested, chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(none_yet.is_empty());
    }
}
