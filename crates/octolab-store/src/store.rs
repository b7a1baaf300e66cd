use async_trait::async_trait;
use octolab_domain::{Lab, LabId, LabStatus, OwnerId};

use crate::error::StoreError;

/// Persistence seam for [`Lab`] rows and port reservations (spec §3, §5.4,
/// §6 "Database schema"). Row-level locking for the worker loops is
/// expressed via [`LabStore::claim_labs_by_status`], which must use
/// `SELECT ... FOR UPDATE SKIP LOCKED` in any backing implementation shared
/// across worker instances — the in-memory store approximates this with a
/// per-row claimed flag, since it never runs more than one process.
#[async_trait]
pub trait LabStore: Send + Sync + 'static {
    async fn insert_lab(&self, lab: &Lab) -> Result<(), StoreError>;
    async fn get_lab(&self, id: LabId) -> Result<Option<Lab>, StoreError>;
    async fn get_lab_for_owner(&self, id: LabId, owner_id: OwnerId) -> Result<Option<Lab>, StoreError>;
    async fn list_labs_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Lab>, StoreError>;
    async fn update_lab(&self, lab: &Lab) -> Result<(), StoreError>;

    /// Count of non-terminal labs owned by `owner_id`, for quota enforcement.
    async fn count_active_labs_for_owner(&self, owner_id: OwnerId) -> Result<u32, StoreError>;

    /// Claims up to `limit` labs currently in `status`, older than `min_age`,
    /// for exclusive processing by this worker. Implementations backed by a
    /// shared database must use `SELECT ... FOR UPDATE SKIP LOCKED` so that
    /// exactly one worker owns a given lab id at any moment (spec §4.1, §4.7
    /// invariant).
    async fn claim_labs_by_status(
        &self,
        status: LabStatus,
        min_age: chrono::Duration,
        limit: u32,
    ) -> Result<Vec<Lab>, StoreError>;

    // ── Port reservations (spec §3 "Port reservation", §5.4) ───────────────

    /// Allocates the first free port in `[range_start, range_end]` not
    /// already reserved, and reserves it for `(lab_id, owner_id)`. Bounded
    /// by `retry_count` collision retries at the call site, not here — this
    /// call itself is a single atomic scan-and-insert.
    async fn allocate_port(
        &self,
        lab_id: LabId,
        owner_id: OwnerId,
        range_start: u16,
        range_end: u16,
    ) -> Result<u16, StoreError>;

    /// Idempotent: releasing a reservation that doesn't exist is success
    /// (spec §8 edge case 10).
    async fn release_port(&self, lab_id: LabId) -> Result<(), StoreError>;
}
