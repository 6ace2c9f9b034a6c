use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use dealflow_core::catalog::StageDefinition;
use dealflow_core::domain::activity::Activity;
use dealflow_core::domain::execution::{
    ExecutionId, ExecutionKey, ExecutionStatus, ExecutionTransitionEvent, PlaybookExecution,
};
use dealflow_core::domain::opportunity::{Opportunity, OpportunityId};
use dealflow_core::domain::playbook::{Playbook, PlaybookId, TriggerType};
use dealflow_core::domain::reminder::{Reminder, ReminderId, ReminderType};
use dealflow_core::domain::territory::Territory;
use dealflow_core::domain::TenantId;
use dealflow_core::execution::TransitionResult;
use dealflow_core::errors::ApplicationError;
use dealflow_core::ActivityStore;

pub mod activity;
pub mod catalog;
mod codec;
pub mod execution_ledger;
pub mod memory;
pub mod opportunity;
pub mod playbook;
pub mod reminder;
pub mod territory;

pub use activity::SqlActivityRepository;
pub use catalog::SqlStageCatalogRepository;
pub use execution_ledger::SqlExecutionLedgerRepository;
pub use memory::{
    InMemoryActivityRepository, InMemoryExecutionLedgerRepository, InMemoryOpportunityRepository,
    InMemoryPlaybookRepository, InMemoryReminderRepository, InMemoryStageCatalogRepository,
    InMemoryTerritoryRepository,
};
pub use opportunity::SqlOpportunityRepository;
pub use playbook::SqlPlaybookRepository;
pub use reminder::SqlReminderRepository;
pub use territory::SqlTerritoryRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    /// Stale version, or the id already belongs to another tenant.
    #[error("{0}")]
    Conflict(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict(message) => Self::Conflict(message),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError>;

    /// Inserts when `version` is 0, otherwise updates only if the stored row is still at
    /// `version`. Returns the stored version. Stage history is append-only and existing
    /// entries are kept.
    async fn save(&self, opportunity: Opportunity) -> Result<u32, RepositoryError>;

    /// Opportunities whose stage has not changed since `cutoff`, oldest first.
    async fn list_stage_unchanged_since(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, RepositoryError>;

    async fn list_tenants(&self) -> Result<Vec<TenantId>, RepositoryError>;
}

#[async_trait]
pub trait StageCatalogRepository: Send + Sync {
    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<StageDefinition>, RepositoryError>;

    async fn save(
        &self,
        tenant_id: &TenantId,
        definition: StageDefinition,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PlaybookRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
    ) -> Result<Option<Playbook>, RepositoryError>;

    async fn list_active_by_trigger(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<Playbook>, RepositoryError>;

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Playbook>, RepositoryError>;

    /// Replaces the playbook and its full step list.
    async fn save(&self, playbook: Playbook) -> Result<(), RepositoryError>;
}

/// Operator-facing filter over the execution ledger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub tenant_id: Option<TenantId>,
    pub opportunity_id: Option<OpportunityId>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &PlaybookExecution) -> bool {
        self.tenant_id.as_ref().map_or(true, |tenant| &execution.key.tenant_id == tenant)
            && self
                .opportunity_id
                .as_ref()
                .map_or(true, |opportunity| &execution.key.opportunity_id == opportunity)
            && self.status.map_or(true, |status| execution.status == status)
    }
}

/// Durable ledger of playbook step executions.
///
/// Every state change is a compare-and-set on the row's current status, so a row can only
/// be moved by the caller that observed it in the expected state.
#[async_trait]
pub trait ExecutionLedgerRepository: Send + Sync {
    /// Inserts the row and its scheduling event unless a row already exists for the same
    /// `(tenant, opportunity, playbook, step order)`. Returns whether the row was created.
    async fn insert_if_absent(
        &self,
        execution: PlaybookExecution,
        scheduled: ExecutionTransitionEvent,
    ) -> Result<bool, RepositoryError>;

    async fn find_by_id(&self, id: &ExecutionId)
        -> Result<Option<PlaybookExecution>, RepositoryError>;

    async fn find_by_key(
        &self,
        key: &ExecutionKey,
    ) -> Result<Option<PlaybookExecution>, RepositoryError>;

    /// Pending rows due at `now`, earliest first.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError>;

    /// Executing rows claimed before `cutoff`.
    async fn list_stale_executing(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError>;

    async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError>;

    /// Writes `result.execution` only if the stored row is still in `expected`, appending
    /// the transition in the same transaction. Returns whether the write happened.
    async fn apply_transition(
        &self,
        result: &TransitionResult,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError>;

    async fn list_transitions(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionTransitionEvent>, RepositoryError>;
}

#[async_trait]
pub trait ReminderRepository: Send + Sync {
    async fn find_by_id(&self, id: &ReminderId) -> Result<Option<Reminder>, RepositoryError>;

    async fn save(&self, reminder: Reminder) -> Result<(), RepositoryError>;

    /// The pending reminder of `reminder_type` already attached to an opportunity, if any.
    async fn find_pending_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError>;

    /// The most recently created reminder of `reminder_type` for an opportunity, in any
    /// status.
    async fn find_latest_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError>;
    /// Pending reminders due at `now` that are unclaimed or whose claim predates
    /// `stale_before`.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reminder>, RepositoryError>;

    /// Marks a due reminder as claimed. Returns false when another worker holds it.
    async fn try_claim(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Rewrites the schedule and content of a pending reminder and releases any stale claim.
    /// Returns false when it is no longer pending or a live claim holds it.
    async fn reschedule(
        &self,
        reminder: &Reminder,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Stores the delivery outcome only while the reminder is still pending under the claim
    /// taken at `claimed_at`. Returns false when it was cancelled or reclaimed meanwhile.
    async fn record_outcome(
        &self,
        reminder: &Reminder,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Cancels a pending reminder that no live claim holds. Returns false otherwise.
    async fn cancel(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ActivityRepository: ActivityStore {
    async fn list_for_opportunity(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Activity>, RepositoryError>;
}

#[async_trait]
pub trait TerritoryRepository: Send + Sync {
    async fn find(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<Territory>, RepositoryError>;

    async fn save(&self, territory: Territory) -> Result<(), RepositoryError>;

    /// Atomically returns the territory's next round-robin position, starting at zero.
    async fn advance_cursor(&self, tenant_id: &TenantId, name: &str)
        -> Result<u64, RepositoryError>;
}
