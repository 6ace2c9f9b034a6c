use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use dealflow_core::capabilities::{ActivityStore, CapabilityError};
use dealflow_core::catalog::StageDefinition;
use dealflow_core::domain::activity::{Activity, ActivityId};
use dealflow_core::domain::execution::{
    ExecutionId, ExecutionKey, ExecutionStatus, ExecutionTransitionEvent, PlaybookExecution,
};
use dealflow_core::domain::opportunity::{Opportunity, OpportunityId};
use dealflow_core::domain::playbook::{Playbook, PlaybookId, TriggerType};
use dealflow_core::domain::reminder::{Reminder, ReminderId, ReminderStatus, ReminderType};
use dealflow_core::domain::territory::Territory;
use dealflow_core::domain::TenantId;
use dealflow_core::execution::TransitionResult;

use super::{
    ActivityRepository, ExecutionFilter, ExecutionLedgerRepository, OpportunityRepository,
    PlaybookRepository, ReminderRepository, RepositoryError, StageCatalogRepository,
    TerritoryRepository,
};

#[derive(Default)]
pub struct InMemoryOpportunityRepository {
    opportunities: RwLock<HashMap<(TenantId, OpportunityId), Opportunity>>,
}

#[async_trait::async_trait]
impl OpportunityRepository for InMemoryOpportunityRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError> {
        let opportunities = self.opportunities.read().await;
        Ok(opportunities.get(&(tenant_id.clone(), id.clone())).cloned())
    }

    async fn save(&self, mut opportunity: Opportunity) -> Result<u32, RepositoryError> {
        let mut opportunities = self.opportunities.write().await;
        let foreign = opportunities.keys().any(|(tenant_id, id)| {
            id == &opportunity.id && tenant_id != &opportunity.tenant_id
        });
        let key = (opportunity.tenant_id.clone(), opportunity.id.clone());
        let stored_version = opportunities.get(&key).map_or(0, |existing| existing.version);
        if foreign || stored_version != opportunity.version {
            return Err(RepositoryError::Conflict(format!(
                "opportunity `{}` changed since version {} or belongs to another tenant",
                opportunity.id.0, opportunity.version
            )));
        }
        if let Some(existing) = opportunities.get(&key) {
            for (stored, incoming) in
                existing.stage_history.iter().zip(opportunity.stage_history.iter_mut())
            {
                *incoming = stored.clone();
            }
            opportunity.created_at = existing.created_at;
        }
        opportunity.version += 1;
        let version = opportunity.version;
        opportunities.insert(key, opportunity);
        Ok(version)
    }

    async fn list_stage_unchanged_since(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, RepositoryError> {
        let opportunities = self.opportunities.read().await;
        let mut stale: Vec<Opportunity> = opportunities
            .values()
            .filter(|opportunity| {
                &opportunity.tenant_id == tenant_id && opportunity.stage_changed_at <= cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|opportunity| opportunity.stage_changed_at);
        Ok(stale)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, RepositoryError> {
        let opportunities = self.opportunities.read().await;
        let mut tenants: Vec<TenantId> =
            opportunities.keys().map(|(tenant_id, _)| tenant_id.clone()).collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }
}

#[derive(Default)]
pub struct InMemoryStageCatalogRepository {
    stages: RwLock<HashMap<TenantId, Vec<StageDefinition>>>,
}

#[async_trait::async_trait]
impl StageCatalogRepository for InMemoryStageCatalogRepository {
    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<StageDefinition>, RepositoryError> {
        let stages = self.stages.read().await;
        let mut definitions = stages.get(tenant_id).cloned().unwrap_or_default();
        definitions.sort_by(|left, right| {
            left.display_order.cmp(&right.display_order).then_with(|| left.name.cmp(&right.name))
        });
        Ok(definitions)
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        definition: StageDefinition,
    ) -> Result<(), RepositoryError> {
        let mut stages = self.stages.write().await;
        let definitions = stages.entry(tenant_id.clone()).or_default();
        definitions.retain(|existing| existing.name != definition.name);
        definitions.push(definition);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPlaybookRepository {
    playbooks: RwLock<BTreeMap<PlaybookId, Playbook>>,
}

#[async_trait::async_trait]
impl PlaybookRepository for InMemoryPlaybookRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
    ) -> Result<Option<Playbook>, RepositoryError> {
        let playbooks = self.playbooks.read().await;
        Ok(playbooks.get(id).filter(|playbook| &playbook.tenant_id == tenant_id).cloned())
    }

    async fn list_active_by_trigger(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<Playbook>, RepositoryError> {
        Ok(self
            .list_for_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|playbook| playbook.active && playbook.trigger_type() == trigger_type)
            .collect())
    }

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Playbook>, RepositoryError> {
        let playbooks = self.playbooks.read().await;
        let mut listed: Vec<Playbook> = playbooks
            .values()
            .filter(|playbook| &playbook.tenant_id == tenant_id)
            .cloned()
            .collect();
        listed.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(listed)
    }

    async fn save(&self, mut playbook: Playbook) -> Result<(), RepositoryError> {
        playbook.steps.sort_by_key(|step| step.order);
        let mut playbooks = self.playbooks.write().await;
        if playbooks
            .get(&playbook.id)
            .is_some_and(|existing| existing.tenant_id != playbook.tenant_id)
        {
            return Err(RepositoryError::Conflict(format!(
                "playbook `{}` belongs to another tenant",
                playbook.id.0
            )));
        }
        playbooks.insert(playbook.id.clone(), playbook);
        Ok(())
    }
}

#[derive(Default)]
struct LedgerState {
    executions: BTreeMap<ExecutionId, PlaybookExecution>,
    keys: HashMap<ExecutionKey, ExecutionId>,
    transitions: Vec<ExecutionTransitionEvent>,
}

#[derive(Default)]
pub struct InMemoryExecutionLedgerRepository {
    state: RwLock<LedgerState>,
}

#[async_trait::async_trait]
impl ExecutionLedgerRepository for InMemoryExecutionLedgerRepository {
    async fn insert_if_absent(
        &self,
        execution: PlaybookExecution,
        scheduled: ExecutionTransitionEvent,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        if state.keys.contains_key(&execution.key) {
            return Ok(false);
        }
        state.keys.insert(execution.key.clone(), execution.id.clone());
        state.executions.insert(execution.id.clone(), execution);
        state.transitions.push(scheduled);
        Ok(true)
    }

    async fn find_by_id(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<PlaybookExecution>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.executions.get(id).cloned())
    }

    async fn find_by_key(
        &self,
        key: &ExecutionKey,
    ) -> Result<Option<PlaybookExecution>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.keys.get(key).and_then(|id| state.executions.get(id)).cloned())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let state = self.state.read().await;
        let mut due: Vec<PlaybookExecution> =
            state.executions.values().filter(|execution| execution.is_due(now)).cloned().collect();
        due.sort_by(|left, right| {
            left.scheduled_for
                .cmp(&right.scheduled_for)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_stale_executing(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let state = self.state.read().await;
        let mut stale: Vec<PlaybookExecution> = state
            .executions
            .values()
            .filter(|execution| {
                execution.status == ExecutionStatus::Executing
                    && execution.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|execution| execution.claimed_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let state = self.state.read().await;
        let mut listed: Vec<PlaybookExecution> =
            state.executions.values().filter(|execution| filter.matches(execution)).cloned().collect();
        listed.sort_by(|left, right| {
            right
                .scheduled_for
                .cmp(&left.scheduled_for)
                .then_with(|| right.created_at.cmp(&left.created_at))
        });
        listed.truncate(limit as usize);
        Ok(listed)
    }

    async fn apply_transition(
        &self,
        result: &TransitionResult,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.executions.get_mut(&result.execution.id) else {
            return Ok(false);
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = result.execution.clone();
        state.transitions.push(result.transition.clone());
        Ok(true)
    }

    async fn list_transitions(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionTransitionEvent>, RepositoryError> {
        let state = self.state.read().await;
        let mut transitions: Vec<ExecutionTransitionEvent> = state
            .transitions
            .iter()
            .filter(|transition| &transition.execution_id == execution_id)
            .cloned()
            .collect();
        transitions.sort_by_key(|transition| (transition.state_version, transition.occurred_at));
        Ok(transitions)
    }
}

#[derive(Default)]
pub struct InMemoryReminderRepository {
    reminders: RwLock<BTreeMap<ReminderId, Reminder>>,
}

/// Pending with no live claim.
fn unheld(reminder: &Reminder, stale_before: DateTime<Utc>) -> bool {
    reminder.status == ReminderStatus::Pending
        && reminder.claimed_at.map_or(true, |claimed_at| claimed_at < stale_before)
}

fn claimable(reminder: &Reminder, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> bool {
    unheld(reminder, stale_before) && reminder.scheduled_for <= now
}

#[async_trait::async_trait]
impl ReminderRepository for InMemoryReminderRepository {
    async fn find_by_id(&self, id: &ReminderId) -> Result<Option<Reminder>, RepositoryError> {
        let reminders = self.reminders.read().await;
        Ok(reminders.get(id).cloned())
    }

    async fn save(&self, reminder: Reminder) -> Result<(), RepositoryError> {
        let mut reminders = self.reminders.write().await;
        reminders.insert(reminder.id.clone(), reminder);
        Ok(())
    }

    async fn find_pending_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError> {
        let reminders = self.reminders.read().await;
        Ok(reminders
            .values()
            .filter(|reminder| {
                &reminder.tenant_id == tenant_id
                    && reminder.opportunity_id.as_ref() == Some(opportunity_id)
                    && reminder.reminder_type == reminder_type
                    && reminder.status == ReminderStatus::Pending
            })
            .min_by_key(|reminder| reminder.created_at)
            .cloned())
    }

    async fn find_latest_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError> {
        let reminders = self.reminders.read().await;
        Ok(reminders
            .values()
            .filter(|reminder| {
                &reminder.tenant_id == tenant_id
                    && reminder.opportunity_id.as_ref() == Some(opportunity_id)
                    && reminder.reminder_type == reminder_type
            })
            .max_by_key(|reminder| reminder.created_at)
            .cloned())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reminder>, RepositoryError> {
        let reminders = self.reminders.read().await;
        let mut due: Vec<Reminder> = reminders
            .values()
            .filter(|reminder| claimable(reminder, now, stale_before))
            .cloned()
            .collect();
        due.sort_by_key(|reminder| (reminder.scheduled_for, reminder.created_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut reminders = self.reminders.write().await;
        match reminders.get_mut(id) {
            Some(reminder) if claimable(reminder, now, stale_before) => {
                reminder.claimed_at = Some(now);
                reminder.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        reminder: &Reminder,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut reminders = self.reminders.write().await;
        match reminders.get_mut(&reminder.id) {
            Some(stored) if unheld(stored, stale_before) => {
                stored.title = reminder.title.clone();
                stored.message = reminder.message.clone();
                stored.scheduled_for = reminder.scheduled_for;
                stored.channels = reminder.channels.clone();
                stored.user_id = reminder.user_id.clone();
                stored.claimed_at = None;
                stored.updated_at = reminder.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        reminder: &Reminder,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut reminders = self.reminders.write().await;
        match reminders.get_mut(&reminder.id) {
            Some(stored)
                if stored.status == ReminderStatus::Pending
                    && stored.claimed_at == Some(claimed_at) =>
            {
                stored.status = reminder.status;
                stored.sent_at = reminder.sent_at;
                stored.error = reminder.error.clone();
                stored.updated_at = reminder.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut reminders = self.reminders.write().await;
        match reminders.get_mut(id) {
            Some(reminder) if unheld(reminder, stale_before) => {
                reminder.status = ReminderStatus::Cancelled;
                reminder.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryActivityRepository {
    activities: RwLock<Vec<Activity>>,
}

impl InMemoryActivityRepository {
    pub async fn all(&self) -> Vec<Activity> {
        self.activities.read().await.clone()
    }
}

#[async_trait::async_trait]
impl ActivityStore for InMemoryActivityRepository {
    async fn create(&self, activity: Activity) -> Result<ActivityId, CapabilityError> {
        let mut activities = self.activities.write().await;
        if activities.iter().any(|existing| existing.id == activity.id) {
            return Err(CapabilityError::Storage(format!(
                "activity `{}` already exists",
                activity.id.0
            )));
        }
        let id = activity.id.clone();
        activities.push(activity);
        Ok(id)
    }
}

#[async_trait::async_trait]
impl ActivityRepository for InMemoryActivityRepository {
    async fn list_for_opportunity(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Activity>, RepositoryError> {
        let activities = self.activities.read().await;
        Ok(activities
            .iter()
            .filter(|activity| {
                &activity.tenant_id == tenant_id && &activity.opportunity_id == opportunity_id
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryTerritoryRepository {
    territories: RwLock<HashMap<(TenantId, String), Territory>>,
    cursors: RwLock<HashMap<(TenantId, String), u64>>,
}

#[async_trait::async_trait]
impl TerritoryRepository for InMemoryTerritoryRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<Territory>, RepositoryError> {
        let territories = self.territories.read().await;
        Ok(territories.get(&(tenant_id.clone(), name.to_string())).cloned())
    }

    async fn save(&self, territory: Territory) -> Result<(), RepositoryError> {
        let mut territories = self.territories.write().await;
        territories.insert((territory.tenant_id.clone(), territory.name.clone()), territory);
        Ok(())
    }

    async fn advance_cursor(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<u64, RepositoryError> {
        let mut cursors = self.cursors.write().await;
        let key = (tenant_id.clone(), name.to_string());
        let position = match cursors.get(&key) {
            Some(current) => current + 1,
            None => 0,
        };
        cursors.insert(key, position);
        Ok(position)
    }
}
