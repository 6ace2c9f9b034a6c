use std::sync::Arc;

use tracing::{debug, info};

use dealflow_core::domain::{TenantId, UserId};
use dealflow_core::errors::ApplicationError;
use dealflow_db::repositories::TerritoryRepository;

/// Round-robin owner assignment over a territory's members.
#[derive(Clone)]
pub struct OwnerAssigner {
    territories: Arc<dyn TerritoryRepository>,
}

impl OwnerAssigner {
    pub fn new(territories: Arc<dyn TerritoryRepository>) -> Self {
        Self { territories }
    }

    /// Picks the next member of `territory`, or `None` when it is unknown or has no members.
    /// The cursor only advances when a member is actually picked.
    pub async fn assign(
        &self,
        tenant_id: &TenantId,
        territory: &str,
    ) -> Result<Option<UserId>, ApplicationError> {
        let Some(found) = self.territories.find(tenant_id, territory).await? else {
            debug!(
                event_name = "workflow.assignment.unknown_territory",
                tenant_id = %tenant_id.0,
                territory,
                "territory not found; leaving opportunity unowned"
            );
            return Ok(None);
        };
        if found.members.is_empty() {
            return Ok(None);
        }

        let position = self.territories.advance_cursor(tenant_id, &found.name).await?;
        let owner = found.member_at(position).cloned();
        if let Some(owner) = &owner {
            info!(
                event_name = "workflow.assignment.owner_assigned",
                tenant_id = %tenant_id.0,
                territory = %found.name,
                owner_id = %owner.0,
                position,
                "assigned owner round-robin"
            );
        }
        Ok(owner)
    }
}
