use std::sync::Arc;

use async_trait::async_trait;

use dealflow_core::capabilities::{CapabilityError, StageCatalogProvider};
use dealflow_core::catalog::{StageCatalog, StageDefinition};
use dealflow_core::domain::TenantId;
use dealflow_db::repositories::StageCatalogRepository;

/// Stage catalog read from the tenant's stored stages, falling back to the compiled
/// defaults for anything the tenant has not defined.
#[derive(Clone)]
pub struct RepositoryStageCatalogProvider {
    stages: Arc<dyn StageCatalogRepository>,
}

impl RepositoryStageCatalogProvider {
    pub fn new(stages: Arc<dyn StageCatalogRepository>) -> Self {
        Self { stages }
    }

    async fn catalog(&self, tenant_id: &TenantId) -> Result<StageCatalog, CapabilityError> {
        self.stages
            .list_for_tenant(tenant_id)
            .await
            .map(StageCatalog::new)
            .map_err(|error| CapabilityError::Storage(error.to_string()))
    }
}

#[async_trait]
impl StageCatalogProvider for RepositoryStageCatalogProvider {
    async fn stage_definition(
        &self,
        tenant_id: &TenantId,
        stage: &str,
    ) -> Result<Option<StageDefinition>, CapabilityError> {
        Ok(self.catalog(tenant_id).await?.definition(stage))
    }

    async fn initial_stage(&self, tenant_id: &TenantId) -> Result<StageDefinition, CapabilityError> {
        Ok(self.catalog(tenant_id).await?.initial_stage())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dealflow_core::capabilities::StageCatalogProvider;
    use dealflow_core::catalog::StageDefinition;
    use dealflow_core::domain::TenantId;
    use dealflow_db::repositories::{InMemoryStageCatalogRepository, StageCatalogRepository};

    use super::RepositoryStageCatalogProvider;

    #[tokio::test]
    async fn tenant_rows_override_defaults_and_unknown_stages_resolve_to_zero() {
        let repo = Arc::new(InMemoryStageCatalogRepository::default());
        let tenant = TenantId("T-1".to_string());
        repo.save(
            &tenant,
            StageDefinition {
                name: "Calificado".to_string(),
                probability: 45,
                display_order: 3,
                required_fields: vec!["painNeed".to_string()],
                closed: false,
            },
        )
        .await
        .expect("save");
        let provider = RepositoryStageCatalogProvider::new(repo);

        assert_eq!(provider.probability_for(&tenant, "calificado").await.expect("p"), 45);
        assert_eq!(provider.probability_for(&tenant, "Propuesta").await.expect("p"), 60);
        assert_eq!(provider.probability_for(&tenant, "Unheard of").await.expect("p"), 0);
        assert!(provider.required_fields_for(&tenant, "Unheard of").await.expect("r").is_empty());

        let other = TenantId("T-2".to_string());
        assert_eq!(provider.initial_stage(&other).await.expect("initial").name, "Prospecto");
        assert_eq!(provider.initial_stage(&tenant).await.expect("initial").name, "Calificado");
    }
}
