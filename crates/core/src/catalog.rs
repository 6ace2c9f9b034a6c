//! Stage catalog: stage names, win probabilities and the fields each stage requires.
//!
//! Tenants may define their own stages. Any stage a tenant does not define resolves
//! against the compiled default catalog below.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capabilities::{CapabilityError, StageCatalogProvider};
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub probability: u8,
    pub display_order: u32,
    pub required_fields: Vec<String>,
    /// Terminal stage (won or lost). Closed opportunities are not aged.
    pub closed: bool,
}

pub const STAGE_PROSPECTO: &str = "Prospecto";
pub const STAGE_CONTACTADO: &str = "Contactado";
pub const STAGE_CALIFICADO: &str = "Calificado";
pub const STAGE_DEMO: &str = "Demo/Discovery";
pub const STAGE_PROPUESTA: &str = "Propuesta";
pub const STAGE_NEGOCIACION: &str = "Negociación";
pub const STAGE_CIERRE_GANADO: &str = "Cierre ganado";
pub const STAGE_CIERRE_PERDIDO: &str = "Cierre perdido";

const DEFAULT_STAGES: &[(&str, u8, bool, &[&str])] = &[
    (STAGE_PROSPECTO, 10, false, &["nextStep", "nextStepDue"]),
    (STAGE_CONTACTADO, 20, false, &["nextStep", "nextStepDue"]),
    (
        STAGE_CALIFICADO,
        40,
        false,
        &["nextStep", "nextStepDue", "painNeed", "budgetFit", "decisionMaker", "timeline"],
    ),
    (
        STAGE_DEMO,
        50,
        false,
        &["nextStep", "nextStepDue", "painNeed", "decisionMaker", "useCases"],
    ),
    (
        STAGE_PROPUESTA,
        60,
        false,
        &["nextStep", "nextStepDue", "amount", "currency", "expectedCloseDate"],
    ),
    (
        STAGE_NEGOCIACION,
        80,
        false,
        &["nextStep", "nextStepDue", "amount", "currency", "stakeholders"],
    ),
    (STAGE_CIERRE_GANADO, 100, true, &["amount", "currency"]),
    (STAGE_CIERRE_PERDIDO, 0, true, &["reasonLost"]),
];

/// The compiled fallback catalog, in display order.
pub fn default_stages() -> Vec<StageDefinition> {
    DEFAULT_STAGES
        .iter()
        .enumerate()
        .map(|(index, (name, probability, closed, required))| StageDefinition {
            name: (*name).to_string(),
            probability: *probability,
            display_order: index as u32 + 1,
            required_fields: required.iter().map(|field| (*field).to_string()).collect(),
            closed: *closed,
        })
        .collect()
}

pub fn same_stage(left: &str, right: &str) -> bool {
    left.trim().to_lowercase() == right.trim().to_lowercase()
}

/// A tenant's stage overrides layered over the default catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageCatalog {
    tenant_stages: Vec<StageDefinition>,
}

impl StageCatalog {
    pub fn new(tenant_stages: Vec<StageDefinition>) -> Self {
        Self { tenant_stages }
    }

    pub fn tenant_stages(&self) -> &[StageDefinition] {
        &self.tenant_stages
    }

    pub fn definition(&self, stage: &str) -> Option<StageDefinition> {
        self.tenant_stages
            .iter()
            .find(|definition| same_stage(&definition.name, stage))
            .cloned()
            .or_else(|| {
                default_stages().into_iter().find(|definition| same_stage(&definition.name, stage))
            })
    }

    pub fn required_fields(&self, stage: &str) -> Vec<String> {
        self.definition(stage).map(|definition| definition.required_fields).unwrap_or_default()
    }

    pub fn probability(&self, stage: &str) -> u8 {
        self.definition(stage).map(|definition| definition.probability).unwrap_or(0)
    }

    /// Lowest display order among tenant stages, or the default catalog's first stage
    /// when the tenant has none.
    pub fn initial_stage(&self) -> StageDefinition {
        self.tenant_stages
            .iter()
            .min_by_key(|definition| definition.display_order)
            .cloned()
            .unwrap_or_else(|| {
                let mut defaults = default_stages();
                defaults.remove(0)
            })
    }

    pub fn is_closed(&self, stage: &str) -> bool {
        self.definition(stage).is_some_and(|definition| definition.closed)
    }
}

/// In-process provider keyed by tenant, for fixed catalogs and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticStageCatalogProvider {
    catalogs: HashMap<TenantId, StageCatalog>,
}

impl StaticStageCatalogProvider {
    pub fn with_tenant(mut self, tenant_id: TenantId, catalog: StageCatalog) -> Self {
        self.catalogs.insert(tenant_id, catalog);
        self
    }

    fn catalog(&self, tenant_id: &TenantId) -> StageCatalog {
        self.catalogs.get(tenant_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StageCatalogProvider for StaticStageCatalogProvider {
    async fn stage_definition(
        &self,
        tenant_id: &TenantId,
        stage: &str,
    ) -> Result<Option<StageDefinition>, CapabilityError> {
        Ok(self.catalog(tenant_id).definition(stage))
    }

    async fn initial_stage(&self, tenant_id: &TenantId) -> Result<StageDefinition, CapabilityError> {
        Ok(self.catalog(tenant_id).initial_stage())
    }
}
