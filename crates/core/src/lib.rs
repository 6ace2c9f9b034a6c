pub mod audit;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod errors;
pub mod execution;
pub mod scheduling;
pub mod scoring;
pub mod stage_machine;

pub use capabilities::{
    ActivityStore, CapabilityError, Channel, NotificationSender, OutboundMessage, Recipient,
    StageCatalogProvider,
};
pub use catalog::{default_stages, StageCatalog, StageDefinition, StaticStageCatalogProvider};
pub use domain::activity::{Activity, ActivityId, ActivityKind};
pub use domain::execution::{
    ExecutionId, ExecutionKey, ExecutionStatus, ExecutionTransitionEvent, PlaybookExecution,
};
pub use domain::opportunity::{
    NewOpportunity, Opportunity, OpportunityId, OpportunityPatch, Pipeline, StageHistoryEntry,
};
pub use domain::playbook::{Playbook, PlaybookId, PlaybookStep, PlaybookTrigger, StepAction};
pub use domain::reminder::{NewReminder, Reminder, ReminderId, ReminderStatus, ReminderType};
pub use domain::territory::Territory;
pub use domain::{Ref, TenantId, UserId, UserProfile, UserRef};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use execution::{ExecutionError, ExecutionLedger, LedgerConfig};
pub use scheduling::Trigger;
pub use scoring::{ScoreCard, ScoringEngine};
pub use stage_machine::{OpportunityStateMachine, StageChangeOutcome, StageTarget};
