//! Orchestration services over the pure domain in `dealflow-core` and the repositories in
//! `dealflow-db`.

pub mod assignment;
pub mod catalog_provider;
pub mod executor;
pub mod notifier;
pub mod operator;
pub mod opportunity_service;
pub mod playbook_service;
pub mod poller;
pub mod reminders;
pub mod rendering;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use assignment::OwnerAssigner;
pub use catalog_provider::RepositoryStageCatalogProvider;
pub use executor::{ExecutorConfig, ExecutorPassReport, PlaybookExecutor};
pub use notifier::{sender_from_config, LogNotificationSender, WebhookNotificationSender};
pub use operator::ExecutionOperator;
pub use opportunity_service::{CaptureOutcome, OpportunityService};
pub use playbook_service::{PlaybookDefinition, PlaybookService};
pub use poller::{spawn_poller, PollerHandle};
pub use reminders::{ReminderConfig, ReminderEngine, ReminderPassReport};
pub use rendering::MessageRenderer;
pub use runtime::WorkflowRuntime;
pub use scheduler::{PlaybookScheduler, ScheduleReport};
