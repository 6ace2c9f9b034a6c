use thiserror::Error;

use crate::capabilities::CapabilityError;
use crate::execution::ExecutionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("cannot enter stage `{stage}`: missing required fields {missing:?}")]
    MissingFields { stage: String, missing: Vec<String> },
    #[error("invalid playbook definition: {0}")]
    InvalidPlaybook(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    /// A concurrent writer changed the record first; reload and retry.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    /// Missing fields when this is a stage validation failure.
    pub fn missing_fields(&self) -> Option<&[String]> {
        match self {
            Self::Domain(DomainError::MissingFields { missing, .. }) => Some(missing),
            _ => None,
        }
    }
}

impl From<CapabilityError> for ApplicationError {
    fn from(value: CapabilityError) -> Self {
        match value {
            CapabilityError::Storage(message) => Self::Persistence(message),
            other => Self::Integration(other.to_string()),
        }
    }
}

impl From<ExecutionError> for ApplicationError {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::NotFound(id) => Self::not_found("execution", id),
            other => Self::Domain(DomainError::InvariantViolation(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Conflict { .. } => "The record changed since it was read. Reload and retry.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::NotFound { entity, id } => {
                Self::NotFound { message: format!("{entity} `{id}`"), correlation_id }
            }
            ApplicationError::Conflict(message) => Self::Conflict { message, correlation_id },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
