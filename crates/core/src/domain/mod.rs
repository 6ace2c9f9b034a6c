pub mod activity;
pub mod execution;
pub mod opportunity;
pub mod playbook;
pub mod reminder;
pub mod territory;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub email: Option<String>,
}

/// Something that knows its own identifier, so a [`Ref`] can always yield an id.
pub trait Identified {
    type Id: Clone;

    fn identifier(&self) -> &Self::Id;
}

impl Identified for UserProfile {
    type Id = UserId;

    fn identifier(&self) -> &UserId {
        &self.id
    }
}

/// A reference to another aggregate that is either a bare id or the loaded record.
///
/// Callers that only need the id use [`Ref::id`]; callers that need the data match on
/// `Resolved` and otherwise go through a resolver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Ref<T: Identified> {
    Reference(T::Id),
    Resolved(T),
}

impl<T: Identified> Ref<T> {
    pub fn id(&self) -> &T::Id {
        match self {
            Self::Reference(id) => id,
            Self::Resolved(value) => value.identifier(),
        }
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Self::Reference(_) => None,
            Self::Resolved(value) => Some(value),
        }
    }

    pub fn into_reference(self) -> Self {
        match self {
            Self::Reference(id) => Self::Reference(id),
            Self::Resolved(value) => Self::Reference(value.identifier().clone()),
        }
    }
}

pub type UserRef = Ref<UserProfile>;
