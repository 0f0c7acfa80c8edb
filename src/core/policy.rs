//! Acting identities and inherited visibility.
//!
//! Policy evaluation proper lives outside the engine. The engine only needs
//! the inheritance chain: a resource is governed by its blueprint's policy, a
//! lease by its resource's (and so, transitively, the blueprint's). Internal
//! work runs as [`Actor::System`], which is passed explicitly wherever a
//! check would otherwise apply.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::error::{DrydockError, Result};
use crate::core::model::Blueprint;

/// The identity on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The engine itself. Bypasses every policy check.
    System,
    /// A named user or service account.
    User(String),
}

impl Actor {
    /// A named user.
    pub fn user(name: impl Into<String>) -> Self {
        Self::User(name.into())
    }

    /// Whether this is the engine's own identity.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User(name) => write!(f, "user:{name}"),
        }
    }
}

/// What an actor wants to do with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read the object.
    View,
    /// Change or release the object.
    Edit,
}

/// Who holds a capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Everyone.
    #[default]
    Public,
    /// Only the listed users.
    Users(BTreeSet<String>),
    /// Nobody but the system.
    NoOne,
}

impl Policy {
    /// Whether `actor` satisfies this policy.
    #[must_use]
    pub fn allows(&self, actor: &Actor) -> bool {
        match (actor, self) {
            (Actor::System, _) | (_, Self::Public) => true,
            (Actor::User(name), Self::Users(users)) => users.contains(name),
            (Actor::User(_), Self::NoOne) => false,
        }
    }
}

/// The policy governing `capability` on a blueprint and everything it owns.
#[must_use]
pub const fn blueprint_policy(blueprint: &Blueprint, capability: Capability) -> &Policy {
    match capability {
        Capability::View => &blueprint.view_policy,
        Capability::Edit => &blueprint.edit_policy,
    }
}

/// Check `capability` against the blueprint governing an object.
///
/// `governing` is `None` for an unbound lease, which is open to everyone.
///
/// # Errors
///
/// Returns [`DrydockError::PermissionDenied`] if the actor lacks the capability.
pub fn require(
    actor: &Actor,
    governing: Option<&Blueprint>,
    capability: Capability,
    object: impl std::fmt::Display,
) -> Result<()> {
    let allowed = governing.is_none_or(|bp| blueprint_policy(bp, capability).allows(actor));
    if allowed {
        Ok(())
    } else {
        Err(DrydockError::PermissionDenied(format!(
            "{actor} lacks {capability:?} on {object}"
        )))
    }
}
