//! Typed references for engine objects.
//!
//! Every blueprint, resource, lease, and command gets a random UUID at
//! construction time, before it is ever persisted. Resource templates rely on
//! this: slot locks are recorded against the reference in the same transaction
//! that first writes the row.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to queued tasks by the task queue.
pub type TaskId = u64;

macro_rules! object_ref {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random reference.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0.simple())
            }
        }
    };
}

object_ref!(
    /// Reference to a blueprint.
    BlueprintRef,
    "blueprint"
);
object_ref!(
    /// Reference to a resource.
    ResourceRef,
    "resource"
);
object_ref!(
    /// Reference to a lease.
    LeaseRef,
    "lease"
);
object_ref!(
    /// Reference to a command.
    CommandRef,
    "command"
);

/// An object that can hold slot locks and receive commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ObjectRef {
    /// A resource.
    Resource(ResourceRef),
    /// A lease.
    Lease(LeaseRef),
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(r) => r.fmt(f),
            Self::Lease(l) => l.fmt(f),
        }
    }
}

impl From<ResourceRef> for ObjectRef {
    fn from(value: ResourceRef) -> Self {
        Self::Resource(value)
    }
}

impl From<LeaseRef> for ObjectRef {
    fn from(value: LeaseRef) -> Self {
        Self::Lease(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_prefix() {
        let lease = LeaseRef::generate();
        assert!(lease.to_string().starts_with("lease-"));
        assert!(ObjectRef::from(lease).to_string().starts_with("lease-"));
        assert!(ResourceRef::generate().to_string().starts_with("resource-"));
    }

    #[test]
    fn generated_refs_are_distinct() {
        assert_ne!(ResourceRef::generate(), ResourceRef::generate());
    }

    #[test]
    fn object_ref_serializes_tagged() {
        let id = Uuid::nil();
        let value = serde_json::to_value(ObjectRef::Lease(LeaseRef::from_uuid(id))).unwrap();
        assert_eq!(value["kind"], "lease");
        assert_eq!(value["id"], id.to_string());
    }
}
