//! Records managed by the leasing engine and their status enums.
//!
//! Status enums carry their own transition tables. Every write path checks
//! `can_transition_to` against the *stored* status inside a transaction, so a
//! stale in-memory copy can never push an object along an invalid edge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::policy::{Actor, Policy};
use crate::util::{BlueprintRef, CommandRef, LeaseRef, ObjectRef, ResourceRef, TaskId};

/// Strategy-defined attribute values keyed by name.
pub type AttributeMap = BTreeMap<String, Value>;

/// Attribute recording why an object was broken.
pub const BROKEN_REASON_ATTRIBUTE: &str = "internal.brokenReason";

/// Lifecycle of a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Capacity is still being provisioned.
    Pending,
    /// Ready to accept leases.
    Open,
    /// Servicing leases.
    Active,
    /// No new leases; existing ones may finish.
    Closed,
    /// Released; waiting for destruction.
    Released,
    /// Unrecoverable strategy failure.
    Broken,
    /// Destroyed. Slot locks held by the resource are gone.
    Destroyed,
}

impl ResourceStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Released => "released",
            Self::Broken => "broken",
            Self::Destroyed => "destroyed",
        }
    }

    /// Whether `next` is a legal edge from this status.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ResourceStatus::{Active, Broken, Closed, Destroyed, Open, Pending, Released};
        matches!(
            (self, next),
            (Pending, Open | Active | Released | Broken)
                | (Open, Active | Closed | Released | Broken)
                | (Active, Closed | Released | Broken)
                | (Closed, Released | Broken)
                | (Released | Broken, Destroyed)
        )
    }

    /// Released or destroyed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Destroyed)
    }

    /// Still claims its underlying capacity.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Open | Self::Active | Self::Closed)
    }

    /// Open or active.
    #[must_use]
    pub const fn accepts_leases(self) -> bool {
        matches!(self, Self::Open | Self::Active)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`Lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Waiting for the allocator.
    Pending,
    /// Bound to a resource, not yet usable.
    Acquired,
    /// Usable.
    Active,
    /// Released; waiting for destruction.
    Released,
    /// Could not be satisfied, or its resource failed.
    Broken,
    /// Destroyed. Slot locks held by the lease are gone.
    Destroyed,
}

impl LeaseStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acquired => "acquired",
            Self::Active => "active",
            Self::Released => "released",
            Self::Broken => "broken",
            Self::Destroyed => "destroyed",
        }
    }

    /// Whether `next` is a legal edge from this status.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use LeaseStatus::{Acquired, Active, Broken, Destroyed, Pending, Released};
        matches!(
            (self, next),
            (Pending, Acquired | Active | Released | Broken)
                | (Acquired, Active | Released | Broken)
                | (Active, Released | Broken)
                | (Released | Broken, Destroyed)
        )
    }

    /// Released or destroyed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Destroyed)
    }

    /// Pending, acquired, or active.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Acquired | Self::Active)
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured allocation strategy for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Stable reference.
    pub reference: BlueprintRef,
    /// Storage identifier, assigned on first write.
    pub id: Option<u64>,
    /// Human-readable name.
    pub name: String,
    /// Strategy type tag. Fixed for the life of the blueprint.
    type_tag: String,
    /// Disabled blueprints are never allocation candidates.
    pub disabled: bool,
    /// Strategy-specific configuration.
    pub fields: AttributeMap,
    /// Who may view the blueprint and everything allocated from it.
    pub view_policy: Policy,
    /// Who may change the blueprint and release what it allocated.
    pub edit_policy: Policy,
    /// Creation time.
    pub created_at_ms: u64,
}

impl Blueprint {
    /// Start a new, unsaved blueprint bound to the strategy `type_tag`.
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            reference: BlueprintRef::generate(),
            id: None,
            name: name.into(),
            type_tag: type_tag.into(),
            disabled: false,
            fields: AttributeMap::new(),
            view_policy: Policy::Public,
            edit_policy: Policy::Public,
            created_at_ms: 0,
        }
    }

    /// The strategy type this blueprint is bound to.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// Set a strategy field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Replace the view and edit policies.
    #[must_use]
    pub fn with_policies(mut self, view: Policy, edit: Policy) -> Self {
        self.view_policy = view;
        self.edit_policy = edit;
        self
    }

    /// Read a strategy field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// A unit of allocated capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable reference, generated before the first write.
    pub reference: ResourceRef,
    /// Storage identifier, assigned on first write.
    pub id: Option<u64>,
    /// The blueprint that created this resource. Never changes.
    pub blueprint: BlueprintRef,
    /// Resource type, copied from the blueprint.
    pub type_tag: String,
    /// Display name chosen by the strategy.
    pub name: String,
    /// Current status.
    pub status: ResourceStatus,
    /// Strategy-defined attributes.
    pub attributes: AttributeMap,
    /// Strategy-defined capabilities.
    pub capabilities: BTreeSet<String>,
    /// Expiration deadline, epoch milliseconds.
    pub until: Option<u64>,
    /// Owning identity, if any.
    pub owner: Option<String>,
    /// Tasks to resume when the resource activates.
    #[serde(default)]
    pub awaken_task_ids: Vec<TaskId>,
    /// Row version, bumped on every write.
    pub version: u64,
    /// Creation time.
    pub created_at_ms: u64,
    /// Last write time.
    pub updated_at_ms: u64,
}

impl Resource {
    /// Read an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Read a string attribute.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Whether every constraint matches an attribute of this resource.
    #[must_use]
    pub fn satisfies(&self, constraints: &AttributeMap) -> bool {
        constraints
            .iter()
            .all(|(key, value)| self.attributes.get(key) == Some(value))
    }

    /// Whether the resource has the named capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Not yet released or destroyed.
    #[must_use]
    pub const fn can_release(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether commands posted to this resource will still be acted on.
    #[must_use]
    pub const fn can_receive_commands(&self) -> bool {
        !matches!(
            self.status,
            ResourceStatus::Released | ResourceStatus::Broken | ResourceStatus::Destroyed
        )
    }

    /// Whether the resource is serving and subject to expiration.
    #[must_use]
    pub const fn can_update(&self) -> bool {
        self.status.accepts_leases()
    }

    /// The polymorphic reference used for locks and commands.
    #[must_use]
    pub const fn object_ref(&self) -> ObjectRef {
        ObjectRef::Resource(self.reference)
    }
}

/// A claim against a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Stable reference, generated before the first write.
    pub reference: LeaseRef,
    /// Storage identifier, assigned on first write.
    pub id: Option<u64>,
    /// Requested resource type.
    pub resource_type: String,
    /// Current status.
    pub status: LeaseStatus,
    /// Bound resource, set on acquisition.
    pub resource: Option<ResourceRef>,
    /// Caller- and strategy-defined attributes.
    pub attributes: AttributeMap,
    /// Resource attributes the bound resource must carry.
    #[serde(default)]
    pub constraints: AttributeMap,
    /// Expiration deadline, epoch milliseconds.
    pub until: Option<u64>,
    /// Owning identity, if any.
    pub owner: Option<String>,
    /// Tasks to resume when the lease activates.
    #[serde(default)]
    pub awaken_task_ids: Vec<TaskId>,
    /// Row version, bumped on every write.
    pub version: u64,
    /// Creation time.
    pub created_at_ms: u64,
    /// Last write time.
    pub updated_at_ms: u64,
}

impl Lease {
    /// Start a new, unsaved lease for `resource_type`.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            reference: LeaseRef::generate(),
            id: None,
            resource_type: resource_type.into(),
            status: LeaseStatus::Pending,
            resource: None,
            attributes: AttributeMap::new(),
            constraints: AttributeMap::new(),
            until: None,
            owner: None,
            awaken_task_ids: Vec::new(),
            version: 0,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    /// Set an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Require the bound resource to carry `key = value`.
    #[must_use]
    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// Read an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// False before the lease is saved or once it is released or destroyed.
    #[must_use]
    pub const fn can_release(&self) -> bool {
        self.id.is_some() && !self.status.is_terminal()
    }

    /// Only active leases are subject to expiration.
    #[must_use]
    pub fn can_update(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    /// Pending or acquired.
    #[must_use]
    pub const fn is_activating(&self) -> bool {
        matches!(self.status, LeaseStatus::Pending | LeaseStatus::Acquired)
    }

    /// Currently usable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    /// The polymorphic reference used for locks and commands.
    #[must_use]
    pub const fn object_ref(&self) -> ObjectRef {
        ObjectRef::Lease(self.reference)
    }
}

/// Instruction carried by a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Move the target toward released/destroyed on its next update.
    Release,
    /// A kind this engine does not interpret.
    Other(String),
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => f.write_str("release"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// An asynchronous instruction queued against a resource or lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Stable reference.
    pub reference: CommandRef,
    /// Monotonic insertion sequence.
    pub sequence: u64,
    /// Target object.
    pub target: ObjectRef,
    /// Who posted the command.
    pub author: Actor,
    /// What to do.
    pub kind: CommandKind,
    /// Flipped once by the reader; never reset.
    pub consumed: bool,
    /// Creation time.
    pub created_at_ms: u64,
}

/// Exclusive ownership of a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLock {
    /// The globally unique key.
    pub key: String,
    /// The object holding it.
    pub holder: ObjectRef,
    /// When it was taken.
    pub acquired_at_ms: u64,
}
