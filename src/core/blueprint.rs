//! Blueprint strategy contract and registry.
//!
//! A strategy implements allocation for one resource type. The allocator
//! only ever talks to the [`BlueprintStrategy`] trait; blueprints pick their
//! strategy by type tag through the [`BlueprintRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{Blueprint, Lease, Resource};

/// Allocation behavior for one resource type.
///
/// The `can_*` checks are advisory: they may be stale by the time the
/// allocator acts, and the real serialization point is slot-lock
/// acquisition inside `allocate` and `acquire_lease`.
#[async_trait]
pub trait BlueprintStrategy: Send + Sync {
    /// The resource type this strategy allocates.
    fn type_tag(&self) -> &str;

    /// Cheap structural check: could this blueprint ever satisfy the lease?
    fn can_ever_allocate(&self, blueprint: &Blueprint, lease: &Lease) -> bool;

    /// Whether the blueprint has capacity for a new resource right now.
    async fn can_allocate_now(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<bool>;

    /// Create a resource for the lease. Returns
    /// [`DrydockError::SlotLockConflict`] when losing a race for capacity.
    async fn allocate(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<Resource>;

    /// Whether the resource could take this lease right now.
    async fn can_acquire_lease(
        &self,
        ctx: &DrydockContext,
        blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<bool>;

    /// Bind the lease to the resource.
    async fn acquire_lease(
        &self,
        ctx: &DrydockContext,
        blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<Lease>;

    /// Tear down the capacity behind a released resource.
    async fn destroy_resource(&self, ctx: &DrydockContext, blueprint: &Blueprint, resource: &Resource) -> Result<()>;

    /// Tear down whatever the lease set up on its resource.
    async fn destroy_lease(
        &self,
        ctx: &DrydockContext,
        blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<()>;

    /// Called after a lease on one of this blueprint's resources is released.
    async fn did_release_lease(
        &self,
        _ctx: &DrydockContext,
        _blueprint: &Blueprint,
        _resource: &Resource,
        _lease: &Lease,
    ) -> Result<()> {
        Ok(())
    }

    /// Describe how to reach the resource through `interface`, if supported.
    fn interface(&self, _blueprint: &Blueprint, _resource: &Resource, _interface: &str) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Strategies by type tag.
#[derive(Clone, Default)]
pub struct BlueprintRegistry {
    strategies: HashMap<String, Arc<dyn BlueprintStrategy>>,
}

impl std::fmt::Debug for BlueprintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlueprintRegistry")
            .field("types", &self.type_tags())
            .finish()
    }
}

impl BlueprintRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy, replacing any previous one for the same type.
    pub fn register(&mut self, strategy: Arc<dyn BlueprintStrategy>) {
        let tag = strategy.type_tag().to_string();
        if self.strategies.insert(tag.clone(), strategy).is_some() {
            tracing::warn!(type_tag = %tag, "replaced blueprint strategy");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl BlueprintStrategy + 'static) -> Self {
        self.register(Arc::new(strategy));
        self
    }

    /// The strategy for a type tag.
    #[must_use]
    pub fn get(&self, type_tag: &str) -> Option<Arc<dyn BlueprintStrategy>> {
        self.strategies.get(type_tag).cloned()
    }

    /// The strategy governing a blueprint.
    ///
    /// # Errors
    ///
    /// [`DrydockError::Precondition`] if no strategy is registered for the
    /// blueprint's type.
    pub fn strategy_for(&self, blueprint: &Blueprint) -> Result<Arc<dyn BlueprintStrategy>> {
        self.get(blueprint.type_tag()).ok_or_else(|| {
            DrydockError::Precondition(format!(
                "no strategy registered for blueprint type `{}`",
                blueprint.type_tag()
            ))
        })
    }

    /// Registered type tags, sorted.
    #[must_use]
    pub fn type_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.strategies.keys().cloned().collect();
        tags.sort();
        tags
    }
}
