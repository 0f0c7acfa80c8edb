//! Caller-facing entry points.
//!
//! [`Drydock`] is what applications hold: it creates blueprints, requests
//! and releases leases, waits for activation, and answers queries with
//! policy checks. Everything it does is either a store transaction or a
//! command plus a scheduled task; the actual work happens in workers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::blueprint::BlueprintRegistry;
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{AttributeMap, Blueprint, Lease, LeaseStatus, Resource};
use crate::core::policy::{require, Actor, Capability};
use crate::core::store::{StoreExt, Tables};
use crate::util::{BlueprintRef, LeaseRef, ResourceRef, TaskId};

/// Longest the fallback poll in [`Drydock::wait_until_active`] may sleep.
pub const MAX_WAIT_POLL: Duration = Duration::from_secs(1);

/// A request for a lease.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Resource type wanted.
    pub resource_type: String,
    /// Attributes recorded on the lease.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// Attributes the resource must carry.
    #[serde(default)]
    pub constraints: AttributeMap,
    /// Expiration deadline, epoch milliseconds.
    #[serde(default)]
    pub until: Option<u64>,
    /// Owning identity.
    #[serde(default)]
    pub owner: Option<String>,
    /// Tasks to resume on activation.
    #[serde(default)]
    pub awaken_task_ids: Vec<TaskId>,
}

impl LeaseRequest {
    /// Request a lease on a resource of `resource_type`.
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    /// Set a lease attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Require a resource attribute.
    #[must_use]
    pub fn with_constraint(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    /// Expire at `epoch_ms`.
    #[must_use]
    pub const fn until(mut self, epoch_ms: u64) -> Self {
        self.until = Some(epoch_ms);
        self
    }

    /// Record an owner.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    fn into_lease(self) -> Lease {
        let mut lease = Lease::new(self.resource_type);
        lease.attributes = self.attributes;
        lease.constraints = self.constraints;
        lease.until = self.until;
        lease.owner = self.owner;
        lease.awaken_task_ids = self.awaken_task_ids;
        lease
    }
}

/// A lease with its bound resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    /// The lease.
    pub lease: Lease,
    /// The resource it is bound to, if any.
    pub resource: Option<Resource>,
}

/// A resource with its blueprint and leases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// The resource.
    pub resource: Resource,
    /// The blueprint that created it.
    pub blueprint: Blueprint,
    /// Leases bound to it, in any status.
    pub leases: Vec<Lease>,
}

/// The leasing engine facade.
#[derive(Debug, Clone)]
pub struct Drydock {
    ctx: DrydockContext,
    registry: Arc<BlueprintRegistry>,
    wait_poll: Duration,
}

impl Drydock {
    /// Facade over a context and strategy registry.
    #[must_use]
    pub fn new(ctx: DrydockContext, registry: Arc<BlueprintRegistry>) -> Self {
        Self {
            ctx,
            registry,
            wait_poll: MAX_WAIT_POLL,
        }
    }

    /// Set the fallback poll interval of [`wait_until_active`](Self::wait_until_active).
    /// Capped at one second.
    #[must_use]
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll = interval.min(MAX_WAIT_POLL);
        self
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &DrydockContext {
        &self.ctx
    }

    /// The strategy registry.
    #[must_use]
    pub fn registry(&self) -> &BlueprintRegistry {
        &self.registry
    }

    /// Save a new blueprint.
    ///
    /// # Errors
    ///
    /// [`DrydockError::Precondition`] if no strategy serves its type or it
    /// was already saved.
    pub fn create_blueprint(&self, blueprint: Blueprint) -> Result<Blueprint> {
        self.registry.strategy_for(&blueprint)?;
        let now = self.ctx.now_ms();
        let saved = self
            .ctx
            .store()
            .transaction(|tables| tables.insert_blueprint(blueprint, now))?;
        tracing::info!(blueprint = %saved.reference, type_tag = saved.type_tag(), name = %saved.name, "blueprint created");
        Ok(saved)
    }

    /// Enable or disable a blueprint as an allocation candidate.
    ///
    /// # Errors
    ///
    /// [`DrydockError::PermissionDenied`] without edit rights;
    /// [`DrydockError::NotFound`] for an unknown blueprint.
    pub fn set_blueprint_disabled(&self, actor: &Actor, blueprint: BlueprintRef, disabled: bool) -> Result<Blueprint> {
        self.ctx.store().transaction(|tables| {
            let mut row = tables.blueprint(blueprint)?.clone();
            require(actor, Some(&row), Capability::Edit, blueprint)?;
            row.disabled = disabled;
            tables.blueprints.insert(blueprint, row.clone());
            Ok(row)
        })
    }

    /// Create a pending lease and schedule its allocation.
    ///
    /// # Errors
    ///
    /// Store or task queue errors.
    pub fn request_lease(&self, actor: &Actor, request: LeaseRequest) -> Result<LeaseRef> {
        let mut lease = request.into_lease();
        if lease.owner.is_none() {
            if let Actor::User(name) = actor {
                lease.owner = Some(name.clone());
            }
        }
        let saved = self.ctx.queue_for_activation(lease)?;
        Ok(saved.reference)
    }

    /// Ask for a lease to be released. Returns once the command is posted;
    /// a worker does the release.
    ///
    /// # Errors
    ///
    /// [`DrydockError::PermissionDenied`] without edit rights;
    /// [`DrydockError::Precondition`] if the lease cannot be released.
    pub fn release_lease(&self, actor: &Actor, lease: LeaseRef) -> Result<()> {
        let (row, governing) = self
            .ctx
            .store()
            .snapshot(|tables| lease_with_blueprint(tables, lease))??;
        require(actor, governing.as_ref(), Capability::Edit, lease)?;
        if !row.can_release() {
            return Err(DrydockError::Precondition(format!("{lease} is {} and cannot be released", row.status)));
        }
        self.ctx.request_release(row.object_ref(), actor)?;
        self.ctx.schedule_lease_update(lease, None)?;
        tracing::info!(lease = %lease, actor = %actor, "lease release requested");
        Ok(())
    }

    /// Ask for a resource (and so its leases) to be released.
    ///
    /// # Errors
    ///
    /// [`DrydockError::PermissionDenied`] without edit rights;
    /// [`DrydockError::Precondition`] if the resource cannot be released.
    pub fn release_resource(&self, actor: &Actor, resource: ResourceRef) -> Result<()> {
        let (row, blueprint) = self.ctx.store().snapshot(|tables| {
            let row = tables.resource(resource)?.clone();
            let blueprint = tables.blueprint(row.blueprint)?.clone();
            Ok::<_, DrydockError>((row, blueprint))
        })??;
        require(actor, Some(&blueprint), Capability::Edit, resource)?;
        if !row.can_release() || !row.can_receive_commands() {
            return Err(DrydockError::Precondition(format!(
                "{resource} is {} and cannot be released",
                row.status
            )));
        }
        self.ctx.request_release(row.object_ref(), actor)?;
        self.ctx.schedule_resource_update(resource, None)?;
        tracing::info!(resource = %resource, actor = %actor, "resource release requested");
        Ok(())
    }

    /// Wait until the lease is active, re-reading the store each time.
    ///
    /// Wakes on in-process activation signals and otherwise polls at most
    /// once per poll interval.
    ///
    /// # Errors
    ///
    /// [`DrydockError::LeaseTerminated`] if the lease is released, broken,
    /// or destroyed first; [`DrydockError::Timeout`] when time runs out.
    pub async fn wait_until_active(&self, lease: LeaseRef, timeout: Duration) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + timeout;
        let waiter = self.ctx.waiter(lease);
        loop {
            let notified = waiter.signal().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.ctx.store().snapshot(|tables| tables.lease(lease).cloned())??;
            match current.status {
                LeaseStatus::Active => return Ok(current),
                LeaseStatus::Released | LeaseStatus::Broken | LeaseStatus::Destroyed => {
                    return Err(DrydockError::LeaseTerminated {
                        lease,
                        status: current.status.to_string(),
                    });
                }
                LeaseStatus::Pending | LeaseStatus::Acquired => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(lease = %lease, status = %current.status, "wait for activation timed out");
                return Err(DrydockError::Timeout);
            }
            let wait = self.wait_poll.min(deadline - now);
            // Timing out here just means another poll.
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Request a lease and wait for it. The returned guard releases the
    /// lease when dropped.
    ///
    /// # Errors
    ///
    /// As [`request_lease`](Self::request_lease) and
    /// [`wait_until_active`](Self::wait_until_active). A lease that never
    /// activated is released before returning.
    pub async fn acquire(&self, actor: &Actor, request: LeaseRequest, timeout: Duration) -> Result<LeaseGuard> {
        let lease = self.request_lease(actor, request)?;
        match self.wait_until_active(lease, timeout).await {
            Ok(active) => Ok(LeaseGuard {
                drydock: self.clone(),
                actor: actor.clone(),
                lease: active,
                released: false,
            }),
            Err(err) => {
                if let Err(release_err) = self.release_lease(actor, lease) {
                    tracing::debug!(lease = %lease, error = %release_err, "could not release abandoned lease");
                }
                Err(err)
            }
        }
    }

    /// Run `body` with an active lease and release it on every exit path.
    ///
    /// # Errors
    ///
    /// Errors from acquiring the lease or from `body`. A release failure is
    /// returned only if `body` succeeded.
    pub async fn with_lease<T, F, Fut>(&self, actor: &Actor, request: LeaseRequest, timeout: Duration, body: F) -> Result<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(actor, request, timeout).await?;
        let result = body(guard.lease().clone()).await;
        match result {
            Ok(value) => {
                guard.release()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(release_err) = guard.release() {
                    tracing::warn!(error = %release_err, "failed to release lease after error");
                }
                Err(err)
            }
        }
    }

    /// A lease and its resource, if the actor may view them.
    ///
    /// # Errors
    ///
    /// [`DrydockError::NotFound`] or [`DrydockError::PermissionDenied`].
    pub fn lease(&self, actor: &Actor, lease: LeaseRef) -> Result<LeaseSnapshot> {
        let (snapshot, governing) = self.ctx.store().snapshot(|tables| {
            let (row, governing) = lease_with_blueprint(tables, lease)?;
            let resource = row.resource.and_then(|r| tables.resources.get(&r).cloned());
            Ok::<_, DrydockError>((LeaseSnapshot { lease: row, resource }, governing))
        })??;
        require(actor, governing.as_ref(), Capability::View, lease)?;
        Ok(snapshot)
    }

    /// A resource, its blueprint, and its leases, if the actor may view them.
    ///
    /// # Errors
    ///
    /// [`DrydockError::NotFound`] or [`DrydockError::PermissionDenied`].
    pub fn resource(&self, actor: &Actor, resource: ResourceRef) -> Result<ResourceSnapshot> {
        let snapshot = self.ctx.store().snapshot(|tables| {
            let row = tables.resource(resource)?.clone();
            let blueprint = tables.blueprint(row.blueprint)?.clone();
            let leases = tables.leases_on(resource).cloned().collect();
            Ok::<_, DrydockError>(ResourceSnapshot {
                resource: row,
                blueprint,
                leases,
            })
        })??;
        require(actor, Some(&snapshot.blueprint), Capability::View, resource)?;
        Ok(snapshot)
    }

    /// Describe how to reach a lease's resource through `interface`.
    ///
    /// # Errors
    ///
    /// [`DrydockError::Precondition`] unless the lease is active, plus the
    /// errors of [`lease`](Self::lease).
    pub fn interface(&self, actor: &Actor, lease: LeaseRef, interface: &str) -> Result<Option<Value>> {
        let snapshot = self.lease(actor, lease)?;
        let resource = match (snapshot.lease.status, snapshot.resource) {
            (LeaseStatus::Active, Some(resource)) => resource,
            (status, _) => {
                return Err(DrydockError::Precondition(format!(
                    "{lease} is {status}; interfaces need an active lease"
                )))
            }
        };
        let blueprint = self
            .ctx
            .store()
            .snapshot(|tables| tables.blueprint(resource.blueprint).cloned())??;
        self.registry
            .strategy_for(&blueprint)?
            .interface(&blueprint, &resource, interface)
    }
}

/// The lease plus the blueprint whose policy governs it.
fn lease_with_blueprint(tables: &Tables, lease: LeaseRef) -> Result<(Lease, Option<Blueprint>)> {
    let row = tables.lease(lease)?.clone();
    let governing = row
        .resource
        .and_then(|r| tables.resources.get(&r))
        .and_then(|r| tables.blueprints.get(&r.blueprint))
        .cloned();
    Ok((row, governing))
}

/// An active lease released when the guard goes away.
///
/// Prefer [`release`](Self::release), which reports errors. Dropping the
/// guard posts the release best-effort and only logs failures.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lease"]
pub struct LeaseGuard {
    drydock: Drydock,
    actor: Actor,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    /// The lease as it was when it became active.
    #[must_use]
    pub const fn lease(&self) -> &Lease {
        &self.lease
    }

    /// The lease reference.
    #[must_use]
    pub const fn reference(&self) -> LeaseRef {
        self.lease.reference
    }

    /// Release the lease now.
    ///
    /// # Errors
    ///
    /// As [`Drydock::release_lease`].
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.drydock.release_lease(&self.actor, self.lease.reference)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.drydock.release_lease(&self.actor, self.lease.reference) {
            tracing::warn!(lease = %self.lease.reference, error = %err, "failed to release lease on drop");
        }
    }
}
