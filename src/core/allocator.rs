//! Allocation protocol.
//!
//! Binds a pending lease to a resource by walking the candidate blueprints:
//! first existing resources that can take the lease, then fresh resources
//! from blueprints with spare capacity. Candidates are shuffled so that
//! concurrent allocators spread out instead of colliding on the same
//! binding. Contention triggers another round; once every round is spent
//! the lease is broken and the collected errors are returned.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::json;

use crate::core::audit::AuditKind;
use crate::core::blueprint::{BlueprintRegistry, BlueprintStrategy};
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::model::{Blueprint, Lease, LeaseStatus, Resource};
use crate::core::store::StoreExt;
use crate::util::LeaseRef;

/// Result of one allocate task.
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    /// The lease is now bound.
    Acquired(Lease),
    /// The lease was no longer pending; nothing was done.
    Skipped(LeaseStatus),
}

type Candidate = (Blueprint, Arc<dyn BlueprintStrategy>);

/// Runs the allocation protocol for leases.
#[derive(Debug, Clone)]
pub struct Allocator {
    ctx: DrydockContext,
    registry: Arc<BlueprintRegistry>,
    rounds: u32,
}

impl Allocator {
    /// Allocator making at most `rounds` passes over the candidates.
    #[must_use]
    pub fn new(ctx: DrydockContext, registry: Arc<BlueprintRegistry>, rounds: u32) -> Self {
        Self {
            ctx,
            registry,
            rounds: rounds.max(1),
        }
    }

    /// Bind `lease` to a resource.
    ///
    /// Redelivery is safe: a lease that is no longer pending is skipped.
    ///
    /// # Errors
    ///
    /// [`DrydockError::AllocationFailed`] once every candidate has failed,
    /// after breaking the lease. An empty error list means there were no
    /// candidates at all.
    pub async fn allocate_lease(&self, lease: LeaseRef) -> Result<AllocationOutcome> {
        let current = self.load(lease)?;
        if current.status != LeaseStatus::Pending {
            tracing::debug!(lease = %lease, status = %current.status, "lease no longer pending; skipping allocation");
            return Ok(AllocationOutcome::Skipped(current.status));
        }

        let candidates = self.candidates(&current)?;
        tracing::debug!(lease = %lease, candidates = candidates.len(), "allocating lease");

        let mut errors = Vec::new();
        for round in 0..self.rounds {
            let mut contended = false;

            for (blueprint, strategy, resource) in self.existing_resources(&candidates, &current)? {
                match strategy.can_acquire_lease(&self.ctx, &blueprint, &resource, &current).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        errors.push(err);
                        continue;
                    }
                }
                match strategy.acquire_lease(&self.ctx, &blueprint, &resource, &current).await {
                    Ok(acquired) => return Ok(AllocationOutcome::Acquired(acquired)),
                    Err(err) => {
                        if let Some(skipped) = self.check_still_pending(lease)? {
                            return Ok(skipped);
                        }
                        contended |= err.is_contention();
                        errors.push(err);
                    }
                }
            }

            let mut allocatable = Vec::new();
            for (blueprint, strategy) in &candidates {
                match strategy.can_allocate_now(&self.ctx, blueprint, &current).await {
                    Ok(true) => allocatable.push((blueprint.clone(), Arc::clone(strategy))),
                    Ok(false) => {}
                    Err(err) => errors.push(err),
                }
            }
            allocatable.shuffle(&mut rand::rng());

            for (blueprint, strategy) in allocatable {
                let resource = match strategy.allocate(&self.ctx, &blueprint, &current).await {
                    Ok(resource) => resource,
                    Err(err) => {
                        tracing::debug!(lease = %lease, blueprint = %blueprint.reference, error = %err, "allocation attempt failed");
                        contended |= err.is_contention();
                        errors.push(err);
                        continue;
                    }
                };
                match strategy.acquire_lease(&self.ctx, &blueprint, &resource, &current).await {
                    Ok(acquired) => return Ok(AllocationOutcome::Acquired(acquired)),
                    Err(err) => {
                        if let Some(skipped) = self.check_still_pending(lease)? {
                            return Ok(skipped);
                        }
                        contended |= err.is_contention();
                        errors.push(err);
                    }
                }
            }

            if !contended {
                break;
            }
            tracing::debug!(lease = %lease, round, "contention during allocation; retrying");
        }

        self.fail(lease, errors)
    }

    fn load(&self, lease: LeaseRef) -> Result<Lease> {
        self.ctx.store().snapshot(|tables| tables.lease(lease).cloned())?
    }

    /// `Some` if the lease left pending while we were working on it.
    fn check_still_pending(&self, lease: LeaseRef) -> Result<Option<AllocationOutcome>> {
        let status = self.load(lease)?.status;
        Ok((status != LeaseStatus::Pending).then_some(AllocationOutcome::Skipped(status)))
    }

    /// Enabled blueprints whose strategy serves the lease's type and could
    /// ever satisfy it.
    fn candidates(&self, lease: &Lease) -> Result<Vec<Candidate>> {
        let blueprints: Vec<Blueprint> = self.ctx.store().snapshot(|tables| {
            tables
                .blueprints
                .values()
                .filter(|bp| !bp.disabled && bp.type_tag() == lease.resource_type)
                .cloned()
                .collect()
        })?;
        Ok(blueprints
            .into_iter()
            .filter_map(|bp| {
                let strategy = self.registry.get(bp.type_tag())?;
                strategy.can_ever_allocate(&bp, lease).then_some((bp, strategy))
            })
            .collect())
    }

    /// Serving resources of the candidate blueprints, shuffled.
    fn existing_resources(
        &self,
        candidates: &[Candidate],
        lease: &Lease,
    ) -> Result<Vec<(Blueprint, Arc<dyn BlueprintStrategy>, Resource)>> {
        let mut found = self.ctx.store().snapshot(|tables| {
            candidates
                .iter()
                .flat_map(move |(bp, strategy)| {
                    tables
                        .resources
                        .values()
                        .filter(move |r| {
                            r.blueprint == bp.reference
                                && r.status.accepts_leases()
                                && r.type_tag == lease.resource_type
                                && r.satisfies(&lease.constraints)
                        })
                        .map(move |r| (bp.clone(), Arc::clone(strategy), r.clone()))
                })
                .collect::<Vec<_>>()
        })?;
        found.shuffle(&mut rand::rng());
        Ok(found)
    }

    fn fail(&self, lease: LeaseRef, errors: Vec<DrydockError>) -> Result<AllocationOutcome> {
        let error = DrydockError::AllocationFailed { lease, errors };
        match self.ctx.break_lease(lease, &error.to_string()) {
            Ok(_) => {}
            // Someone else moved the lease on; their outcome stands.
            Err(DrydockError::StateMismatch { actual, .. }) => {
                tracing::debug!(lease = %lease, status = %actual, "lease left pending before allocation failed");
                if let Some(skipped) = self.check_still_pending(lease)? {
                    return Ok(skipped);
                }
            }
            Err(other) => return Err(other),
        }
        if let DrydockError::AllocationFailed { errors, .. } = &error {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            tracing::warn!(lease = %lease, errors = messages.len(), "allocation failed");
            self.ctx
                .audit(lease, AuditKind::AllocationFailed, Some(json!({ "errors": messages })));
        }
        Err(error)
    }
}
