//! API-facing request/response models.

use serde::{Deserialize, Serialize};

use crate::core::engine::{Drydock, LeaseRequest};
use crate::core::model::{LeaseStatus, ResourceStatus, BROKEN_REASON_ATTRIBUTE};
use crate::core::policy::{blueprint_policy, Actor, Capability};
use crate::core::store::StoreExt;
use crate::util::{BlueprintRef, LeaseRef, ResourceRef};

/// Lease status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatusResponse {
    /// Lease reference.
    pub lease: LeaseRef,
    /// Current status.
    pub status: LeaseStatus,
    /// Bound resource, if any.
    pub resource: Option<ResourceRef>,
    /// Status of the bound resource.
    pub resource_status: Option<ResourceStatus>,
    /// Why the lease broke, if it did.
    pub reason: Option<String>,
}

/// Blueprint data for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintSummary {
    /// Blueprint reference.
    pub blueprint: BlueprintRef,
    /// Name.
    pub name: String,
    /// Strategy type.
    pub type_tag: String,
    /// Excluded from allocation.
    pub disabled: bool,
    /// Live resources it has allocated.
    pub live_resources: usize,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Tasks queued or in flight.
    pub queued_tasks: usize,
}

/// Request a lease and report where it stands.
///
/// # Errors
///
/// The rendered engine error.
pub fn submit_lease(drydock: &Drydock, actor: &Actor, request: LeaseRequest) -> Result<LeaseStatusResponse, String> {
    let lease = drydock.request_lease(actor, request).map_err(|e| e.to_string())?;
    lease_status(drydock, actor, lease)
}

/// Current status of a lease.
///
/// # Errors
///
/// The rendered engine error.
pub fn lease_status(drydock: &Drydock, actor: &Actor, lease: LeaseRef) -> Result<LeaseStatusResponse, String> {
    let snapshot = drydock.lease(actor, lease).map_err(|e| e.to_string())?;
    let reason = snapshot
        .lease
        .attribute(BROKEN_REASON_ATTRIBUTE)
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    Ok(LeaseStatusResponse {
        lease,
        status: snapshot.lease.status,
        resource: snapshot.lease.resource,
        resource_status: snapshot.resource.map(|r| r.status),
        reason,
    })
}

/// Blueprints the actor may view.
#[must_use]
pub fn list_blueprints(drydock: &Drydock, actor: &Actor) -> Vec<BlueprintSummary> {
    drydock
        .context()
        .store()
        .snapshot(|tables| {
            tables
                .blueprints
                .values()
                .filter(|bp| blueprint_policy(bp, Capability::View).allows(actor))
                .map(|bp| BlueprintSummary {
                    blueprint: bp.reference,
                    name: bp.name.clone(),
                    type_tag: bp.type_tag().to_string(),
                    disabled: bp.disabled,
                    live_resources: tables
                        .resources
                        .values()
                        .filter(|r| r.blueprint == bp.reference && r.status.is_live())
                        .count(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Return a health payload.
#[must_use]
pub fn health(drydock: &Drydock) -> Health {
    Health {
        ok: true,
        queued_tasks: drydock.context().tasks().len(),
    }
}
