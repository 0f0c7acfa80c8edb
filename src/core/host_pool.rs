//! Static host pool strategy.
//!
//! A host pool blueprint lists fixed network bindings. Each free binding can
//! back one resource, and each resource serves one lease at a time. Both
//! limits are enforced with slot locks, so concurrent allocators never hand
//! out a binding twice.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::blueprint::BlueprintStrategy;
use crate::core::context::DrydockContext;
use crate::core::error::{DrydockError, Result};
use crate::core::lease::LeaseAcquisition;
use crate::core::model::{AttributeMap, Blueprint, Lease, Resource};
use crate::core::resource::ResourceTemplate;
use crate::core::store::StoreExt;

/// Type tag served by [`HostPoolStrategy`].
pub const HOST_TYPE: &str = "host";

/// Resource attribute naming the binding a resource occupies.
pub const BINDING_ATTRIBUTE: &str = "binding";

/// A reachable host in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    /// Stable binding identifier.
    pub id: String,
    /// Device name.
    pub device: String,
    /// Network address.
    pub address: String,
    /// Port for remote commands.
    #[serde(default = "default_port")]
    pub port: u16,
}

const fn default_port() -> u16 {
    22
}

impl HostBinding {
    /// Whether the binding satisfies the constraints it knows about.
    /// Unknown constraint keys are left to the resource match.
    fn satisfies(&self, constraints: &AttributeMap) -> bool {
        constraints.iter().all(|(key, value)| match key.as_str() {
            BINDING_ATTRIBUTE => value.as_str() == Some(self.id.as_str()),
            "device" => value.as_str() == Some(self.device.as_str()),
            "address" => value.as_str() == Some(self.address.as_str()),
            "port" => value.as_u64() == Some(u64::from(self.port)),
            _ => true,
        })
    }
}

/// Blueprint fields understood by the host pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPoolFields {
    /// Hosts in the pool.
    #[serde(default)]
    pub bindings: Vec<HostBinding>,
    /// Credential reference handed to lease holders.
    #[serde(default)]
    pub credential: Option<String>,
}

impl HostPoolFields {
    /// Read the fields off a blueprint.
    ///
    /// # Errors
    ///
    /// [`DrydockError::Config`] if the fields do not parse.
    pub fn from_blueprint(blueprint: &Blueprint) -> Result<Self> {
        let value = Value::Object(blueprint.fields.clone().into_iter().collect());
        serde_json::from_value(value)
            .map_err(|e| DrydockError::Config(format!("{}: invalid host pool fields: {e}", blueprint.reference)))
    }

    /// Write the fields onto a blueprint.
    #[must_use]
    pub fn apply(self, mut blueprint: Blueprint) -> Blueprint {
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            blueprint.fields.extend(map);
        }
        blueprint
    }
}

/// Slot lock claiming a binding for one resource.
#[must_use]
pub fn binding_lock_key(binding: &str) -> String {
    format!("host.binding({binding})")
}

/// Slot lock claiming a resource for one lease.
#[must_use]
pub fn lease_lock_key(resource: &Resource) -> String {
    format!("host.lease({})", resource.reference)
}

/// Strategy for [`HOST_TYPE`] blueprints.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPoolStrategy;

impl HostPoolStrategy {
    /// A new host pool blueprint.
    #[must_use]
    pub fn blueprint(name: impl Into<String>, fields: HostPoolFields) -> Blueprint {
        fields.apply(Blueprint::new(name, HOST_TYPE))
    }

    /// Bindings not claimed by a live resource of this blueprint.
    fn free_bindings(ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<Vec<HostBinding>> {
        let fields = HostPoolFields::from_blueprint(blueprint)?;
        let claimed: HashSet<String> = ctx.store().snapshot(|tables| {
            tables
                .resources
                .values()
                .filter(|r| r.blueprint == blueprint.reference && r.status.is_live())
                .filter_map(|r| r.attribute_str(BINDING_ATTRIBUTE).map(ToString::to_string))
                .collect()
        })?;
        Ok(fields
            .bindings
            .into_iter()
            .filter(|b| !claimed.contains(&b.id) && b.satisfies(&lease.constraints))
            .collect())
    }
}

#[async_trait]
impl BlueprintStrategy for HostPoolStrategy {
    fn type_tag(&self) -> &str {
        HOST_TYPE
    }

    fn can_ever_allocate(&self, blueprint: &Blueprint, lease: &Lease) -> bool {
        HostPoolFields::from_blueprint(blueprint)
            .is_ok_and(|fields| fields.bindings.iter().any(|b| b.satisfies(&lease.constraints)))
    }

    async fn can_allocate_now(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<bool> {
        Ok(!Self::free_bindings(ctx, blueprint, lease)?.is_empty())
    }

    async fn allocate(&self, ctx: &DrydockContext, blueprint: &Blueprint, lease: &Lease) -> Result<Resource> {
        let mut bindings = Self::free_bindings(ctx, blueprint, lease)?;
        if bindings.is_empty() {
            return Err(DrydockError::Strategy(format!("{} has no free bindings", blueprint.reference)));
        }
        bindings.shuffle(&mut rand::rng());

        let mut errors = Vec::new();
        for binding in bindings {
            let template = ResourceTemplate::new(blueprint, format!("Host ({})", binding.address))
                .with_attribute(BINDING_ATTRIBUTE, binding.id.clone())
                .with_attribute("device", binding.device.clone())
                .with_attribute("address", binding.address.clone())
                .with_attribute("port", binding.port)
                .with_capability("command")
                .need_slot_lock(binding_lock_key(&binding.id))
                .activate_when_allocated();
            match ctx.allocate_resource(template) {
                Ok(resource) => return Ok(resource),
                Err(err) => {
                    tracing::debug!(blueprint = %blueprint.reference, binding = %binding.id, error = %err, "binding unavailable");
                    errors.push(err);
                }
            }
        }

        // Losing every race is contention; the allocator retries elsewhere.
        if !errors.is_empty() && errors.iter().all(DrydockError::is_contention) {
            return Err(errors.swap_remove(0));
        }
        Err(DrydockError::Strategy(format!(
            "unable to allocate any binding: {}",
            errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        )))
    }

    async fn can_acquire_lease(
        &self,
        ctx: &DrydockContext,
        _blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<bool> {
        if !resource.status.accepts_leases() || !resource.satisfies(&lease.constraints) {
            return Ok(false);
        }
        ctx.slot_locks().is_lock_free(&lease_lock_key(resource))
    }

    async fn acquire_lease(
        &self,
        ctx: &DrydockContext,
        _blueprint: &Blueprint,
        resource: &Resource,
        lease: &Lease,
    ) -> Result<Lease> {
        ctx.acquire_on_resource(
            lease.reference,
            resource.reference,
            LeaseAcquisition::new()
                .activate_when_acquired()
                .need_slot_lock(lease_lock_key(resource)),
        )
    }

    async fn destroy_resource(&self, _ctx: &DrydockContext, _blueprint: &Blueprint, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    async fn destroy_lease(
        &self,
        _ctx: &DrydockContext,
        _blueprint: &Blueprint,
        _resource: &Resource,
        _lease: &Lease,
    ) -> Result<()> {
        Ok(())
    }

    fn interface(&self, blueprint: &Blueprint, resource: &Resource, interface: &str) -> Result<Option<Value>> {
        if interface != "command" {
            return Ok(None);
        }
        let fields = HostPoolFields::from_blueprint(blueprint)?;
        Ok(Some(json!({
            "protocol": "ssh",
            "host": resource.attribute_str("address"),
            "port": resource.attribute("port").cloned().unwrap_or(Value::Null),
            "credential": fields.credential,
        })))
    }
}
