//! Resource Provider Interface
//!
//! The dispatcher and the refresh scheduler never talk to a cloud API
//! directly; they go through [`ResourceProvider`]. Records are opaque JSON
//! documents supplied by the provider and keyed by their ids — the daemon
//! stores and forwards them without interpreting more than the handful of
//! fields named below.

use std::collections::BTreeMap;

use serde_json::Value;

use nimbus_common::{NimbusError, Result};

/// Opaque provider records keyed by resource id.
pub type RecordMap = BTreeMap<String, Value>;

/// The remote side of the daemon: listing, starting and wiring up compute
/// instances, network interfaces and subnets.
///
/// Calls may block for a long time (starting an instance with `wait` can
/// take tens of seconds) and are assumed safe to issue concurrently; the
/// daemon serializes nothing beyond what cache locking naturally imposes on
/// the data they populate.
///
/// # Errors
///
/// Implementations report transient unreachability (no network, endpoint
/// down) as [`NimbusError::Connection`] — the scheduler leaves the affected
/// category stale and retries on its next tick. Everything else is a
/// [`NimbusError::Provider`] carrying the remote error text.
pub trait ResourceProvider: Send + Sync {
    /// The region ids this provider covers.
    fn regions(&self) -> Vec<String>;

    /// Lists the instances of one region, plus whether any of them is
    /// currently running.
    fn list_instances(&self, region: &str) -> Result<(RecordMap, bool)>;

    /// Starts an instance. With `wait` the call returns only once the
    /// instance reached "running". Returns the updated instance record.
    fn start_instance(&self, instance_id: &str, region: &str, wait: bool) -> Result<Value>;

    /// Stops an instance. With `wait` the call returns only once the
    /// instance settled.
    fn stop_instance(&self, instance_id: &str, region: &str, wait: bool) -> Result<()>;

    /// Attaches an existing network interface to an instance at the given
    /// device index. Returns the updated instance record.
    fn connect_interface(
        &self,
        region: &str,
        instance_id: &str,
        eni_id: &str,
        device_index: u32,
    ) -> Result<Value>;

    /// Detaches every non-primary interface from an instance. Returns the
    /// detached interface ids and the updated instance record.
    fn detach_private_interfaces(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<(Vec<String>, Value)>;

    /// Lists the network interfaces of one region.
    fn list_interfaces(&self, region: &str) -> Result<RecordMap>;

    /// Lists the subnets of one region. Subnet records carry a `name` field.
    fn list_subnets(&self, region: &str) -> Result<RecordMap>;

    /// Creates a subnet in the given availability zone. Returns its record.
    fn create_subnet(&self, region: &str, az: &str, name: &str) -> Result<Value>;

    /// Creates a network interface inside a subnet record previously
    /// returned by [`ResourceProvider::create_subnet`] or
    /// [`ResourceProvider::list_subnets`].
    fn create_interface(&self, name: &str, subnet: &Value) -> Result<Value>;

    /// Human-readable region names (e.g. "Oregon" for us-west-2), keyed by
    /// region id.
    fn region_long_names(&self) -> Result<BTreeMap<String, String>>;
}

/// Provider used when the daemon runs without a configured cloud backend.
///
/// It covers no regions, so scheduled refreshes are no-ops, and every
/// command that needs the remote side fails with a descriptive provider
/// error instead of crashing the server. A real deployment substitutes its
/// own [`ResourceProvider`] here.
pub struct NullProvider;

impl NullProvider {
    fn unconfigured<T>(&self, what: &str) -> Result<T> {
        Err(NimbusError::Provider(format!(
            "no resource provider configured (cannot {})",
            what
        )))
    }
}

impl ResourceProvider for NullProvider {
    fn regions(&self) -> Vec<String> {
        Vec::new()
    }

    fn list_instances(&self, region: &str) -> Result<(RecordMap, bool)> {
        self.unconfigured(&format!("list instances in {}", region))
    }

    fn start_instance(&self, instance_id: &str, _region: &str, _wait: bool) -> Result<Value> {
        self.unconfigured(&format!("start instance {}", instance_id))
    }

    fn stop_instance(&self, instance_id: &str, _region: &str, _wait: bool) -> Result<()> {
        self.unconfigured(&format!("stop instance {}", instance_id))
    }

    fn connect_interface(
        &self,
        _region: &str,
        instance_id: &str,
        eni_id: &str,
        _device_index: u32,
    ) -> Result<Value> {
        self.unconfigured(&format!("connect {} to {}", eni_id, instance_id))
    }

    fn detach_private_interfaces(
        &self,
        _region: &str,
        instance_id: &str,
    ) -> Result<(Vec<String>, Value)> {
        self.unconfigured(&format!("detach interfaces from {}", instance_id))
    }

    fn list_interfaces(&self, region: &str) -> Result<RecordMap> {
        self.unconfigured(&format!("list interfaces in {}", region))
    }

    fn list_subnets(&self, region: &str) -> Result<RecordMap> {
        self.unconfigured(&format!("list subnets in {}", region))
    }

    fn create_subnet(&self, _region: &str, _az: &str, name: &str) -> Result<Value> {
        self.unconfigured(&format!("create subnet {}", name))
    }

    fn create_interface(&self, name: &str, _subnet: &Value) -> Result<Value> {
        self.unconfigured(&format!("create interface {}", name))
    }

    fn region_long_names(&self) -> Result<BTreeMap<String, String>> {
        self.unconfigured("list region long names")
    }
}
