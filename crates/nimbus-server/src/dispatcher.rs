//! Command Dispatcher
//!
//! Pure exhaustive dispatch over the closed [`Command`] set. Each handler
//! calls the resource provider synchronously, updates the shared cache under
//! its lock, and returns the payload for the result frame. By convention
//! replies carry the entire updated region rather than a diff — wasteful,
//! but part of the protocol contract clients rely on.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use nimbus_common::{Command, NimbusError, RequestFrame, Result};

use crate::cache::SharedCache;
use crate::provider::ResourceProvider;

/// Placeholder token substituted with the probe suffix in subnet and
/// interface name templates.
const NAME_TEMPLATE_PLACEHOLDER: &str = "{ix}";

/// Highest suffix tried when probing for an unused subnet name.
const NAME_PROBE_BOUND: u32 = 40;

/// Executes commands against the cache and the resource provider.
///
/// `dispatch` is synchronous and may block for tens of seconds (for example
/// while an instance starts); the request server runs it on the blocking
/// pool so in-flight requests never stall each other.
pub struct Dispatcher {
    cache: SharedCache,
    provider: Arc<dyn ResourceProvider>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given cache and provider.
    pub fn new(cache: SharedCache, provider: Arc<dyn ResourceProvider>) -> Self {
        Self { cache, provider }
    }

    /// Executes one request and returns the result payload.
    ///
    /// Errors are reported to the caller as a status-1 result; they never
    /// tear down the server.
    pub fn dispatch(&self, frame: &RequestFrame) -> Result<String> {
        debug!("dispatching {} (request {})", frame.command, frame.id);

        match frame.command {
            Command::QueryRegion => self.query_region(frame),
            Command::StartInstance => self.start_instance(frame),
            Command::StopInstance => self.stop_instance(frame),
            Command::ConnectEni => self.connect_eni(frame),
            Command::CreateEnis => self.create_enis(frame),
            Command::CreateEniAndSubnet => self.create_eni_and_subnet(frame),
            Command::DetachAllEnis => self.detach_all_enis(frame),
            Command::GetCurrentRegionState => self.get_current_region_state(frame),
            Command::GetCurrentCompleteState => self.get_current_complete_state(frame),
        }
    }

    fn query_region(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        info!("asked to query region {}", region);

        let (instances, has_running) = self.provider.list_instances(region)?;
        self.cache
            .set_region_instances(region, instances.clone(), has_running);

        debug!("finished querying region {}", region);
        Ok(serde_json::to_string(&instances)?)
    }

    fn start_instance(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        let instance_id = arg(frame, 1, "instance id")?;
        info!("starting instance {} in region {}", instance_id, region);

        // Blocks until the instance reaches "running".
        let instance = self.provider.start_instance(instance_id, region, true)?;
        self.cache.set_instance(region, instance, true)?;

        debug!(
            "finished starting instance {} in region {}",
            instance_id, region
        );
        Ok(serde_json::to_string(&self.cache.instances(region))?)
    }

    fn stop_instance(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        let instance_id = arg(frame, 1, "instance id")?;
        info!("stopping instance {} in region {}", instance_id, region);

        self.provider.stop_instance(instance_id, region, false)?;

        debug!(
            "finished stopping instance {} in region {}",
            instance_id, region
        );
        Ok(String::new())
    }

    fn connect_eni(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        let instance_id = arg(frame, 1, "instance id")?;
        let eni_id = arg(frame, 2, "eni id")?;
        let device_index: u32 = arg(frame, 3, "device index")?.parse().map_err(|_| {
            NimbusError::InvalidRequest(format!(
                "device index '{}' is not an integer",
                frame.args[3]
            ))
        })?;

        info!(
            "connecting eni {} to instance {} (as index {}) in region {}",
            eni_id, instance_id, device_index, region
        );

        let instance = self
            .provider
            .connect_interface(region, instance_id, eni_id, device_index)?;
        self.cache.set_instance(region, instance.clone(), false)?;

        Ok(serde_json::to_string(&instance)?)
    }

    /// Accepted for protocol compatibility; creating interfaces without a
    /// new subnet is handled client-side today.
    fn create_enis(&self, _frame: &RequestFrame) -> Result<String> {
        Ok(String::new())
    }

    fn create_eni_and_subnet(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        let az = arg(frame, 1, "availability zone")?;
        let subnet_template = arg(frame, 2, "subnet name template")?;
        let interface_templates: Vec<&str> =
            frame.args.iter().skip(3).map(String::as_str).collect();
        if interface_templates.is_empty() {
            return Err(NimbusError::InvalidRequest(
                "CREATE_ENI_AND_SUBNET needs at least one interface name".to_string(),
            ));
        }

        info!(
            "create {} enis with a new subnet (template {}) in region {} az {}",
            interface_templates.len(),
            subnet_template,
            region,
            az
        );

        // Probe integer suffixes for the first template instantiation that
        // does not collide with an existing subnet name.
        let subnets = self.provider.list_subnets(region)?;
        let taken: Vec<&str> = subnets
            .values()
            .filter_map(|s| s.get("name").and_then(Value::as_str))
            .collect();

        let suffix = (1..=NAME_PROBE_BOUND)
            .find(|i| !taken.contains(&instantiate(subnet_template, *i).as_str()))
            .ok_or_else(|| {
                NimbusError::InvalidRequest(format!(
                    "no unused subnet name for template '{}' within {} probes",
                    subnet_template, NAME_PROBE_BOUND
                ))
            })?;

        let subnet_name = instantiate(subnet_template, suffix);
        info!("chosen subnet name is {}", subnet_name);

        let subnet = self.provider.create_subnet(region, az, &subnet_name)?;
        for template in &interface_templates {
            let name = instantiate(template, suffix);
            self.provider.create_interface(&name, &subnet)?;
        }

        let interfaces = self.provider.list_interfaces(region)?;
        self.cache.set_region_interfaces(region, interfaces);

        Ok(serde_json::to_string(&self.cache.region(region))?)
    }

    fn detach_all_enis(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        let instance_id = arg(frame, 1, "instance id")?;
        info!(
            "detaching all enis from instance {} in region {}",
            instance_id, region
        );

        let (detached, instance) = self
            .provider
            .detach_private_interfaces(region, instance_id)?;
        self.cache.set_instance(region, instance.clone(), false)?;

        let reply = serde_json::json!({
            "detached_enis": detached,
            "instance": instance,
        });
        Ok(serde_json::to_string(&reply)?)
    }

    fn get_current_region_state(&self, frame: &RequestFrame) -> Result<String> {
        let region = arg(frame, 0, "region")?;
        info!("asked for current state for region {}", region);
        Ok(serde_json::to_string(&self.cache.region(region))?)
    }

    fn get_current_complete_state(&self, _frame: &RequestFrame) -> Result<String> {
        info!("asked for current complete state");
        Ok(serde_json::to_string(&self.cache.regions())?)
    }
}

fn arg<'a>(frame: &'a RequestFrame, index: usize, name: &str) -> Result<&'a str> {
    frame
        .args
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| {
            NimbusError::InvalidRequest(format!(
                "{} is missing argument {} ({})",
                frame.command, index, name
            ))
        })
}

fn instantiate(template: &str, suffix: u32) -> String {
    template.replace(NAME_TEMPLATE_PLACEHOLDER, &suffix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RecordMap;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory provider with a fixed region worth of resources.
    struct MockProvider {
        subnets: Mutex<RecordMap>,
        interfaces: Mutex<RecordMap>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                subnets: Mutex::new(BTreeMap::new()),
                interfaces: Mutex::new(BTreeMap::new()),
            }
        }

        fn with_subnet_names(names: &[&str]) -> Self {
            let provider = Self::new();
            {
                let mut subnets = provider.subnets.lock().unwrap();
                for (i, name) in names.iter().enumerate() {
                    subnets.insert(
                        format!("subnet-{}", i),
                        json!({"id": format!("subnet-{}", i), "name": name}),
                    );
                }
            }
            provider
        }
    }

    impl ResourceProvider for MockProvider {
        fn regions(&self) -> Vec<String> {
            vec!["us-east-1".to_string()]
        }

        fn list_instances(&self, _region: &str) -> nimbus_common::Result<(RecordMap, bool)> {
            let mut map = BTreeMap::new();
            map.insert("i-1".to_string(), json!({"id": "i-1", "state": "running"}));
            map.insert("i-2".to_string(), json!({"id": "i-2", "state": "stopped"}));
            Ok((map, true))
        }

        fn start_instance(
            &self,
            instance_id: &str,
            _region: &str,
            _wait: bool,
        ) -> nimbus_common::Result<Value> {
            Ok(json!({"id": instance_id, "state": "running"}))
        }

        fn stop_instance(
            &self,
            _instance_id: &str,
            _region: &str,
            _wait: bool,
        ) -> nimbus_common::Result<()> {
            Ok(())
        }

        fn connect_interface(
            &self,
            _region: &str,
            instance_id: &str,
            eni_id: &str,
            device_index: u32,
        ) -> nimbus_common::Result<Value> {
            Ok(json!({
                "id": instance_id,
                "interfaces": [{"id": eni_id, "device_index": device_index}],
            }))
        }

        fn detach_private_interfaces(
            &self,
            _region: &str,
            instance_id: &str,
        ) -> nimbus_common::Result<(Vec<String>, Value)> {
            Ok((
                vec!["eni-a".to_string(), "eni-b".to_string()],
                json!({"id": instance_id, "interfaces": []}),
            ))
        }

        fn list_interfaces(&self, _region: &str) -> nimbus_common::Result<RecordMap> {
            Ok(self.interfaces.lock().unwrap().clone())
        }

        fn list_subnets(&self, _region: &str) -> nimbus_common::Result<RecordMap> {
            Ok(self.subnets.lock().unwrap().clone())
        }

        fn create_subnet(
            &self,
            _region: &str,
            az: &str,
            name: &str,
        ) -> nimbus_common::Result<Value> {
            let subnet = json!({"id": format!("subnet-{}", name), "name": name, "az": az});
            self.subnets
                .lock()
                .unwrap()
                .insert(format!("subnet-{}", name), subnet.clone());
            Ok(subnet)
        }

        fn create_interface(
            &self,
            name: &str,
            subnet: &Value,
        ) -> nimbus_common::Result<Value> {
            let eni = json!({
                "id": format!("eni-{}", name),
                "name": name,
                "subnet": subnet["id"],
                "status": "available",
            });
            self.interfaces
                .lock()
                .unwrap()
                .insert(format!("eni-{}", name), eni.clone());
            Ok(eni)
        }

        fn region_long_names(&self) -> nimbus_common::Result<BTreeMap<String, String>> {
            Ok(BTreeMap::from([(
                "us-east-1".to_string(),
                "N. Virginia".to_string(),
            )]))
        }
    }

    fn dispatcher_with(provider: MockProvider) -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SharedCache::new(dir.path().join("info"));
        (dir, Dispatcher::new(cache, Arc::new(provider)))
    }

    fn request(command: Command, args: &[&str]) -> RequestFrame {
        RequestFrame::new(1, command, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_query_region_is_idempotent() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let frame = request(Command::QueryRegion, &["us-east-1"]);

        let first = dispatcher.dispatch(&frame).unwrap();
        let second = dispatcher.dispatch(&frame).unwrap();

        // Unchanged provider state yields structurally identical replies
        // and cached records.
        assert_eq!(
            serde_json::from_str::<Value>(&first).unwrap(),
            serde_json::from_str::<Value>(&second).unwrap()
        );
        assert_eq!(dispatcher.cache.instances("us-east-1").len(), 2);
        assert!(dispatcher.cache.region("us-east-1").has_running_instances);
    }

    #[test]
    fn test_start_instance_replies_with_whole_region() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        dispatcher
            .dispatch(&request(Command::QueryRegion, &["us-east-1"]))
            .unwrap();

        let reply = dispatcher
            .dispatch(&request(Command::StartInstance, &["us-east-1", "i-2"]))
            .unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();

        // Whole region, not just the started instance.
        assert_eq!(parsed["i-2"]["state"], "running");
        assert!(parsed.get("i-1").is_some());
    }

    #[test]
    fn test_stop_instance_has_empty_reply() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let reply = dispatcher
            .dispatch(&request(Command::StopInstance, &["us-east-1", "i-1"]))
            .unwrap();
        assert!(reply.is_empty());
    }

    #[test]
    fn test_connect_eni_parses_device_index() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let reply = dispatcher
            .dispatch(&request(
                Command::ConnectEni,
                &["us-east-1", "i-1", "eni-9", "2"],
            ))
            .unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["interfaces"][0]["device_index"], 2);

        let err = dispatcher
            .dispatch(&request(
                Command::ConnectEni,
                &["us-east-1", "i-1", "eni-9", "two"],
            ))
            .unwrap_err();
        assert!(matches!(err, NimbusError::InvalidRequest(_)));
    }

    #[test]
    fn test_missing_argument_is_invalid_request() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let err = dispatcher
            .dispatch(&request(Command::StartInstance, &["us-east-1"]))
            .unwrap_err();
        assert!(matches!(err, NimbusError::InvalidRequest(_)));
    }

    #[test]
    fn test_create_eni_and_subnet_probes_past_collisions() {
        let provider = MockProvider::with_subnet_names(&["lab-1", "lab-2"]);
        let (_dir, dispatcher) = dispatcher_with(provider);

        let reply = dispatcher
            .dispatch(&request(
                Command::CreateEniAndSubnet,
                &["us-east-1", "us-east-1a", "lab-{ix}", "front-{ix}", "back-{ix}"],
            ))
            .unwrap();

        // lab-1 and lab-2 exist, so the probe lands on 3.
        let region: Value = serde_json::from_str(&reply).unwrap();
        let interfaces = region["interfaces"].as_object().unwrap();
        assert!(interfaces.contains_key("eni-front-3"));
        assert!(interfaces.contains_key("eni-back-3"));
    }

    #[test]
    fn test_create_eni_and_subnet_reports_exhausted_probe() {
        let names: Vec<String> = (1..=40).map(|i| format!("lab-{}", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let provider = MockProvider::with_subnet_names(&name_refs);
        let (_dir, dispatcher) = dispatcher_with(provider);

        let err = dispatcher
            .dispatch(&request(
                Command::CreateEniAndSubnet,
                &["us-east-1", "us-east-1a", "lab-{ix}", "eni-{ix}"],
            ))
            .unwrap_err();
        assert!(matches!(err, NimbusError::InvalidRequest(_)));
    }

    #[test]
    fn test_detach_all_enis_reply_shape() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let reply = dispatcher
            .dispatch(&request(Command::DetachAllEnis, &["us-east-1", "i-1"]))
            .unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["detached_enis"], json!(["eni-a", "eni-b"]));
        assert_eq!(parsed["instance"]["id"], "i-1");
    }

    #[test]
    fn test_state_queries_never_touch_provider() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());

        // Unknown region yields an empty record, not an error.
        let reply = dispatcher
            .dispatch(&request(Command::GetCurrentRegionState, &["eu-west-1"]))
            .unwrap();
        let parsed: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(parsed["instances"], json!({}));

        let reply = dispatcher
            .dispatch(&request(Command::GetCurrentCompleteState, &[]))
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&reply).unwrap(), json!({}));
    }

    #[test]
    fn test_create_enis_is_acknowledged_noop() {
        let (_dir, dispatcher) = dispatcher_with(MockProvider::new());
        let reply = dispatcher
            .dispatch(&request(Command::CreateEnis, &["us-east-1"]))
            .unwrap();
        assert!(reply.is_empty());
    }
}
