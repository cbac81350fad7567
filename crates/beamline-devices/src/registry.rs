/*!
 * Device registry for beamline control.
 *
 * Devices are built once at startup from a list of [`DeviceSpec`]s. Each
 * spec names a type; the builder maps type names to factory functions.
 * Specs must be ordered so that a device only refers to devices listed
 * before it.
 */
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use beamline_core::logging::component_span;

use crate::device::{Device, DeviceContext, DeviceGroup};
use crate::devices::{Automounter, Detector, Goniometer, Motor, Shutter};
use crate::error::{DeviceError, Result};

/// Description of one device to build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique device name
    pub name: String,
    /// Registered type name
    #[serde(rename = "type")]
    pub type_name: String,
    /// Type-specific arguments
    #[serde(default)]
    pub args: HashMap<String, JsonValue>,
}

impl DeviceSpec {
    /// Create a spec with no arguments
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            args: HashMap::new(),
        }
    }

    /// Add an argument
    pub fn with_arg<V: Into<JsonValue>>(mut self, key: &str, value: V) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    fn missing(&self, key: &str, kind: &str) -> DeviceError {
        DeviceError::configuration(format!(
            "{}: argument '{}' must be {}",
            self.name, key, kind
        ))
    }

    /// Required string argument
    pub fn str_arg(&self, key: &str) -> Result<&str> {
        self.args
            .get(key)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| self.missing(key, "a string"))
    }

    /// Numeric argument with a default
    pub fn f64_arg(&self, key: &str, default: f64) -> Result<f64> {
        match self.args.get(key) {
            None => Ok(default),
            Some(value) => value.as_f64().ok_or_else(|| self.missing(key, "a number")),
        }
    }

    /// Required list of strings
    pub fn list_arg(&self, key: &str) -> Result<Vec<String>> {
        self.args
            .get(key)
            .and_then(JsonValue::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .ok_or_else(|| self.missing(key, "a list of names"))
    }
}

/// Parse a JSON list of device specs
pub fn parse_specs(text: &str) -> Result<Vec<DeviceSpec>> {
    serde_json::from_str(text)
        .map_err(|e| DeviceError::configuration(format!("Invalid device list: {}", e)))
}

/// A built device, kept both as a trait object and as `Any` for typed access
#[derive(Clone)]
pub struct Built {
    device: Arc<dyn Device>,
    any: Arc<dyn Any + Send + Sync>,
}

impl Built {
    /// Wrap a concrete device
    pub fn new<T: Device + 'static>(device: Arc<T>) -> Self {
        Self {
            any: device.clone(),
            device,
        }
    }

    /// The device as a trait object
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}

impl fmt::Debug for Built {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.device.fmt(f)
    }
}

/// Factory turning a spec into a device. Earlier devices are available
/// through the registry argument.
pub type Factory = Box<dyn Fn(&DeviceContext, &DeviceSpec, &DeviceRegistry) -> Result<Built> + Send + Sync>;

/// Maps type names to factories
#[derive(Default)]
pub struct DeviceRegistryBuilder {
    factories: HashMap<String, Factory>,
}

impl fmt::Debug for DeviceRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("DeviceRegistryBuilder")
            .field("types", &types)
            .finish()
    }
}

impl DeviceRegistryBuilder {
    /// Create a builder with no types
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `type_name`
    pub fn register<F>(mut self, type_name: &str, factory: F) -> Self
    where
        F: Fn(&DeviceContext, &DeviceSpec, &DeviceRegistry) -> Result<Built> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.to_string(), Box::new(factory));
        self
    }

    /// Register the built-in device types
    pub fn with_standard_types(self) -> Self {
        self.register("Motor", |ctx, spec, _| {
            let precision = spec.f64_arg("precision", 0.001)?;
            Ok(Built::new(Motor::new(ctx, &spec.name, spec.str_arg("pv")?, precision)?))
        })
        .register("Shutter", |ctx, spec, _| {
            Ok(Built::new(Shutter::new(ctx, &spec.name, spec.str_arg("pv")?)?))
        })
        .register("Detector", |ctx, spec, _| {
            Ok(Built::new(Detector::new(ctx, &spec.name, spec.str_arg("pv")?)?))
        })
        .register("Automounter", |ctx, spec, _| {
            Ok(Built::new(Automounter::new(ctx, &spec.name, spec.str_arg("pv")?)?))
        })
        .register("Goniometer", |ctx, spec, _| {
            Ok(Built::new(Goniometer::new(ctx, &spec.name, spec.str_arg("pv")?)?))
        })
        .register("DeviceGroup", |ctx, spec, registry| {
            let children = spec
                .list_arg("devices")?
                .iter()
                .map(|name| registry.get_device(name))
                .collect::<Result<Vec<_>>>()?;
            Ok(Built::new(DeviceGroup::new(ctx, &spec.name, children)?))
        })
    }

    /// Build every spec in order
    pub fn build(&self, context: &DeviceContext, specs: &[DeviceSpec]) -> Result<DeviceRegistry> {
        let mut registry = DeviceRegistry::default();
        for spec in specs {
            let factory = self.factories.get(&spec.type_name).ok_or_else(|| {
                DeviceError::configuration(format!(
                    "{}: unknown device type '{}'",
                    spec.name, spec.type_name
                ))
            })?;
            if registry.contains(&spec.name) {
                return Err(DeviceError::configuration(format!(
                    "Device {} defined twice",
                    spec.name
                )));
            }
            let built = {
                let _span = component_span(&spec.type_name, &spec.name).entered();
                factory(context, spec, &registry)?
            };
            debug!("Built {} {}", spec.type_name, spec.name);
            registry.insert(&spec.name, built);
        }
        info!("Device registry built with {} devices", registry.len());
        Ok(registry)
    }
}

/// Devices by name
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Built>,
    order: Vec<String>,
}

impl DeviceRegistry {
    fn insert(&mut self, name: &str, built: Built) {
        self.order.push(name.to_string());
        self.devices.insert(name.to_string(), built);
    }

    /// Whether a device with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Device names in build order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Get a device by name
    pub fn get_device(&self, name: &str) -> Result<Arc<dyn Device>> {
        self.devices
            .get(name)
            .map(|built| built.device.clone())
            .ok_or_else(|| DeviceError::configuration(format!("Device {} not found", name)))
    }

    /// Get a device by name as its concrete type
    pub fn get<T: Device + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let built = self
            .devices
            .get(name)
            .ok_or_else(|| DeviceError::configuration(format!("Device {} not found", name)))?;
        built.any.clone().downcast::<T>().map_err(|_| {
            DeviceError::configuration(format!(
                "Device {} is a {}, not the requested type",
                name,
                built.device.kind()
            ))
        })
    }

    /// All devices in build order
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.order
            .iter()
            .filter_map(|name| self.devices.get(name))
            .map(|built| built.device.clone())
            .collect()
    }

    /// Devices of one kind (`motor`, `shutter`, ...)
    pub fn devices_by_kind(&self, kind: &str) -> Vec<Arc<dyn Device>> {
        self.devices()
            .into_iter()
            .filter(|device| device.kind() == kind)
            .collect()
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::device::tests::context;

    const DEVICES: &str = r#"[
        {"name": "omega", "type": "Motor", "args": {"pv": "BL:omega", "precision": 0.01}},
        {"name": "energy", "type": "Motor", "args": {"pv": "BL:energy"}},
        {"name": "shutter", "type": "Shutter", "args": {"pv": "BL:shutter"}},
        {"name": "optics", "type": "DeviceGroup", "args": {"devices": ["energy", "shutter"]}}
    ]"#;

    #[tokio::test]
    async fn test_build_from_json() {
        let (context, _) = context();
        let specs = parse_specs(DEVICES).unwrap();
        let registry = DeviceRegistryBuilder::new()
            .with_standard_types()
            .build(&context, &specs)
            .unwrap();
        context.dispatcher().flush().await;

        assert_eq!(registry.names(), &["omega", "energy", "shutter", "optics"]);
        let omega: Arc<Motor> = registry.get("omega").unwrap();
        assert_eq!(omega.precision(), 0.01);
        assert_eq!(registry.get::<Motor>("energy").unwrap().precision(), 0.001);
        assert_eq!(registry.devices_by_kind("motor").len(), 2);

        let optics: Arc<DeviceGroup> = registry.get("optics").unwrap();
        assert_eq!(optics.children().len(), 2);
        assert!(optics.is_active());
        assert!(registry.get::<Shutter>("omega").is_err());
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let (context, _) = context();
        let specs = vec![DeviceSpec::new("robot", "Teleporter")];
        let err = DeviceRegistryBuilder::new()
            .with_standard_types()
            .build(&context, &specs)
            .unwrap_err();
        assert!(matches!(err, DeviceError::Configuration(_)));
        assert!(err.to_string().contains("Teleporter"));
    }

    #[tokio::test]
    async fn test_missing_reference_is_rejected() {
        let (context, _) = context();
        let specs = vec![
            DeviceSpec::new("optics", "DeviceGroup").with_arg("devices", vec!["mono"]),
            DeviceSpec::new("mono", "Motor").with_arg("pv", "BL:mono"),
        ];
        let err = DeviceRegistryBuilder::new()
            .with_standard_types()
            .build(&context, &specs)
            .unwrap_err();
        assert!(err.to_string().contains("mono"));
    }

    #[tokio::test]
    async fn test_missing_argument_and_duplicates() {
        let (context, _) = context();
        let builder = DeviceRegistryBuilder::new().with_standard_types();
        assert!(builder
            .build(&context, &[DeviceSpec::new("omega", "Motor")])
            .is_err());

        let motor = DeviceSpec::new("omega", "Motor").with_arg("pv", "BL:omega");
        assert!(builder.build(&context, &[motor.clone(), motor]).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            parse_specs("[{\"name\": 3}]"),
            Err(DeviceError::Configuration(_))
        ));
    }
}
