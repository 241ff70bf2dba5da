//! Device hotplug registry.
//!
//! Devices are created on demand by factories registered per device type and
//! attached behind a policy check. Attached devices are addressable by name,
//! which the kernel exposes as `/dev/<name>`.

pub mod builtin;

pub use builtin::{NullDeviceFactory, NullFile};

use kernel_api::{
    Capability, CapabilityError, DeviceHandle, DeviceId, Errno, FileHandle, IoResult, KernelError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use thiserror::Error;

/// What a factory produced for one hotplug request
pub struct CreatedDevice {
    pub name: String,
    pub capability: Capability,
}

/// Builds capabilities of one device type
pub trait DeviceFactory {
    fn device_type(&self) -> &str;

    /// Creates a device from hotplug arguments; rejects bad arguments with
    /// [`DeviceManagerError::InvalidArgs`]
    fn create(&self, args: &Value) -> Result<CreatedDevice, DeviceManagerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugDecision {
    Allow,
    Deny { reason: String },
}

pub trait HotplugPolicy {
    fn evaluate(&self, device_type: &str, args: &Value) -> HotplugDecision;
}

pub struct AllowAllDevices;

impl HotplugPolicy for AllowAllDevices {
    fn evaluate(&self, _device_type: &str, _args: &Value) -> HotplugDecision {
        HotplugDecision::Allow
    }
}

pub struct DenyAllDevices;

impl HotplugPolicy for DenyAllDevices {
    fn evaluate(&self, _device_type: &str, _args: &Value) -> HotplugDecision {
        HotplugDecision::Deny {
            reason: "Hotplug is disabled".to_string(),
        }
    }
}

/// How a device is detached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachMode {
    /// Release the device's resources
    Release,
    /// Release and terminate the processes attached to it (ttys)
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceManagerError {
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("Invalid device arguments: {0}")]
    InvalidArgs(String),

    #[error("Policy denied hotplug: {0}")]
    PolicyDenied(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Device name in use: {0}")]
    NameInUse(String),
}

impl From<DeviceManagerError> for KernelError {
    fn from(error: DeviceManagerError) -> Self {
        match error {
            DeviceManagerError::UnsupportedDevice(kind) => KernelError::UnsupportedDevice(kind),
            DeviceManagerError::InvalidArgs(reason) => KernelError::InvalidArgs(reason),
            DeviceManagerError::PolicyDenied(reason) => KernelError::PolicyDenied(reason),
            other @ DeviceManagerError::DeviceNotFound(_) => {
                KernelError::Capability(CapabilityError::new(Errno::ENODEV, other.to_string()))
            }
            other @ DeviceManagerError::NameInUse(_) => {
                KernelError::Capability(CapabilityError::new(Errno::EEXIST, other.to_string()))
            }
        }
    }
}

struct DeviceRecord {
    handle: DeviceHandle,
    capability: Capability,
}

/// Device manager holding factories and attached devices.
pub struct DeviceManager {
    policy: Box<dyn HotplugPolicy>,
    factories: HashMap<String, Box<dyn DeviceFactory>>,
    devices: HashMap<DeviceId, DeviceRecord>,
    names: BTreeMap<String, DeviceId>,
}

impl DeviceManager {
    pub fn new(policy: Box<dyn HotplugPolicy>) -> Self {
        Self {
            policy,
            factories: HashMap::new(),
            devices: HashMap::new(),
            names: BTreeMap::new(),
        }
    }

    /// Registers a factory, replacing any previous one for the same type
    pub fn register_factory(&mut self, factory: Box<dyn DeviceFactory>) {
        self.factories
            .insert(factory.device_type().to_string(), factory);
    }

    pub fn supports(&self, device_type: &str) -> bool {
        self.factories.contains_key(device_type)
    }

    /// Creates and attaches a device of `device_type`
    pub fn hotplug(
        &mut self,
        device_type: &str,
        args: &Value,
    ) -> Result<DeviceHandle, DeviceManagerError> {
        let factory = self
            .factories
            .get(device_type)
            .ok_or_else(|| DeviceManagerError::UnsupportedDevice(device_type.to_string()))?;

        if let HotplugDecision::Deny { reason } = self.policy.evaluate(device_type, args) {
            return Err(DeviceManagerError::PolicyDenied(reason));
        }

        let created = factory.create(args)?;
        if self.names.contains_key(&created.name) {
            return Err(DeviceManagerError::NameInUse(created.name));
        }

        let handle = DeviceHandle {
            id: DeviceId::new(),
            kind: created.capability.kind(),
            device_type: device_type.to_string(),
            name: created.name,
        };
        log::info!(
            "hotplug {} device {} as {}",
            device_type,
            handle.name,
            handle.id
        );
        self.names.insert(handle.name.clone(), handle.id);
        self.devices.insert(
            handle.id,
            DeviceRecord {
                handle: handle.clone(),
                capability: created.capability,
            },
        );
        Ok(handle)
    }

    /// Detaches a device; it can no longer be opened by name
    pub fn detach(&mut self, id: DeviceId, mode: DetachMode) -> Result<(), DeviceManagerError> {
        let record = self
            .devices
            .remove(&id)
            .ok_or(DeviceManagerError::DeviceNotFound(id))?;
        self.names.remove(&record.handle.name);

        match (&record.capability, mode) {
            (Capability::Tty(tty), DetachMode::Release) => tty.close(),
            (Capability::Tty(tty), DetachMode::Kill) => tty.kill(),
            (Capability::Device(device), _) => device.detach(),
            (Capability::File(_), _) => {}
        }
        log::info!("detached {} ({:?})", record.handle.name, mode);
        Ok(())
    }

    /// Opens an attached device as a file capability
    pub fn open(&self, name: &str) -> IoResult<FileHandle> {
        let record = self
            .names
            .get(name)
            .and_then(|id| self.devices.get(id))
            .ok_or_else(|| CapabilityError::new(Errno::ENOENT, format!("/dev/{}", name)))?;

        match &record.capability {
            Capability::File(file) => Ok(Rc::clone(file)),
            Capability::Device(device) => device.open(),
            Capability::Tty(_) => Err(CapabilityError::new(
                Errno::ENODEV,
                format!("tty {} is not openable as a file", name),
            )),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&DeviceHandle> {
        self.names
            .get(name)
            .and_then(|id| self.devices.get(id))
            .map(|record| &record.handle)
    }

    /// Names of attached devices, sorted
    pub fn device_names(&self) -> Vec<String> {
        self.names.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_api::Tty;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingTty {
        calls: RefCell<Vec<&'static str>>,
    }

    impl Tty for RecordingTty {
        fn name(&self) -> &str {
            "tty0"
        }
        fn close(&self) {
            self.calls.borrow_mut().push("close");
        }
        fn kill(&self) {
            self.calls.borrow_mut().push("kill");
        }
    }

    struct TtyFactory(Rc<RecordingTty>);

    impl DeviceFactory for TtyFactory {
        fn device_type(&self) -> &str {
            "tty"
        }
        fn create(&self, _args: &Value) -> Result<CreatedDevice, DeviceManagerError> {
            Ok(CreatedDevice {
                name: "tty0".to_string(),
                capability: Capability::Tty(self.0.clone()),
            })
        }
    }

    fn manager() -> DeviceManager {
        let mut manager = DeviceManager::new(Box::new(AllowAllDevices));
        manager.register_factory(Box::new(NullDeviceFactory));
        manager
    }

    #[test]
    fn test_hotplug_and_open() {
        let mut manager = manager();
        let handle = manager.hotplug("null", &json!({})).unwrap();
        assert_eq!(handle.name, "null");
        assert_eq!(handle.device_type, "null");
        assert!(manager.open("null").is_ok());
        assert_eq!(manager.device_names(), vec!["null".to_string()]);
    }

    #[test]
    fn test_hotplug_unknown_kind() {
        let mut manager = manager();
        let err = manager.hotplug("gpu", &json!({})).unwrap_err();
        assert_eq!(err, DeviceManagerError::UnsupportedDevice("gpu".to_string()));
        assert!(matches!(
            KernelError::from(err),
            KernelError::UnsupportedDevice(_)
        ));
    }

    #[test]
    fn test_hotplug_invalid_args() {
        let mut manager = manager();
        let err = manager.hotplug("null", &json!({ "name": 7 })).unwrap_err();
        assert!(matches!(err, DeviceManagerError::InvalidArgs(_)));
    }

    #[test]
    fn test_hotplug_policy_denies() {
        let mut manager = DeviceManager::new(Box::new(DenyAllDevices));
        manager.register_factory(Box::new(NullDeviceFactory));
        let result = manager.hotplug("null", &json!({}));
        assert!(matches!(result, Err(DeviceManagerError::PolicyDenied(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut manager = manager();
        manager.hotplug("null", &json!({})).unwrap();
        let err = manager.hotplug("null", &json!({})).unwrap_err();
        assert_eq!(err, DeviceManagerError::NameInUse("null".to_string()));
    }

    #[test]
    fn test_detach_modes_reach_tty() {
        let tty = Rc::new(RecordingTty::default());
        let mut manager = DeviceManager::new(Box::new(AllowAllDevices));
        manager.register_factory(Box::new(TtyFactory(tty.clone())));

        let first = manager.hotplug("tty", &json!({})).unwrap();
        assert_eq!(first.kind, core_types::CapabilityKind::Tty);
        manager.detach(first.id, DetachMode::Release).unwrap();
        assert!(manager.lookup("tty0").is_none());

        let second = manager.hotplug("tty", &json!({})).unwrap();
        manager.detach(second.id, DetachMode::Kill).unwrap();

        assert_eq!(*tty.calls.borrow(), vec!["close", "kill"]);
        assert!(matches!(
            manager.detach(second.id, DetachMode::Release),
            Err(DeviceManagerError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_open_missing_device() {
        let manager = manager();
        let err = manager.open("sda").err().expect("expected open to fail");
        assert_eq!(err.errno, Errno::ENOENT);
    }
}
