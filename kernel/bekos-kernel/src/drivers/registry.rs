//! Central device registry.
//!
//! Drivers register devices under a name prefix during probe; the registry
//! appends a monotonic suffix per prefix (`generic.usb.keyboard` becomes
//! `generic.usb.keyboard0`, `...1`, ...). Kernel subsystems look devices up
//! by kind; userspace enumerates and opens them by name through the
//! `ListDevices` / `OpenDevice` syscalls.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::sync::IrqSpinLock;

use super::device::{Device, DeviceKind};

/// The registry: name → device, in insertion-independent sorted order.
pub struct DeviceRegistry {
    devices: BTreeMap<String, Arc<dyn Device>>,
    next_suffix: BTreeMap<String, u32>,
}

impl DeviceRegistry {
    fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            next_suffix: BTreeMap::new(),
        }
    }

    /// Registers `device` under `prefix`, returning the full name.
    pub fn register_device(&mut self, prefix: &str, device: Arc<dyn Device>) -> String {
        let suffix = self.next_suffix.entry(String::from(prefix)).or_insert(0);
        let name = format!("{prefix}{suffix}");
        *suffix += 1;
        bekos_core::kinfo!("registry", "registered device '{}'", name);
        self.devices.insert(name.clone(), device);
        name
    }

    /// Opens a device by its full name.
    #[must_use]
    pub fn open(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(name).cloned()
    }

    /// Returns the first registered device of `kind`.
    #[must_use]
    pub fn find_first_of_kind(&self, kind: DeviceKind) -> Option<Arc<dyn Device>> {
        self.devices
            .values()
            .find(|d| d.kind() == kind)
            .cloned()
    }

    /// Visits every device as `(name, device)`, in name order.
    pub fn for_each_device(&self, mut f: impl FnMut(&str, &Arc<dyn Device>)) {
        for (name, device) in &self.devices {
            f(name, device);
        }
    }

    /// Returns the `(name, device)` pairs in name order. Used by the
    /// device-list serialiser.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.devices
            .iter()
            .map(|(name, device)| (name.clone(), device.clone()))
            .collect()
    }
}

static DEVICE_REGISTRY: IrqSpinLock<Option<DeviceRegistry>> = IrqSpinLock::new(None);

/// Initialises the global registry. Called once before probing begins.
pub fn init() {
    let mut guard = DEVICE_REGISTRY.lock();
    assert!(guard.is_none(), "device registry already initialised");
    *guard = Some(DeviceRegistry::new());
}

/// Runs a closure against the global registry.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with<R>(f: impl FnOnce(&mut DeviceRegistry) -> R) -> R {
    let mut guard = DEVICE_REGISTRY.lock();
    f(guard.as_mut().expect("device registry not initialised"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DeviceProtocol;

    struct FakeKeyboard;
    impl Device for FakeKeyboard {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Keyboard
        }
        fn userspace_protocol(&self) -> Option<DeviceProtocol> {
            Some(DeviceProtocol::Keyboard)
        }
    }

    struct FakeTimer;
    impl Device for FakeTimer {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Timer
        }
    }

    #[test]
    fn names_get_monotonic_suffixes() {
        let mut registry = DeviceRegistry::new();
        let a = registry.register_device("generic.usb.keyboard", Arc::new(FakeKeyboard));
        let b = registry.register_device("generic.usb.keyboard", Arc::new(FakeKeyboard));
        assert_eq!(a, "generic.usb.keyboard0");
        assert_eq!(b, "generic.usb.keyboard1");
    }

    #[test]
    fn open_by_full_name() {
        let mut registry = DeviceRegistry::new();
        registry.register_device("generic.usb.keyboard", Arc::new(FakeKeyboard));
        assert!(registry.open("generic.usb.keyboard0").is_some());
        assert!(registry.open("generic.usb.keyboard").is_none());
        assert!(registry.open("generic.usb.keyboard1").is_none());
    }

    #[test]
    fn find_by_kind() {
        let mut registry = DeviceRegistry::new();
        registry.register_device("generic.usb.keyboard", Arc::new(FakeKeyboard));
        registry.register_device("platform.timer", Arc::new(FakeTimer));
        let timer = registry.find_first_of_kind(DeviceKind::Timer).unwrap();
        assert_eq!(timer.kind(), DeviceKind::Timer);
        assert!(registry.find_first_of_kind(DeviceKind::Framebuffer).is_none());
    }

    #[test]
    fn snapshot_in_name_order() {
        let mut registry = DeviceRegistry::new();
        registry.register_device("zeta", Arc::new(FakeTimer));
        registry.register_device("alpha", Arc::new(FakeKeyboard));
        let names: Vec<String> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, &["alpha0", "zeta0"]);
    }
}
