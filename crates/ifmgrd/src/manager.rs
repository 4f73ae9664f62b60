//! InterfaceManager - reconciliation of kernel interfaces into the registry
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-8: System Component Inventory - Authoritative device inventory
//! - SI-4: System Monitoring - Link and address change tracking
//! - AU-12: Audit Record Generation - Device creation/removal events
//!
//! Two paths keep the registry in step with the kernel. [`InterfaceManager::rescan`]
//! re-enumerates everything and is authoritative; it also runs before every
//! lookup. [`InterfaceManager::handle_pending_messages`] applies drained
//! notifications one at a time through [`Transition`].

use crate::device::{Device, DeviceHandle, DeviceKind};
use crate::drivers::{DeviceArgs, DeviceClassRegistry, DeviceFactory};
use crate::error::{IfmgrError, Result};
use crate::naming::{OvsInterfaceNames, ReservedNameSource, first_free_index};
use crate::netlink::KernelSource;
use crate::notifier::{ControllerEvent, ControllerNotifier};
use crate::registry::DeviceRegistry;
use crate::shell::{CommandRunner, ShellRunner};
use crate::types::{AddressInfo, HwAddress, IfAddress, KernelMessage, LinkInfo};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// What one kernel notification does to the registry
///
/// Decided from the message kind and whether the ifindex is currently
/// registered. A removal for an unregistered index is `Ignore`, which is what
/// keeps duplicate DELLINKs from producing a second `deleted` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Create(LinkInfo),
    Update(LinkInfo),
    Remove(u32),
    AddAddress(AddressInfo),
    RemoveAddress(AddressInfo),
    Ignore,
}

impl Transition {
    pub fn classify(msg: KernelMessage, registry: &DeviceRegistry) -> Self {
        let known = msg.ifindex().is_some_and(|i| registry.contains(i));
        match (msg, known) {
            (KernelMessage::NewLink(link), true) => Transition::Update(link),
            (KernelMessage::NewLink(link), false) => Transition::Create(link),
            (KernelMessage::DelLink(link), true) => Transition::Remove(link.ifindex),
            (KernelMessage::DelLink(_), false) => Transition::Ignore,
            (KernelMessage::NewAddress(addr), true) => Transition::AddAddress(addr),
            (KernelMessage::DelAddress(addr), true) => Transition::RemoveAddress(addr),
            (KernelMessage::NewAddress(_) | KernelMessage::DelAddress(_), false) => {
                Transition::Ignore
            }
            (KernelMessage::Other(_), _) => Transition::Ignore,
        }
    }
}

/// Network interface state manager
///
/// # NIST Controls
/// - CM-8(1): Updates During Installation/Removal - Registry follows the kernel
/// - SI-4(4): System Monitoring - Automated analysis of link events
pub struct InterfaceManager {
    kernel: Box<dyn KernelSource>,
    notifier: Box<dyn ControllerNotifier>,
    reserved: Box<dyn ReservedNameSource>,
    runner: Arc<dyn CommandRunner>,
    classes: DeviceClassRegistry,
    devices: DeviceRegistry,
    /// Set by a channel reconnect; only a completed rescan clears it
    resync_pending: bool,
}

impl InterfaceManager {
    /// Manager with every built-in device class, shell execution and OVS
    /// name reservation
    pub fn new(kernel: Box<dyn KernelSource>, notifier: Box<dyn ControllerNotifier>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        Self {
            kernel,
            notifier,
            reserved: Box::new(OvsInterfaceNames::new(runner.clone())),
            runner,
            classes: DeviceClassRegistry::with_defaults(),
            devices: DeviceRegistry::new(),
            resync_pending: false,
        }
    }

    /// Use `runner` for device creation commands
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Use `reserved` as the source of externally held names
    pub fn with_reserved_names(mut self, reserved: Box<dyn ReservedNameSource>) -> Self {
        self.reserved = reserved;
        self
    }

    /// Read-only view of the registry, without resyncing first
    pub fn registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// File descriptor of the notification socket
    pub fn raw_fd(&self) -> i32 {
        self.kernel.raw_fd()
    }

    /// Full resync against a fresh kernel enumeration
    ///
    /// # NIST Controls
    /// - CM-8: System Component Inventory - Authoritative re-inventory
    #[instrument(skip(self))]
    pub fn rescan(&mut self) -> Result<()> {
        // Anything queued predates the dump and must not be replayed over it
        let discarded = self.kernel.drain();
        if !discarded.is_empty() {
            trace!(count = discarded.len(), "Discarded pending notifications before resync");
        }
        if self.kernel.take_reconnected() {
            self.resync_pending = true;
        }

        let scanned = self.kernel.scan()?;
        let previous = self.devices.indices();
        let mut seen = HashSet::with_capacity(scanned.len());

        for entry in scanned {
            let ifindex = entry.link.ifindex;
            seen.insert(ifindex);
            let result = match self.devices.get_mut(ifindex) {
                Some(device) => device
                    .apply_link(&entry.link)
                    .and_then(|()| device.replace_addresses(entry.addresses)),
                None => self.register_discovered(&entry.link, entry.addresses),
            };
            swallow_stale(result, ifindex)?;
        }

        for ifindex in previous {
            if !seen.contains(&ifindex) {
                self.remove_device(ifindex);
            }
        }

        self.resync_pending = false;
        debug!(devices = self.devices.len(), "Resync complete");
        Ok(())
    }

    /// Apply every pending kernel notification
    ///
    /// A channel reconnect means notifications were lost, so a full resync
    /// runs instead, and keeps running on every call until one succeeds.
    #[instrument(skip(self))]
    pub fn handle_pending_messages(&mut self) -> Result<()> {
        let messages = self.kernel.drain();
        if self.kernel.take_reconnected() {
            self.resync_pending = true;
        }
        if self.resync_pending {
            warn!("Netlink channel reconnected, forcing resync");
            return self.rescan();
        }

        for msg in messages {
            let ifindex = msg.ifindex().unwrap_or_default();
            if let Err(e) = swallow_stale(self.apply(msg), ifindex) {
                warn!(ifindex, error = %e, "Failed to apply kernel notification");
            }
        }
        Ok(())
    }

    fn apply(&mut self, msg: KernelMessage) -> Result<()> {
        let transition = Transition::classify(msg, &self.devices);
        trace!(?transition, "Applying kernel notification");
        match transition {
            Transition::Create(link) => self.register_discovered(&link, Vec::new()),
            Transition::Update(link) => self.with_device(link.ifindex, |d| d.apply_link(&link)),
            Transition::Remove(ifindex) => {
                self.remove_device(ifindex);
                Ok(())
            }
            Transition::AddAddress(addr) => {
                self.with_device(addr.ifindex, |d| d.add_address(addr.address))
            }
            Transition::RemoveAddress(addr) => {
                self.with_device(addr.ifindex, |d| d.remove_address(&addr.address))
            }
            Transition::Ignore => Ok(()),
        }
    }

    fn with_device<F>(&mut self, ifindex: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut Device) -> Result<()>,
    {
        match self.devices.get_mut(ifindex) {
            Some(device) => f(device),
            None => Err(IfmgrError::ifindex_not_found(ifindex)),
        }
    }

    /// Register a device the agent did not create, announce it, disable it
    fn register_discovered(&mut self, link: &LinkInfo, addresses: Vec<IfAddress>) -> Result<()> {
        let mut device = Device::discovered(link);
        device.replace_addresses(addresses)?;
        let dev_data = device.snapshot();
        let handle = self.devices.insert(device)?;
        info!(ifindex = link.ifindex, name = %link.name, "New device discovered");
        self.emit(ControllerEvent::DevCreated { dev_data });

        // Pre-existing interfaces are never activated on the agent's behalf
        match self.devices.resolve_mut(handle) {
            Some(device) => device.set_enabled(false),
            None => Ok(()),
        }
    }

    fn remove_device(&mut self, ifindex: u32) {
        // Already gone means a concurrent removal beat us to it
        let Some(device) = self.devices.remove(ifindex) else {
            return;
        };
        info!(ifindex, name = %device.name(), "Device removed");
        self.emit(ControllerEvent::DevDeleted { ifindex });
    }

    fn emit(&mut self, event: ControllerEvent) {
        if let Err(e) = self.notifier.notify(event) {
            warn!(error = %e, "Failed to notify controller");
        }
    }

    /// Device at `ifindex`
    #[instrument(skip(self))]
    pub fn get_device(&mut self, ifindex: u32) -> Result<&Device> {
        self.rescan()?;
        self.devices
            .get(ifindex)
            .ok_or_else(|| IfmgrError::ifindex_not_found(ifindex))
    }

    /// Every live device in ascending ifindex order
    pub fn get_devices(&mut self) -> Result<Vec<&Device>> {
        self.rescan()?;
        Ok(self.devices.iter().collect())
    }

    /// First device whose hardware address equals `hwaddr`
    ///
    /// The address is normalized first, so `00:1B:21:0A:0B:0C` and
    /// `00-1b-21-0a-0b-0c` are the same lookup.
    #[instrument(skip(self))]
    pub fn get_device_by_hwaddr(&mut self, hwaddr: &str) -> Result<&Device> {
        let wanted = HwAddress::parse(hwaddr)
            .ok_or_else(|| IfmgrError::NotFound(format!("hwaddr {}", hwaddr)))?;
        self.rescan()?;
        self.devices
            .iter()
            .find(|dev| dev.hwaddr() == Some(&wanted))
            .ok_or_else(|| IfmgrError::NotFound(format!("hwaddr {}", hwaddr)))
    }

    /// First device currently named `name`
    #[instrument(skip(self))]
    pub fn get_device_by_name(&mut self, name: &str) -> Result<&Device> {
        self.rescan()?;
        self.devices
            .iter()
            .find(|dev| dev.name() == name)
            .ok_or_else(|| IfmgrError::NotFound(format!("name {}", name)))
    }

    /// First device whose snapshot matches every entry of `params`
    ///
    /// No match is `Ok(None)`, not an error.
    #[instrument(skip(self, params))]
    pub fn get_device_by_params(&mut self, params: &Map<String, Value>) -> Result<Option<&Device>> {
        self.rescan()?;
        Ok(self.devices.iter().find(|dev| dev.matches(params)))
    }

    /// Re-resolve a handle; fails once the device is gone or replaced
    pub fn resolve(&self, handle: DeviceHandle) -> Result<&Device> {
        self.devices
            .resolve(handle)
            .ok_or_else(|| IfmgrError::ifindex_not_found(handle.ifindex))
    }

    /// Set the agent-side administrative state of a device
    pub fn set_enabled(&mut self, handle: DeviceHandle, enabled: bool) -> Result<()> {
        let device = self
            .devices
            .resolve_mut(handle)
            .ok_or_else(|| IfmgrError::ifindex_not_found(handle.ifindex))?;
        device.set_enabled(enabled)?;
        debug!(ifindex = handle.ifindex, enabled, "Device administrative state changed");
        Ok(())
    }

    /// Create a device of `kind` and bind it to the kernel link that appears
    ///
    /// The kernel is enumerated once after creation. If no link carries the
    /// requested name the result is `Ok(None)`; there is no retry.
    ///
    /// # NIST Controls
    /// - CM-3: Configuration Change Control - Agent-initiated device creation
    #[instrument(skip(self, args))]
    pub async fn create_device(
        &mut self,
        kind: DeviceKind,
        args: &DeviceArgs,
    ) -> Result<Option<DeviceHandle>> {
        let driver = self.classes.build(kind, args)?;
        driver.create(self.runner.as_ref()).await?;

        let scanned = self.kernel.scan()?;
        let Some(entry) = scanned.into_iter().find(|e| e.link.name == driver.name()) else {
            let err = IfmgrError::CreationFailed(format!(
                "{} did not appear after creation",
                driver.name()
            ));
            warn!(error = %err, "Created device not found in kernel enumeration");
            return Ok(None);
        };

        let ifindex = entry.link.ifindex;
        let mut device = Device::from_driver(driver, &entry.link);
        device.replace_addresses(entry.addresses)?;
        // An earlier resync may already have picked the link up as generic
        self.devices.detach(ifindex);
        let handle = self.devices.insert(device)?;
        info!(ifindex, %kind, "Bound created device");
        Ok(Some(handle))
    }

    /// Register an additional device class
    pub fn add_device_class(&mut self, factory: Box<dyn DeviceFactory>) -> Result<()> {
        self.classes.add(factory)
    }

    /// Forget every registered device class
    pub fn clear_device_classes(&mut self) {
        self.classes.clear();
    }

    /// Stop tracking a device without tombstoning it or notifying
    pub fn untrack(&mut self, handle: DeviceHandle) -> Result<Device> {
        if self.devices.resolve(handle).is_none() {
            return Err(IfmgrError::ifindex_not_found(handle.ifindex));
        }
        self.devices
            .detach(handle.ifindex)
            .ok_or_else(|| IfmgrError::ifindex_not_found(handle.ifindex))
    }

    /// Substitute the device registered at `ifindex`
    ///
    /// Handles to the previous device stop resolving.
    pub fn replace(&mut self, ifindex: u32, device: Device) -> Result<DeviceHandle> {
        let (handle, previous) = self.devices.replace(ifindex, device)?;
        debug!(ifindex, previous = %previous.name(), "Replaced device");
        Ok(handle)
    }

    /// Smallest free `prefix{n}`
    #[instrument(skip(self))]
    pub async fn assign_name(&mut self, prefix: &str) -> Result<String> {
        let used = self.used_names().await?;
        let n = first_free_index(prefix, 0, |name| used.contains(name));
        Ok(format!("{}{}", prefix, n))
    }

    /// Two free names `prefix{n1}` and `prefix{n2}` with `n2 > n1`
    ///
    /// A point-in-time check; nothing stops another allocator from taking
    /// either name before the caller does.
    #[instrument(skip(self))]
    pub async fn assign_name_pair(&mut self, prefix: &str) -> Result<(String, String)> {
        let used = self.used_names().await?;
        let n1 = first_free_index(prefix, 0, |name| used.contains(name));
        let n2 = first_free_index(prefix, n1 + 1, |name| used.contains(name));
        Ok((format!("{}{}", prefix, n1), format!("{}{}", prefix, n2)))
    }

    /// Live device names plus reserved names, fetched once
    async fn used_names(&mut self) -> Result<HashSet<String>> {
        self.rescan()?;
        let mut used = self.reserved.reserved_names().await?;
        used.extend(self.devices.iter().map(|dev| dev.name().to_string()));
        Ok(used)
    }

    /// Count of live devices per kind
    pub fn kind_counts(&self) -> HashMap<DeviceKind, usize> {
        let mut counts = HashMap::new();
        for device in self.devices.iter() {
            *counts.entry(device.kind()).or_insert(0) += 1;
        }
        counts
    }
}

/// Updates racing a removal are benign; everything else propagates
fn swallow_stale(result: Result<()>, ifindex: u32) -> Result<()> {
    match result {
        Err(e) if e.is_stale() => {
            debug!(ifindex, "Ignoring update for deleted device");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::mock::SimulatedKernel;
    use crate::naming::StaticReservedNames;
    use crate::notifier::MemoryNotifier;
    use crate::shell::RecordingRunner;

    fn manager() -> (InterfaceManager, SimulatedKernel, MemoryNotifier) {
        let kernel = SimulatedKernel::new();
        let notifier = MemoryNotifier::new();
        let mgr = InterfaceManager::new(Box::new(kernel.clone()), Box::new(notifier.clone()))
            .with_runner(Arc::new(RecordingRunner::new()))
            .with_reserved_names(Box::new(StaticReservedNames::default()));
        (mgr, kernel, notifier)
    }

    #[test]
    fn test_transition_table() {
        let mut registry = DeviceRegistry::new();
        registry
            .insert(Device::discovered(&LinkInfo::new(1, "eth0")))
            .unwrap();
        let addr = AddressInfo::new(1, "10.0.0.1/24".parse().unwrap());
        let unknown_addr = AddressInfo::new(9, "10.0.0.9/24".parse().unwrap());

        let cases = [
            (KernelMessage::NewLink(LinkInfo::new(1, "eth0")), "Update"),
            (KernelMessage::NewLink(LinkInfo::new(2, "eth1")), "Create"),
            (KernelMessage::DelLink(LinkInfo::new(1, "eth0")), "Remove"),
            (KernelMessage::DelLink(LinkInfo::new(2, "eth1")), "Ignore"),
            (KernelMessage::NewAddress(addr), "AddAddress"),
            (KernelMessage::DelAddress(addr), "RemoveAddress"),
            (KernelMessage::NewAddress(unknown_addr), "Ignore"),
            (KernelMessage::Other(24), "Ignore"),
        ];
        for (msg, expected) in cases {
            let transition = Transition::classify(msg.clone(), &registry);
            let name = format!("{:?}", transition);
            assert!(name.starts_with(expected), "{:?} -> {}", msg, name);
        }
    }

    #[test]
    fn test_discovered_devices_are_disabled() {
        let (mut mgr, kernel, notifier) = manager();
        kernel.link_added(LinkInfo::new(5, "veth0"));
        mgr.handle_pending_messages().unwrap();

        let dev = mgr.registry().get(5).unwrap();
        assert!(!dev.is_enabled());
        assert_eq!(notifier.created(), vec![5]);
    }

    #[test]
    fn test_address_notifications() {
        let (mut mgr, kernel, _) = manager();
        kernel.link_added(LinkInfo::new(2, "eth0"));
        let addr: IfAddress = "192.0.2.1/24".parse().unwrap();
        kernel.address_added(2, addr);
        mgr.handle_pending_messages().unwrap();
        assert_eq!(mgr.registry().get(2).unwrap().addresses().count(), 1);

        kernel.address_removed(2, addr);
        mgr.handle_pending_messages().unwrap();
        assert_eq!(mgr.registry().get(2).unwrap().addresses().count(), 0);
    }

    #[test]
    fn test_set_enabled_via_handle() {
        let (mut mgr, kernel, _) = manager();
        kernel.set_link(LinkInfo::new(3, "eth2"), vec![]);
        let handle = mgr.get_device(3).unwrap().handle();
        mgr.set_enabled(handle, true).unwrap();
        assert!(mgr.resolve(handle).unwrap().is_enabled());

        kernel.unset_link(3);
        mgr.rescan().unwrap();
        assert!(mgr.set_enabled(handle, true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_untrack_is_silent() {
        let (mut mgr, kernel, notifier) = manager();
        kernel.set_link(LinkInfo::new(4, "dummy0"), vec![]);
        let handle = mgr.get_device(4).unwrap().handle();
        notifier.take();

        let device = mgr.untrack(handle).unwrap();
        assert!(!device.is_deleted());
        assert!(mgr.registry().get(4).is_none());
        assert!(notifier.events().is_empty());
        assert!(mgr.untrack(handle).unwrap_err().is_not_found());
    }

    #[test]
    fn test_scan_failure_propagates() {
        let (mut mgr, kernel, _) = manager();
        kernel.fail_next_scan();
        assert!(mgr.rescan().is_err());
        assert!(mgr.rescan().is_ok());
    }

    #[test]
    fn test_reconnect_flag_outlives_failed_rescan() {
        let (mut mgr, kernel, _) = manager();
        kernel.fail_next_drain();
        kernel.fail_next_scan();
        assert!(mgr.handle_pending_messages().is_err());
        assert!(mgr.resync_pending);

        mgr.handle_pending_messages().unwrap();
        assert!(!mgr.resync_pending);
        assert_eq!(kernel.scans(), 1);
    }

    #[test]
    fn test_kind_counts() {
        let (mut mgr, kernel, _) = manager();
        kernel.set_link(LinkInfo::new(1, "lo"), vec![]);
        kernel.set_link(LinkInfo::new(2, "eth0"), vec![]);
        mgr.rescan().unwrap();
        assert_eq!(mgr.kind_counts().get(&DeviceKind::Generic), Some(&2));
    }
}
