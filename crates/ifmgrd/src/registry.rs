//! Device registry: ifindex to device arena
//!
//! The registry owns every [`Device`]. Removal marks the device deleted and
//! takes it out of the map in the same call, so no caller can observe a
//! tombstoned device that is still registered. Every insert stamps a fresh
//! generation, which is what makes an old [`DeviceHandle`] stop resolving
//! once its slot has been repopulated.

use crate::device::{Device, DeviceHandle};
use crate::error::{IfmgrError, Result};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Live devices keyed by ifindex, iterated in ascending ifindex order
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, Device>,
    next_generation: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its ifindex and return its handle
    ///
    /// Fails if the index is already taken; use [`DeviceRegistry::replace`]
    /// for deliberate substitution.
    pub fn insert(&mut self, mut device: Device) -> Result<DeviceHandle> {
        let ifindex = device.ifindex();
        match self.devices.entry(ifindex) {
            Entry::Occupied(_) => Err(IfmgrError::Configuration(format!(
                "ifindex {} is already registered",
                ifindex
            ))),
            Entry::Vacant(slot) => {
                self.next_generation += 1;
                device.set_generation(self.next_generation);
                let handle = device.handle();
                slot.insert(device);
                Ok(handle)
            }
        }
    }

    /// Tombstone and remove in one step; None if the index is already gone
    pub fn remove(&mut self, ifindex: u32) -> Option<Device> {
        let mut device = self.devices.remove(&ifindex)?;
        device.mark_deleted();
        Some(device)
    }

    /// Drop the device at `ifindex` without tombstoning it
    ///
    /// The caller takes ownership and may register it again later.
    pub fn detach(&mut self, ifindex: u32) -> Option<Device> {
        self.devices.remove(&ifindex)
    }

    /// Put `device` in place of the current entry for `ifindex`
    ///
    /// The previous device is returned untouched; the new one gets a fresh
    /// generation so handles to the previous one stop resolving.
    pub fn replace(&mut self, ifindex: u32, mut device: Device) -> Result<(DeviceHandle, Device)> {
        if device.is_deleted() {
            return Err(IfmgrError::StaleReference(device.ifindex()));
        }
        let previous = self
            .devices
            .remove(&ifindex)
            .ok_or_else(|| IfmgrError::ifindex_not_found(ifindex))?;
        device.rebind(ifindex);
        self.next_generation += 1;
        device.set_generation(self.next_generation);
        let handle = device.handle();
        self.devices.insert(ifindex, device);
        Ok((handle, previous))
    }

    pub fn get(&self, ifindex: u32) -> Option<&Device> {
        self.devices.get(&ifindex)
    }

    pub(crate) fn get_mut(&mut self, ifindex: u32) -> Option<&mut Device> {
        self.devices.get_mut(&ifindex)
    }

    /// Look up a handle; a handle from an earlier occupant of the slot fails
    pub fn resolve(&self, handle: DeviceHandle) -> Option<&Device> {
        self.devices
            .get(&handle.ifindex)
            .filter(|dev| dev.handle() == handle)
    }

    pub(crate) fn resolve_mut(&mut self, handle: DeviceHandle) -> Option<&mut Device> {
        self.devices
            .get_mut(&handle.ifindex)
            .filter(|dev| dev.handle() == handle)
    }

    pub fn contains(&self, ifindex: u32) -> bool {
        self.devices.contains_key(&ifindex)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Snapshot of the live index set
    pub fn indices(&self) -> Vec<u32> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
