//! Device state as tracked by the registry
//!
//! A [`Device`] mirrors one kernel network interface. It is only mutated by
//! the reconciliation engine applying kernel-sourced updates; external
//! holders keep a [`DeviceHandle`] and re-resolve it through the manager.

use crate::drivers::DeviceDriver;
use crate::error::{IfmgrError, Result};
use crate::types::{HwAddress, IfAddress, LinkInfo};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Device kinds the agent knows how to own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Any interface the agent did not create itself
    Generic,
    Dummy,
    Bridge,
    Bond,
    Vlan,
    Veth,
    MacVlan,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Generic,
        DeviceKind::Dummy,
        DeviceKind::Bridge,
        DeviceKind::Bond,
        DeviceKind::Vlan,
        DeviceKind::Veth,
        DeviceKind::MacVlan,
    ];

    /// Class name used by the controller when requesting a device
    pub fn class_name(&self) -> &'static str {
        match self {
            DeviceKind::Generic => "Device",
            DeviceKind::Dummy => "DummyDevice",
            DeviceKind::Bridge => "BridgeDevice",
            DeviceKind::Bond => "BondDevice",
            DeviceKind::Vlan => "VlanDevice",
            DeviceKind::Veth => "VethDevice",
            DeviceKind::MacVlan => "MacvlanDevice",
        }
    }

    /// `ip link` type keyword; None for devices that are never created
    pub fn link_type(&self) -> Option<&'static str> {
        match self {
            DeviceKind::Generic => None,
            DeviceKind::Dummy => Some("dummy"),
            DeviceKind::Bridge => Some("bridge"),
            DeviceKind::Bond => Some("bond"),
            DeviceKind::Vlan => Some("vlan"),
            DeviceKind::Veth => Some("veth"),
            DeviceKind::MacVlan => Some("macvlan"),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl FromStr for DeviceKind {
    type Err = IfmgrError;

    fn from_str(s: &str) -> Result<Self> {
        DeviceKind::ALL
            .into_iter()
            .find(|kind| {
                kind.class_name().eq_ignore_ascii_case(s)
                    || kind.link_type().is_some_and(|t| t.eq_ignore_ascii_case(s))
            })
            .ok_or_else(|| IfmgrError::Configuration(format!("Unknown device class {}", s)))
    }
}

/// Stable reference to a registered device
///
/// The generation changes whenever the slot for an ifindex is repopulated,
/// so a handle taken before a removal never resolves to a later device that
/// happens to reuse the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub ifindex: u32,
    pub generation: u64,
}

/// One kernel network interface
#[derive(Debug)]
pub struct Device {
    ifindex: u32,
    generation: u64,
    kind: DeviceKind,
    name: String,
    hwaddr: Option<HwAddress>,
    link_kind: Option<String>,
    mtu: Option<u32>,
    master: Option<u32>,
    admin_up: bool,
    carrier: bool,
    addresses: BTreeSet<IfAddress>,
    enabled: bool,
    managed: bool,
    deleted: bool,
    driver: Option<Box<dyn DeviceDriver>>,
}

impl Device {
    /// Device of the given kind initialized from kernel link data
    pub fn from_link(kind: DeviceKind, link: &LinkInfo) -> Self {
        Self {
            ifindex: link.ifindex,
            generation: 0,
            kind,
            name: link.name.clone(),
            hwaddr: link.hwaddr.clone(),
            link_kind: link.link_kind.clone(),
            mtu: link.mtu,
            master: link.master,
            admin_up: link.admin_up,
            carrier: link.carrier,
            addresses: BTreeSet::new(),
            enabled: true,
            managed: false,
            deleted: false,
            driver: None,
        }
    }

    /// Device first seen through a notification or a scan
    pub fn discovered(link: &LinkInfo) -> Self {
        Self::from_link(DeviceKind::Generic, link)
    }

    /// Agent-created device bound to the kernel link that appeared for it
    pub fn from_driver(driver: Box<dyn DeviceDriver>, link: &LinkInfo) -> Self {
        let mut device = Self::from_link(driver.kind(), link);
        device.managed = true;
        device.driver = Some(driver);
        device
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            ifindex: self.ifindex,
            generation: self.generation,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hwaddr(&self) -> Option<&HwAddress> {
        self.hwaddr.as_ref()
    }

    /// Kernel link type (IFLA_INFO_KIND)
    pub fn link_kind(&self) -> Option<&str> {
        self.link_kind.as_deref()
    }

    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    pub fn master(&self) -> Option<u32> {
        self.master
    }

    pub fn is_admin_up(&self) -> bool {
        self.admin_up
    }

    pub fn has_carrier(&self) -> bool {
        self.carrier
    }

    pub fn addresses(&self) -> impl Iterator<Item = &IfAddress> {
        self.addresses.iter()
    }

    /// Agent-side administrative state
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True if the agent created this device on request
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn driver(&self) -> Option<&dyn DeviceDriver> {
        self.driver.as_deref()
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub(crate) fn rebind(&mut self, ifindex: u32) {
        self.ifindex = ifindex;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.ensure_live()?;
        self.enabled = enabled;
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.deleted {
            Err(IfmgrError::StaleReference(self.ifindex))
        } else {
            Ok(())
        }
    }

    /// Apply an RTM_NEWLINK update; the kernel may rename or re-address a link
    pub(crate) fn apply_link(&mut self, link: &LinkInfo) -> Result<()> {
        self.ensure_live()?;
        if !link.name.is_empty() {
            self.name = link.name.clone();
        }
        if link.hwaddr.is_some() {
            self.hwaddr = link.hwaddr.clone();
        }
        if link.link_kind.is_some() {
            self.link_kind = link.link_kind.clone();
        }
        if link.mtu.is_some() {
            self.mtu = link.mtu;
        }
        self.master = link.master;
        self.admin_up = link.admin_up;
        self.carrier = link.carrier;
        Ok(())
    }

    pub(crate) fn add_address(&mut self, address: IfAddress) -> Result<()> {
        self.ensure_live()?;
        self.addresses.insert(address);
        Ok(())
    }

    pub(crate) fn remove_address(&mut self, address: &IfAddress) -> Result<()> {
        self.ensure_live()?;
        self.addresses.remove(address);
        Ok(())
    }

    /// Replace the whole address set with an authoritative list
    pub(crate) fn replace_addresses(
        &mut self,
        addresses: impl IntoIterator<Item = IfAddress>,
    ) -> Result<()> {
        self.ensure_live()?;
        self.addresses = addresses.into_iter().collect();
        Ok(())
    }

    /// Attribute map reported to the controller and used for parameter lookups
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("ifindex".into(), Value::from(self.ifindex));
        map.insert("name".into(), Value::from(self.name.clone()));
        map.insert(
            "hwaddr".into(),
            self.hwaddr
                .as_ref()
                .map_or(Value::Null, |hw| Value::from(hw.to_string())),
        );
        map.insert("kind".into(), Value::from(self.kind.class_name()));
        map.insert(
            "driver".into(),
            self.link_kind.clone().map_or(Value::Null, Value::from),
        );
        map.insert("mtu".into(), self.mtu.map_or(Value::Null, Value::from));
        map.insert(
            "master".into(),
            self.master.map_or(Value::Null, Value::from),
        );
        map.insert("admin_up".into(), Value::from(self.admin_up));
        map.insert("carrier".into(), Value::from(self.carrier));
        map.insert("managed".into(), Value::from(self.managed));
        map.insert(
            "ip_addrs".into(),
            Value::from(
                self.addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>(),
            ),
        );
        if let Some(driver) = &self.driver {
            driver.describe(&mut map);
        }
        map
    }

    /// Conjunctive match of every predicate key/value against the snapshot
    pub fn matches(&self, predicate: &Map<String, Value>) -> bool {
        let snapshot = self.snapshot();
        predicate
            .iter()
            .all(|(key, value)| snapshot.get(key) == Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eth0() -> LinkInfo {
        LinkInfo::new(2, "eth0")
            .with_hwaddr(HwAddress::parse("52:54:00:aa:bb:cc").unwrap())
            .with_mtu(1500)
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Device".parse::<DeviceKind>().unwrap(), DeviceKind::Generic);
        assert_eq!("VethDevice".parse::<DeviceKind>().unwrap(), DeviceKind::Veth);
        assert_eq!("bridge".parse::<DeviceKind>().unwrap(), DeviceKind::Bridge);
        assert!("TeamDevice".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_discovered_device() {
        let dev = Device::discovered(&eth0());
        assert_eq!(dev.ifindex(), 2);
        assert_eq!(dev.name(), "eth0");
        assert_eq!(dev.kind(), DeviceKind::Generic);
        assert!(!dev.is_managed());
        assert!(!dev.is_deleted());
    }

    #[test]
    fn test_apply_link_rename() {
        let mut dev = Device::discovered(&eth0());
        let mut renamed = eth0();
        renamed.name = "ens3".to_string();
        renamed.admin_up = true;
        dev.apply_link(&renamed).unwrap();
        assert_eq!(dev.name(), "ens3");
        assert!(dev.is_admin_up());
        assert_eq!(dev.mtu(), Some(1500));
    }

    #[test]
    fn test_deleted_device_rejects_updates() {
        let mut dev = Device::discovered(&eth0());
        dev.mark_deleted();
        let err = dev.apply_link(&eth0()).unwrap_err();
        assert!(err.is_stale());
        assert!(dev.add_address("10.0.0.1/24".parse().unwrap()).is_err());
        assert!(dev.set_enabled(false).is_err());
    }

    #[test]
    fn test_replace_addresses() {
        let mut dev = Device::discovered(&eth0());
        dev.add_address("10.0.0.1/24".parse().unwrap()).unwrap();
        dev.add_address("10.0.0.2/24".parse().unwrap()).unwrap();
        dev.replace_addresses(vec!["10.0.0.3/24".parse().unwrap()])
            .unwrap();
        let addrs: Vec<String> = dev.addresses().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.3/24".to_string()]);
    }

    #[test]
    fn test_snapshot_fields() {
        let dev = Device::discovered(&eth0());
        let snap = dev.snapshot();
        assert_eq!(snap["ifindex"], json!(2));
        assert_eq!(snap["name"], json!("eth0"));
        assert_eq!(snap["hwaddr"], json!("52:54:00:aa:bb:cc"));
        assert_eq!(snap["kind"], json!("Device"));
        assert_eq!(snap["driver"], Value::Null);
        assert!(!snap.contains_key("enabled"));
    }

    #[test]
    fn test_matches_is_conjunctive() {
        let dev = Device::discovered(&eth0());
        let mut predicate = Map::new();
        predicate.insert("name".into(), json!("eth0"));
        assert!(dev.matches(&predicate));

        predicate.insert("mtu".into(), json!(9000));
        assert!(!dev.matches(&predicate));

        let mut unknown = Map::new();
        unknown.insert("no_such_key".into(), json!(1));
        assert!(!dev.matches(&unknown));
    }
}
