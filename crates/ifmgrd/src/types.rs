//! Core types shared by the netlink channel and the device registry
//!
//! These are transport-independent views of what the kernel reports: link
//! attributes, interface addresses and the notification kinds the
//! reconciliation engine dispatches on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Hardware (link-layer) address in normalized form
///
/// Ethernet addresses are 6 bytes, but the kernel reports other lengths for
/// tunnels and InfiniBand, so the length is not fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct HwAddress(Vec<u8>);

impl HwAddress {
    /// Create from raw bytes as reported by IFLA_ADDRESS
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse from a colon or dash separated hex string, case insensitive
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let bytes = s
            .split([':', '-'])
            .map(|part| {
                if part.is_empty() || part.len() > 2 {
                    None
                } else {
                    u8::from_str_radix(part, 16).ok()
                }
            })
            .collect::<Option<Vec<u8>>>()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for HwAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for HwAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid hardware address: {}", s))
    }
}

impl From<HwAddress> for String {
    fn from(addr: HwAddress) -> Self {
        addr.to_string()
    }
}

impl TryFrom<String> for HwAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// IP address assigned to an interface, with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IfAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IfAddress {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

impl fmt::Display for IfAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IfAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address {}: {}", s, e))?;
        let prefix_len = match prefix {
            Some(p) => p
                .parse()
                .map_err(|e| format!("invalid prefix length {}: {}", s, e))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };
        Ok(Self::new(addr, prefix_len))
    }
}

/// Link attributes carried by RTM_NEWLINK / RTM_DELLINK and link dumps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// Kernel interface index
    pub ifindex: u32,
    /// IFLA_IFNAME
    pub name: String,
    /// IFLA_ADDRESS
    pub hwaddr: Option<HwAddress>,
    /// IFLA_INFO_KIND (e.g. "veth", "bridge"); None for physical devices
    pub link_kind: Option<String>,
    /// IFLA_MTU
    pub mtu: Option<u32>,
    /// IFLA_MASTER
    pub master: Option<u32>,
    /// IFF_UP
    pub admin_up: bool,
    /// IFF_LOWER_UP
    pub carrier: bool,
}

impl LinkInfo {
    /// Minimal link record, mostly useful for tests and simulations
    pub fn new(ifindex: u32, name: impl Into<String>) -> Self {
        Self {
            ifindex,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_hwaddr(mut self, hwaddr: HwAddress) -> Self {
        self.hwaddr = Some(hwaddr);
        self
    }

    pub fn with_link_kind(mut self, kind: impl Into<String>) -> Self {
        self.link_kind = Some(kind.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

/// Address attributes carried by RTM_NEWADDR / RTM_DELADDR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    pub ifindex: u32,
    pub address: IfAddress,
}

impl AddressInfo {
    pub fn new(ifindex: u32, address: IfAddress) -> Self {
        Self { ifindex, address }
    }
}

/// Kernel notification, classified by netlink message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelMessage {
    /// RTM_NEWLINK
    NewLink(LinkInfo),
    /// RTM_DELLINK
    DelLink(LinkInfo),
    /// RTM_NEWADDR
    NewAddress(AddressInfo),
    /// RTM_DELADDR
    DelAddress(AddressInfo),
    /// Any other message type, by netlink type number
    Other(u16),
}

impl KernelMessage {
    /// Interface index the message refers to, if any
    pub fn ifindex(&self) -> Option<u32> {
        match self {
            KernelMessage::NewLink(link) | KernelMessage::DelLink(link) => Some(link.ifindex),
            KernelMessage::NewAddress(addr) | KernelMessage::DelAddress(addr) => {
                Some(addr.ifindex)
            }
            KernelMessage::Other(_) => None,
        }
    }
}

/// One entry of a full kernel enumeration: the link plus its current addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedLink {
    pub link: LinkInfo,
    pub addresses: Vec<IfAddress>,
}

impl ScannedLink {
    pub fn new(link: LinkInfo, addresses: Vec<IfAddress>) -> Self {
        Self { link, addresses }
    }
}
