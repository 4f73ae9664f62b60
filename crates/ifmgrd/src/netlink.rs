//! Netlink channel for link and address events
//!
//! Owns the kernel notification socket (RTMGRP_LINK, RTMGRP_IPV4_IFADDR and
//! RTMGRP_IPV6_IFADDR) and performs full link/address enumerations on a
//! separate request socket. Draining never blocks and never fails: a socket
//! error closes and reopens the subscription, drops whatever was in flight
//! and flags the channel as reconnected so the engine resyncs.

use crate::error::Result;
use crate::types::{KernelMessage, ScannedLink};

/// Source of kernel notifications and enumerations consumed by the engine
pub trait KernelSource: Send {
    /// Return every pending notification without blocking.
    ///
    /// On transport error the channel reconnects and returns an empty batch.
    fn drain(&mut self) -> Vec<KernelMessage>;

    /// True once after each reconnect; the caller must resync before
    /// trusting incremental state again.
    fn take_reconnected(&mut self) -> bool;

    /// Enumerate the kernel's current links together with their addresses
    fn scan(&mut self) -> Result<Vec<ScannedLink>>;

    /// File descriptor to register with a readiness-based event loop
    fn raw_fd(&self) -> i32 {
        -1
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::KernelSource;
    use crate::config::NetlinkConfig;
    use crate::error::{IfmgrError, Result};
    use crate::types::{
        AddressInfo, HwAddress, IfAddress, KernelMessage, LinkInfo, ScannedLink,
    };
    use netlink_packet_core::{
        NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::link::{
        LinkAttribute, LinkFlags, LinkInfo as NlLinkInfo, LinkMessage,
    };
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::collections::HashMap;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, error, instrument, trace, warn};

    /// Link notifications (RTMGRP_LINK)
    const RTMGRP_LINK: u32 = 0x1;
    /// IPv4 address notifications (RTMGRP_IPV4_IFADDR)
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;
    /// IPv6 address notifications (RTMGRP_IPV6_IFADDR)
    const RTMGRP_IPV6_IFADDR: u32 = 0x100;

    pub const NL_GROUPS: u32 = RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR;

    /// Netlink channel subscribed to link and address changes
    pub struct NetlinkChannel {
        socket: Option<Socket>,
        /// Receive buffer, cleared and reused for every datagram
        buffer: Vec<u8>,
        config: NetlinkConfig,
        reconnected: bool,
        sequence: u32,
    }

    impl NetlinkChannel {
        /// Open the notification socket and subscribe to the link/address groups
        #[instrument(skip(config))]
        pub fn new(config: &NetlinkConfig) -> Result<Self> {
            let socket = open_subscription(config)?;
            debug!(groups = NL_GROUPS, "Netlink socket bound to link/address groups");
            Ok(Self {
                socket: Some(socket),
                buffer: Vec::with_capacity(config.recv_buffer_size),
                config: config.clone(),
                reconnected: false,
                sequence: 0,
            })
        }

        /// Close and reopen the subscription; in-flight messages are lost
        fn reconnect(&mut self) {
            self.socket = None;
            self.reconnected = true;
            match open_subscription(&self.config) {
                Ok(socket) => {
                    warn!("Netlink socket reconnected, resync required");
                    self.socket = Some(socket);
                }
                Err(e) => {
                    error!(error = %e, "Failed to reopen netlink socket, retrying on next drain");
                }
            }
        }

        /// Send a dump request on a fresh socket and collect every reply
        fn dump(&mut self, request: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| IfmgrError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind_auto()
                .map_err(|e| IfmgrError::Netlink(format!("Failed to bind socket: {}", e)))?;
            socket
                .connect(&SocketAddr::new(0, 0))
                .map_err(|e| IfmgrError::Netlink(format!("Failed to connect socket: {}", e)))?;

            self.sequence = self.sequence.wrapping_add(1);
            let buf = dump_request(request, self.sequence);

            socket
                .send(&buf, 0)
                .map_err(|e| IfmgrError::Netlink(format!("Failed to send dump request: {}", e)))?;

            let mut replies = Vec::new();
            let mut recv_buf = Vec::with_capacity(self.config.recv_buffer_size);
            loop {
                recv_buf.clear();
                let len = socket
                    .recv(&mut recv_buf, 0)
                    .map_err(|e| IfmgrError::Netlink(format!("Failed to receive dump: {}", e)))?;

                let mut offset = 0;
                while offset < len {
                    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..])
                        .map_err(|e| {
                            IfmgrError::Netlink(format!("Failed to parse dump reply: {}", e))
                        })?;
                    let msg_len = msg.header.length as usize;
                    match msg.payload {
                        NetlinkPayload::Done(_) => return Ok(replies),
                        NetlinkPayload::Error(err) => {
                            return Err(IfmgrError::Netlink(format!(
                                "Kernel rejected dump request: {:?}",
                                err
                            )));
                        }
                        NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                        _ => {}
                    }
                    if msg_len == 0 {
                        break;
                    }
                    // Netlink messages are 4-byte aligned
                    offset = (offset + msg_len + 3) & !3;
                }
            }
        }
    }

    impl KernelSource for NetlinkChannel {
        #[instrument(skip(self))]
        fn drain(&mut self) -> Vec<KernelMessage> {
            let mut messages = Vec::new();
            let Some(socket) = self.socket.as_ref() else {
                self.reconnect();
                return messages;
            };

            loop {
                self.buffer.clear();
                match socket.recv(&mut self.buffer, libc::MSG_DONTWAIT) {
                    Ok(0) => break,
                    Ok(len) => match parse_buffer(&self.buffer[..len]) {
                        Ok(batch) => messages.extend(batch),
                        Err(e) => warn!(error = %e, "Dropping unparsable netlink datagram"),
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "Netlink receive failed, reconnecting");
                        self.reconnect();
                        return Vec::new();
                    }
                }
            }

            trace!(count = messages.len(), "Drained netlink messages");
            messages
        }

        fn take_reconnected(&mut self) -> bool {
            std::mem::take(&mut self.reconnected)
        }

        #[instrument(skip(self))]
        fn scan(&mut self) -> Result<Vec<ScannedLink>> {
            let links = self.dump(RouteNetlinkMessage::GetLink(LinkMessage::default()))?;
            let addrs = self.dump(RouteNetlinkMessage::GetAddress(AddressMessage::default()))?;

            let mut by_index: HashMap<u32, Vec<IfAddress>> = HashMap::new();
            for msg in &addrs {
                if let RouteNetlinkMessage::NewAddress(addr) = msg {
                    if let Some(info) = address_info(addr) {
                        by_index.entry(info.ifindex).or_default().push(info.address);
                    }
                }
            }

            let scanned: Vec<ScannedLink> = links
                .iter()
                .filter_map(|msg| match msg {
                    RouteNetlinkMessage::NewLink(link) => Some(link_info(link)),
                    _ => None,
                })
                .map(|link| {
                    let addresses = by_index.remove(&link.ifindex).unwrap_or_default();
                    ScannedLink::new(link, addresses)
                })
                .collect();

            debug!(links = scanned.len(), "Enumerated kernel links");
            Ok(scanned)
        }

        fn raw_fd(&self) -> i32 {
            self.socket.as_ref().map_or(-1, |s| s.as_raw_fd())
        }
    }

    /// Readiness registration for a kernel socket
    ///
    /// Holds a duplicate of the descriptor so the reactor never owns the
    /// channel's socket. A reconnect replaces that socket, so callers compare
    /// [`SocketReadiness::source_fd`] with the channel's current descriptor
    /// and re-register when they differ.
    pub struct SocketReadiness {
        inner: AsyncFd<OwnedFd>,
        source: RawFd,
    }

    impl SocketReadiness {
        pub fn new(fd: RawFd) -> Result<Self> {
            if fd < 0 {
                return Err(IfmgrError::Netlink("No socket to watch".to_string()));
            }
            // SAFETY: fd is open for the duration of the call; dup returns a
            // fresh descriptor that the OwnedFd then owns exclusively.
            let owned = unsafe {
                let new_fd = libc::dup(fd);
                if new_fd < 0 {
                    return Err(IfmgrError::Io(io::Error::last_os_error()));
                }
                OwnedFd::from_raw_fd(new_fd)
            };
            let inner = AsyncFd::new(owned)?;
            Ok(Self { inner, source: fd })
        }

        /// Descriptor this registration was created from
        pub fn source_fd(&self) -> RawFd {
            self.source
        }

        /// Wait until the socket has data to read
        ///
        /// Readiness is cleared before returning; the caller drains until
        /// EWOULDBLOCK so datagrams arriving mid-drain re-arm the next wakeup.
        pub async fn readable(&self) -> Result<()> {
            let mut guard = self.inner.readable().await?;
            guard.clear_ready();
            Ok(())
        }
    }

    /// Serialize a dump request (NLM_F_REQUEST | NLM_F_DUMP)
    pub fn dump_request(request: RouteNetlinkMessage, sequence: u32) -> Vec<u8> {
        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        header.sequence_number = sequence;

        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(request));
        packet.finalize();
        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        buf
    }

    fn open_subscription(config: &NetlinkConfig) -> Result<Socket> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| IfmgrError::Netlink(format!("Failed to create socket: {}", e)))?;
        socket
            .bind(&SocketAddr::new(0, NL_GROUPS))
            .map_err(|e| IfmgrError::Netlink(format!("Failed to bind socket: {}", e)))?;
        tune_socket(&socket, config.socket_rcvbuf);
        Ok(socket)
    }

    /// Enlarge the receive buffer so bursts of link events are not dropped
    fn tune_socket(socket: &Socket, rcvbuf: usize) {
        let fd = socket.as_raw_fd();
        let size = rcvbuf as libc::c_int;
        // SAFETY: fd is a valid open socket and size outlives the call.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!("Failed to set SO_RCVBUF, using default buffer size");
        } else {
            debug!(size = rcvbuf, "Set socket receive buffer");
        }
    }

    /// Parse one datagram into kernel messages
    pub fn parse_buffer(buffer: &[u8]) -> Result<Vec<KernelMessage>> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..])
                .map_err(|e| IfmgrError::Netlink(format!("Failed to parse message: {}", e)))?;
            let msg_len = msg.header.length as usize;
            let msg_type = msg.header.message_type;

            if let NetlinkPayload::InnerMessage(inner) = msg.payload {
                if let Some(parsed) = classify(inner, msg_type) {
                    messages.push(parsed);
                }
            }

            if msg_len == 0 {
                break;
            }
            offset = (offset + msg_len + 3) & !3;
        }

        Ok(messages)
    }

    fn classify(msg: RouteNetlinkMessage, msg_type: u16) -> Option<KernelMessage> {
        Some(match msg {
            RouteNetlinkMessage::NewLink(link) => KernelMessage::NewLink(link_info(&link)),
            RouteNetlinkMessage::DelLink(link) => KernelMessage::DelLink(link_info(&link)),
            RouteNetlinkMessage::NewAddress(addr) => {
                KernelMessage::NewAddress(address_info(&addr)?)
            }
            RouteNetlinkMessage::DelAddress(addr) => {
                KernelMessage::DelAddress(address_info(&addr)?)
            }
            _ => KernelMessage::Other(msg_type),
        })
    }

    /// Extract link attributes from an RTM_NEWLINK/RTM_DELLINK payload
    pub fn link_info(link: &LinkMessage) -> LinkInfo {
        let mut info = LinkInfo {
            ifindex: link.header.index,
            admin_up: link.header.flags.contains(LinkFlags::Up),
            carrier: link.header.flags.contains(LinkFlags::LowerUp),
            ..Default::default()
        };

        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => info.name = name.clone(),
                LinkAttribute::Address(bytes) if !bytes.is_empty() => {
                    info.hwaddr = Some(HwAddress::new(bytes.clone()));
                }
                LinkAttribute::Mtu(mtu) => info.mtu = Some(*mtu),
                LinkAttribute::Controller(master) => info.master = Some(*master),
                LinkAttribute::LinkInfo(infos) => {
                    info.link_kind = infos.iter().find_map(|i| match i {
                        NlLinkInfo::Kind(kind) => Some(kind.to_string()),
                        _ => None,
                    });
                }
                _ => {}
            }
        }

        info
    }

    /// Extract the interface address from an RTM_NEWADDR/RTM_DELADDR payload
    ///
    /// IFA_LOCAL is preferred since IFA_ADDRESS is the peer on point-to-point links.
    pub fn address_info(addr: &AddressMessage) -> Option<AddressInfo> {
        let mut local = None;
        let mut address = None;
        for attr in &addr.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Address(ip) => address = Some(*ip),
                _ => {}
            }
        }
        let ip = local.or(address)?;
        Some(AddressInfo::new(
            addr.header.index,
            IfAddress::new(ip, addr.header.prefix_len),
        ))
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Non-Linux platforms run against an in-memory kernel (development only)
#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::KernelSource;
    use super::mock::SimulatedKernel;
    use crate::config::NetlinkConfig;
    use crate::error::{IfmgrError, Result};
    use crate::types::{KernelMessage, ScannedLink};

    pub struct NetlinkChannel {
        inner: SimulatedKernel,
    }

    impl NetlinkChannel {
        pub fn new(_config: &NetlinkConfig) -> Result<Self> {
            tracing::warn!("Netlink unavailable on this platform, using simulated kernel");
            Ok(Self {
                inner: SimulatedKernel::new(),
            })
        }
    }

    /// Without a kernel socket there is nothing to wait on
    pub struct SocketReadiness {
        source: i32,
    }

    impl SocketReadiness {
        pub fn new(fd: i32) -> Result<Self> {
            Err(IfmgrError::Netlink(format!(
                "Readiness polling unsupported on this platform (fd {})",
                fd
            )))
        }

        pub fn source_fd(&self) -> i32 {
            self.source
        }

        pub async fn readable(&self) -> Result<()> {
            std::future::pending().await
        }
    }

    impl KernelSource for NetlinkChannel {
        fn drain(&mut self) -> Vec<KernelMessage> {
            self.inner.drain()
        }

        fn take_reconnected(&mut self) -> bool {
            self.inner.take_reconnected()
        }

        fn scan(&mut self) -> Result<Vec<ScannedLink>> {
            self.inner.scan()
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::*;

/// In-memory kernel used by tests and on platforms without netlink
pub mod mock {
    use super::KernelSource;
    use crate::error::{IfmgrError, Result};
    use crate::types::{AddressInfo, IfAddress, KernelMessage, LinkInfo, ScannedLink};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct SimState {
        links: BTreeMap<u32, ScannedLink>,
        pending: VecDeque<KernelMessage>,
        fail_next_drain: bool,
        fail_next_scan: bool,
        reconnected: bool,
        reconnects: usize,
        scans: usize,
    }

    /// Simulated kernel link table plus notification queue
    ///
    /// Clones share state, so a test can keep one handle to mutate the
    /// "kernel" while the manager owns another.
    #[derive(Debug, Default, Clone)]
    pub struct SimulatedKernel {
        state: Arc<Mutex<SimState>>,
    }

    impl SimulatedKernel {
        pub fn new() -> Self {
            Self::default()
        }

        /// Change the enumeration result without notifying
        pub fn set_link(&self, link: LinkInfo, addresses: Vec<IfAddress>) {
            self.state
                .lock()
                .links
                .insert(link.ifindex, ScannedLink::new(link, addresses));
        }

        /// Remove a link from the enumeration result without notifying
        pub fn unset_link(&self, ifindex: u32) {
            self.state.lock().links.remove(&ifindex);
        }

        /// Queue a notification without touching the enumeration result
        pub fn push(&self, msg: KernelMessage) {
            self.state.lock().pending.push_back(msg);
        }

        /// Kernel created or changed a link: update the table and notify
        pub fn link_added(&self, link: LinkInfo) {
            let mut state = self.state.lock();
            let addresses = state
                .links
                .get(&link.ifindex)
                .map(|s| s.addresses.clone())
                .unwrap_or_default();
            state
                .links
                .insert(link.ifindex, ScannedLink::new(link.clone(), addresses));
            state.pending.push_back(KernelMessage::NewLink(link));
        }

        /// Kernel removed a link: update the table and notify
        pub fn link_removed(&self, ifindex: u32) {
            let mut state = self.state.lock();
            let link = state
                .links
                .remove(&ifindex)
                .map(|s| s.link)
                .unwrap_or_else(|| LinkInfo::new(ifindex, ""));
            state.pending.push_back(KernelMessage::DelLink(link));
        }

        /// Kernel added an address: update the table and notify
        pub fn address_added(&self, ifindex: u32, address: IfAddress) {
            let mut state = self.state.lock();
            if let Some(scanned) = state.links.get_mut(&ifindex) {
                if !scanned.addresses.contains(&address) {
                    scanned.addresses.push(address);
                }
            }
            state
                .pending
                .push_back(KernelMessage::NewAddress(AddressInfo::new(ifindex, address)));
        }

        /// Kernel removed an address: update the table and notify
        pub fn address_removed(&self, ifindex: u32, address: IfAddress) {
            let mut state = self.state.lock();
            if let Some(scanned) = state.links.get_mut(&ifindex) {
                scanned.addresses.retain(|a| *a != address);
            }
            state
                .pending
                .push_back(KernelMessage::DelAddress(AddressInfo::new(ifindex, address)));
        }

        /// Make the next drain hit a socket error
        pub fn fail_next_drain(&self) {
            self.state.lock().fail_next_drain = true;
        }

        /// Make the next enumeration fail
        pub fn fail_next_scan(&self) {
            self.state.lock().fail_next_scan = true;
        }

        pub fn pending(&self) -> usize {
            self.state.lock().pending.len()
        }

        pub fn reconnects(&self) -> usize {
            self.state.lock().reconnects
        }

        pub fn scans(&self) -> usize {
            self.state.lock().scans
        }
    }

    impl KernelSource for SimulatedKernel {
        fn drain(&mut self) -> Vec<KernelMessage> {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_drain) {
                // Messages in flight at the moment of failure are lost
                state.pending.clear();
                state.reconnected = true;
                state.reconnects += 1;
                return Vec::new();
            }
            state.pending.drain(..).collect()
        }

        fn take_reconnected(&mut self) -> bool {
            std::mem::take(&mut self.state.lock().reconnected)
        }

        fn scan(&mut self) -> Result<Vec<ScannedLink>> {
            let mut state = self.state.lock();
            if std::mem::take(&mut state.fail_next_scan) {
                return Err(IfmgrError::Netlink("simulated dump failure".to_string()));
            }
            state.scans += 1;
            Ok(state.links.values().cloned().collect())
        }
    }
}
