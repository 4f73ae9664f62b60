//! Network Interface State Manager for the test agent
//!
//! This crate keeps an in-memory registry of the host's network devices in
//! step with the kernel and reports device creation and removal to the
//! controller. State changes arrive as rtnetlink notifications; a full
//! re-enumeration corrects drift after lost notifications and runs before
//! every lookup.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AC-3 | Access Enforcement | Device creation requires CAP_NET_ADMIN |
//! | AU-12 | Audit Record Generation | Device created/deleted events |
//! | CM-3 | Configuration Change Control | Agent-created devices are marked managed |
//! | CM-8 | System Component Inventory | Authoritative device registry |
//! | SI-4 | System Monitoring | Real-time link and address monitoring |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +--------------------------+     +-------------+
//! |  Linux Kernel   |     |          ifmgrd          |     | Controller  |
//! |                 |     |                          |     |             |
//! |  RTM_NEWLINK    |---->|  NetlinkChannel          |     |             |
//! |  RTM_DELLINK    |     |       |                  |     |             |
//! |  RTM_NEWADDR    |     |       v                  |     |             |
//! |  RTM_DELADDR    |     |  InterfaceManager -------|---->| dev_created |
//! |                 |     |       |                  |     | dev_deleted |
//! |  link dumps     |<----|  DeviceRegistry          |     |             |
//! +-----------------+     +--------------------------+     +-------------+
//! ```

pub mod config;
pub mod device;
pub mod drivers;
pub mod error;
pub mod manager;
pub mod naming;
pub mod netlink;
pub mod notifier;
pub mod registry;
pub mod shell;
pub mod types;

pub use config::IfmgrConfig;
pub use device::{Device, DeviceHandle, DeviceKind};
pub use drivers::{DeviceArgs, DeviceClassRegistry, DeviceDriver, DeviceFactory, LinkFactory};
pub use error::{IfmgrError, Result};
pub use manager::{InterfaceManager, Transition};
pub use naming::{OvsInterfaceNames, ReservedNameSource, StaticReservedNames};
pub use netlink::{KernelSource, NetlinkChannel, SocketReadiness};
pub use notifier::{
    ChannelNotifier, ControllerEvent, ControllerNotifier, JsonLinesNotifier, MemoryNotifier,
};
pub use registry::DeviceRegistry;
pub use shell::{CommandRunner, ShellRunner};
pub use types::{HwAddress, IfAddress, KernelMessage, LinkInfo, ScannedLink};
