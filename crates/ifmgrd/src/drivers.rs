//! Device kinds: constructor arguments, factories and kernel-level creation
//!
//! Each [`DeviceKind`] has a factory that validates constructor arguments and
//! builds a [`DeviceDriver`]. The driver owns the kind-specific behavior; the
//! only kernel-level action here is creating the link with `ip link add`.

use crate::device::DeviceKind;
use crate::error::{IfmgrError, Result};
use crate::shell::{CommandRunner, IP_CMD, shellquote};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// Constructor arguments for a device creation request
///
/// Arguments may be given by position or by name; a named value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceArgs {
    positional: Vec<String>,
    named: BTreeMap<String, String>,
}

impl DeviceArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            positional: args.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Look up an argument by name, falling back to its position
    pub fn get(&self, key: &str, position: usize) -> Option<&str> {
        self.named
            .get(key)
            .or_else(|| self.positional.get(position))
            .map(String::as_str)
    }

    /// Like [`DeviceArgs::get`] but a missing value is a configuration error
    pub fn require(&self, key: &str, position: usize) -> Result<&str> {
        self.get(key, position)
            .ok_or_else(|| IfmgrError::Configuration(format!("{} is a mandatory argument", key)))
    }
}

/// Kind-specific parameters of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// Pre-existing interface; creation only binds by name
    Generic,
    Dummy,
    Bridge,
    Bond { mode: Option<String> },
    Vlan { realdev: String, vlan_tci: u16 },
    Veth { peer: String },
    MacVlan { realdev: String, mode: Option<String> },
}

impl LinkSpec {
    pub fn kind(&self) -> DeviceKind {
        match self {
            LinkSpec::Generic => DeviceKind::Generic,
            LinkSpec::Dummy => DeviceKind::Dummy,
            LinkSpec::Bridge => DeviceKind::Bridge,
            LinkSpec::Bond { .. } => DeviceKind::Bond,
            LinkSpec::Vlan { .. } => DeviceKind::Vlan,
            LinkSpec::Veth { .. } => DeviceKind::Veth,
            LinkSpec::MacVlan { .. } => DeviceKind::MacVlan,
        }
    }

    /// Parse the kind-specific arguments
    fn from_args(kind: DeviceKind, args: &DeviceArgs) -> Result<Self> {
        Ok(match kind {
            DeviceKind::Generic => LinkSpec::Generic,
            DeviceKind::Dummy => LinkSpec::Dummy,
            DeviceKind::Bridge => LinkSpec::Bridge,
            DeviceKind::Bond => LinkSpec::Bond {
                mode: args.get("mode", 1).map(str::to_string),
            },
            DeviceKind::Vlan => {
                let realdev = args.require("realdev", 1)?.to_string();
                let raw = args.require("vlan_tci", 2)?;
                let vlan_tci = raw
                    .parse::<u16>()
                    .ok()
                    .filter(|id| *id < 4095)
                    .ok_or_else(|| {
                        IfmgrError::Configuration(format!("invalid vlan_tci {}", raw))
                    })?;
                LinkSpec::Vlan { realdev, vlan_tci }
            }
            DeviceKind::Veth => LinkSpec::Veth {
                peer: args.require("peer", 1)?.to_string(),
            },
            DeviceKind::MacVlan => LinkSpec::MacVlan {
                realdev: args.require("realdev", 1)?.to_string(),
                mode: args.get("mode", 2).map(str::to_string),
            },
        })
    }

    /// `ip link add` command line creating this link, None when nothing is created
    pub fn create_command(&self, name: &str) -> Option<String> {
        let name = shellquote(name);
        let cmd = match self {
            LinkSpec::Generic => return None,
            LinkSpec::Dummy => format!("{} link add name {} type dummy", IP_CMD, name),
            LinkSpec::Bridge => format!("{} link add name {} type bridge", IP_CMD, name),
            LinkSpec::Bond { mode } => match mode {
                Some(mode) => format!(
                    "{} link add name {} type bond mode {}",
                    IP_CMD,
                    name,
                    shellquote(mode)
                ),
                None => format!("{} link add name {} type bond", IP_CMD, name),
            },
            LinkSpec::Vlan { realdev, vlan_tci } => format!(
                "{} link add link {} name {} type vlan id {}",
                IP_CMD,
                shellquote(realdev),
                name,
                vlan_tci
            ),
            LinkSpec::Veth { peer } => format!(
                "{} link add name {} type veth peer name {}",
                IP_CMD,
                name,
                shellquote(peer)
            ),
            LinkSpec::MacVlan { realdev, mode } => {
                let mut cmd = format!(
                    "{} link add link {} name {} type macvlan",
                    IP_CMD,
                    shellquote(realdev),
                    name
                );
                if let Some(mode) = mode {
                    cmd.push_str(&format!(" mode {}", shellquote(mode)));
                }
                cmd
            }
        };
        Some(cmd)
    }
}

/// Behavior owned by one device kind
#[async_trait]
pub trait DeviceDriver: fmt::Debug + Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Name the kernel link is expected to appear under
    fn name(&self) -> &str;

    /// Create the kernel-level device
    async fn create(&self, runner: &dyn CommandRunner) -> Result<()>;

    /// Add kind-specific attributes to the device snapshot
    fn describe(&self, _snapshot: &mut Map<String, Value>) {}
}

/// Driver for every built-in kind, created through `ip link add`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDriver {
    name: String,
    spec: LinkSpec,
}

impl LinkDriver {
    pub fn new(name: impl Into<String>, spec: LinkSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    pub fn spec(&self) -> &LinkSpec {
        &self.spec
    }
}

#[async_trait]
impl DeviceDriver for LinkDriver {
    fn kind(&self) -> DeviceKind {
        self.spec.kind()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, runner: &dyn CommandRunner) -> Result<()> {
        let Some(cmd) = self.spec.create_command(&self.name) else {
            debug!(name = %self.name, "Nothing to create for generic device");
            return Ok(());
        };
        runner.run_checked(&cmd).await?;
        info!(name = %self.name, kind = %self.kind(), "Created kernel device");
        Ok(())
    }

    fn describe(&self, snapshot: &mut Map<String, Value>) {
        match &self.spec {
            LinkSpec::Generic | LinkSpec::Dummy | LinkSpec::Bridge => {}
            LinkSpec::Bond { mode } => {
                if let Some(mode) = mode {
                    snapshot.insert("mode".into(), Value::from(mode.clone()));
                }
            }
            LinkSpec::Vlan { realdev, vlan_tci } => {
                snapshot.insert("realdev".into(), Value::from(realdev.clone()));
                snapshot.insert("vlan_tci".into(), Value::from(*vlan_tci));
            }
            LinkSpec::Veth { peer } => {
                snapshot.insert("peer".into(), Value::from(peer.clone()));
            }
            LinkSpec::MacVlan { realdev, mode } => {
                snapshot.insert("realdev".into(), Value::from(realdev.clone()));
                if let Some(mode) = mode {
                    snapshot.insert("mode".into(), Value::from(mode.clone()));
                }
            }
        }
    }
}

/// Builds drivers for one device kind
pub trait DeviceFactory: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Validate constructor arguments and build the driver
    fn build(&self, args: &DeviceArgs) -> Result<Box<dyn DeviceDriver>>;
}

/// Factory for the built-in kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFactory(pub DeviceKind);

impl DeviceFactory for LinkFactory {
    fn kind(&self) -> DeviceKind {
        self.0
    }

    fn build(&self, args: &DeviceArgs) -> Result<Box<dyn DeviceDriver>> {
        let name = args.require("name", 0)?.to_string();
        let spec = LinkSpec::from_args(self.0, args)?;
        Ok(Box::new(LinkDriver::new(name, spec)))
    }
}

/// Kind to factory mapping
#[derive(Default)]
pub struct DeviceClassRegistry {
    factories: HashMap<DeviceKind, Box<dyn DeviceFactory>>,
}

impl DeviceClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a [`LinkFactory`] for every built-in kind
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in DeviceKind::ALL {
            registry.factories.insert(kind, Box::new(LinkFactory(kind)));
        }
        registry
    }

    /// Register a factory; a second factory for the same kind is rejected
    pub fn add(&mut self, factory: Box<dyn DeviceFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(&kind) {
            return Err(IfmgrError::Configuration(format!(
                "Device class name conflict {}",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.factories.clear();
    }

    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Resolve the kind and build its driver
    pub fn build(&self, kind: DeviceKind, args: &DeviceArgs) -> Result<Box<dyn DeviceDriver>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            IfmgrError::Configuration(format!("No device class registered for {}", kind))
        })?;
        factory.build(args)
    }
}
