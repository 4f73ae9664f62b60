//! Collision-free device name allocation
//!
//! Candidates are `prefix0`, `prefix1`, ... probed in order. A name is taken
//! if a live device carries it or the virtual switch holds it. The switch's
//! name set is fetched once per allocation request, not per candidate.

use crate::error::Result;
use crate::shell::{CommandRunner, OVS_VSCTL_CMD};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Matches `name : "ovsbr0"` lines of `ovs-vsctl list` output
static OVS_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#".*: "(.*)""#).expect("Invalid regex pattern"));

/// Source of names held outside the kernel device table
#[async_trait]
pub trait ReservedNameSource: Send + Sync {
    async fn reserved_names(&self) -> Result<HashSet<String>>;
}

/// Interface names known to Open vSwitch
pub struct OvsInterfaceNames {
    runner: Arc<dyn CommandRunner>,
    command: String,
}

impl OvsInterfaceNames {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_binary(runner, OVS_VSCTL_CMD)
    }

    pub fn with_binary(runner: Arc<dyn CommandRunner>, binary: &str) -> Self {
        Self {
            runner,
            command: format!("{} --columns=name list Interface", binary),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl ReservedNameSource for OvsInterfaceNames {
    async fn reserved_names(&self) -> Result<HashSet<String>> {
        // Hosts without OVS are normal; treat any failure as "nothing reserved"
        let output = match self.runner.run(&self.command).await {
            Ok(result) => result.stdout,
            Err(e) => {
                warn!(error = %e, "Failed to query ovs-vsctl, assuming no reserved names");
                return Ok(HashSet::new());
            }
        };
        let names = parse_ovs_names(&output);
        debug!(count = names.len(), "Fetched OVS interface names");
        Ok(names)
    }
}

/// Fixed set of reserved names
#[derive(Debug, Clone, Default)]
pub struct StaticReservedNames(pub HashSet<String>);

impl StaticReservedNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ReservedNameSource for StaticReservedNames {
    async fn reserved_names(&self) -> Result<HashSet<String>> {
        Ok(self.0.clone())
    }
}

/// Extract the quoted name tokens of `ovs-vsctl --columns=name list` output
pub fn parse_ovs_names(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| OVS_NAME_RE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Smallest `n >= start` such that `prefix{n}` is not in use
pub fn first_free_index<F>(prefix: &str, start: usize, is_used: F) -> usize
where
    F: Fn(&str) -> bool,
{
    (start..)
        .find(|n| !is_used(&format!("{}{}", prefix, n)))
        .unwrap_or(start)
}
