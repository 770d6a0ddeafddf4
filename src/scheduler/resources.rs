use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of resource a worker advertises and a task requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// CPU in millicores
    Cpu,
    /// Memory in MiB
    Memory,
    /// Whole accelerator devices
    Gpu,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::Gpu];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "memory" | "mem" => Ok(ResourceKind::Memory),
            "gpu" => Ok(ResourceKind::Gpu),
            other => Err(format!("unknown resource kind '{}'", other)),
        }
    }
}

/// Amounts keyed by resource kind. Kinds that are absent count as zero.
///
/// Workers are heterogeneous only through the kinds they advertise: a task
/// asking for a GPU can only land on a worker whose capacity lists one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<(ResourceKind, u64)>", from = "Vec<(ResourceKind, u64)>")]
pub struct Resources(BTreeMap<ResourceKind, u64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter. A zero amount removes the kind.
    pub fn with(mut self, kind: ResourceKind, amount: u64) -> Self {
        self.set(kind, amount);
        self
    }

    pub fn set(&mut self, kind: ResourceKind, amount: u64) {
        if amount == 0 {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, amount);
        }
    }

    pub fn get(&self, kind: ResourceKind) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every requested kind is available in at least the requested amount.
    pub fn covers(&self, request: &Resources) -> bool {
        request.iter().all(|(kind, amount)| self.get(kind) >= amount)
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut out = Resources::new();
        for (kind, amount) in self.iter() {
            out.set(kind, amount.saturating_sub(other.get(kind)));
        }
        out
    }

    pub fn accumulate(&mut self, other: &Resources) {
        for (kind, amount) in other.iter() {
            let total = self.get(kind).saturating_add(amount);
            self.set(kind, total);
        }
    }

    /// Idle score of `self` (spare) relative to `capacity`: the per-mille of
    /// each advertised kind that is still free, averaged over those kinds.
    /// Advertising more kinds does not raise the score.
    pub fn idle_score(&self, capacity: &Resources) -> u64 {
        let kinds = capacity.0.len() as u64;
        if kinds == 0 {
            return 0;
        }
        let sum: u64 = capacity
            .iter()
            .map(|(kind, total)| self.get(kind).min(total).saturating_mul(1000) / total)
            .sum();
        sum / kinds
    }
}

impl From<Vec<(ResourceKind, u64)>> for Resources {
    fn from(pairs: Vec<(ResourceKind, u64)>) -> Self {
        let mut out = Resources::new();
        for (kind, amount) in pairs {
            out.set(kind, amount);
        }
        out
    }
}

impl From<Resources> for Vec<(ResourceKind, u64)> {
    fn from(resources: Resources) -> Self {
        resources.0.into_iter().collect()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Parses `cpu=2000,memory=512,gpu=1`. The empty string is no resources.
impl FromStr for Resources {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Resources::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (kind, amount) = part
                .split_once('=')
                .ok_or_else(|| format!("expected kind=amount, got '{}'", part))?;
            let kind: ResourceKind = kind.parse()?;
            let amount: u64 = amount
                .trim()
                .parse()
                .map_err(|_| format!("invalid amount in '{}'", part))?;
            out.set(kind, amount);
        }
        Ok(out)
    }
}
