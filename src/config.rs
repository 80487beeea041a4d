//! Construction-time configuration: run settings and resource topology.
//!
//! A `SystemConfig` is supplied once per run and is immutable for the
//! run's duration. CPU 0 (the virtual CPU) and bus 0 (the virtual bus) are
//! implicit and never appear in the lists.

use std::collections::BTreeSet;

use crate::error::{SchedError, SchedResult};

/// Which scheduling policy a CPU uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "snake_case"))]
pub enum PolicyKind {
    /// First-come-first-served with a fixed timeslice.
    #[default]
    Fcfs,
    /// Highest priority first, optional slice jitter.
    FixedPriority,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::Fcfs => write!(f, "FCFS"),
            PolicyKind::FixedPriority => write!(f, "FP"),
        }
    }
}

/// Run-wide scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct RtSettings {
    /// Charge simulated cycles per step. When off, each step advances the
    /// clock by `nominal_step` instead.
    pub realtime: bool,
    /// Cycles charged for one step on a non-virtual CPU.
    pub step_cycles: u64,
    /// Clock ticks per step when `realtime` is off.
    pub nominal_step: u64,
    /// Steps per slice under FCFS (and the FP default).
    pub fcfs_timeslice: u64,
    /// Steps per slice on the virtual CPU.
    pub virtual_timeslice: u64,
    /// Maximum +/- perturbation of a fixed-priority slice, in steps.
    pub jitter: u64,
    /// Seed for the jitter generator; equal seeds give equal traces.
    pub seed: u64,
}

impl Default for RtSettings {
    fn default() -> Self {
        RtSettings {
            realtime: true,
            step_cycles: 2,
            nominal_step: 1,
            fcfs_timeslice: 10,
            virtual_timeslice: 10_000,
            jitter: 0,
            seed: 0,
        }
    }
}

/// One processing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuConfig {
    pub name: String,
    /// Clock speed in cycles per second.
    pub speed_hz: u64,
    #[cfg_attr(feature = "serialize", serde(default))]
    pub policy: PolicyKind,
}

impl CpuConfig {
    pub fn new(name: impl Into<String>, speed_hz: u64, policy: PolicyKind) -> Self {
        CpuConfig {
            name: name.into(),
            speed_hz,
            policy,
        }
    }
}

/// One transport resource.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BusConfig {
    pub name: String,
    /// Bandwidth in bytes per second.
    pub speed: u64,
    /// Names of the connected CPUs.
    pub cpus: Vec<String>,
}

impl BusConfig {
    pub fn new(name: impl Into<String>, speed: u64, cpus: &[&str]) -> Self {
        BusConfig {
            name: name.into(),
            speed,
            cpus: cpus.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Full topology plus settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct SystemConfig {
    pub settings: RtSettings,
    pub cpus: Vec<CpuConfig>,
    pub buses: Vec<BusConfig>,
}

impl SystemConfig {
    /// Check names and speeds before any resource is built.
    pub fn validate(&self) -> SchedResult<()> {
        let mut names = BTreeSet::new();
        names.insert("vCPU");
        for cpu in &self.cpus {
            if cpu.speed_hz == 0 {
                return Err(SchedError::Config(format!("CPU {} has zero speed", cpu.name)));
            }
            if !names.insert(cpu.name.as_str()) {
                return Err(SchedError::Config(format!("duplicate CPU name {}", cpu.name)));
            }
        }
        let mut bus_names = BTreeSet::new();
        for bus in &self.buses {
            if bus.speed == 0 {
                return Err(SchedError::Config(format!("bus {} has zero speed", bus.name)));
            }
            if !bus_names.insert(bus.name.as_str()) {
                return Err(SchedError::Config(format!("duplicate bus name {}", bus.name)));
            }
            if bus.cpus.len() < 2 {
                return Err(SchedError::Config(format!(
                    "bus {} must connect at least two CPUs",
                    bus.name
                )));
            }
            if let Some(missing) = bus.cpus.iter().find(|c| !names.contains(c.as_str())) {
                return Err(SchedError::Config(format!(
                    "bus {} connects unknown CPU {}",
                    bus.name, missing
                )));
            }
        }
        if self.settings.fcfs_timeslice == 0 || self.settings.virtual_timeslice == 0 {
            return Err(SchedError::Config("timeslices must be positive".into()));
        }
        Ok(())
    }

    /// Parse a TOML topology description.
    #[cfg(feature = "serialize")]
    pub fn from_toml_str(text: &str) -> SchedResult<Self> {
        let config: SystemConfig =
            toml::from_str(text).map_err(|e| SchedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
