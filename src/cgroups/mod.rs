//! cgroup-v1 resource controller.
//!
//! A [`Subsystem`] plug-in exists for each v1 controller; the set is closed
//! and registered in [`CgroupManager::new`]. Every subsystem shares one
//! relative cgroup path per container (`mydocker/<uuid>`), joined onto
//! whatever mount point the host uses for that controller.

mod blkio;
mod cpu;
mod cpuset;
mod devices;
mod freezer;
pub mod hierarchy;
mod hugetlb;
mod memory;
mod net_cls;
mod net_prio;
mod pids;
mod resources;

pub use resources::{
    DeviceRule, Hugepage, IfPrioMap, ResourceOpts, Resources, ThrottleDevice, WeightDevice,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// One cgroup-v1 controller.
///
/// `root_name` is the kernel's mount name and may be composite
/// (`cpu,cpuacct`); `name` is the single controller this plug-in writes.
pub trait Subsystem {
    fn name(&self) -> &'static str;
    fn root_name(&self) -> &'static str;

    /// Write only the fields relevant to this controller.
    fn set(&self, cg_path: &str, resources: &Resources) -> Result<()>;

    fn apply(&self, cg_path: &str, pid: i32) -> Result<()> {
        hierarchy::apply(self.root_name(), cg_path, pid)
    }

    fn remove(&self, cg_path: &str) -> Result<()> {
        hierarchy::remove(self.root_name(), cg_path)
    }
}

/// Per-container cgroup descriptor: the shared relative path, the owning
/// pid (0 when not running) and the resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cgroups {
    pub pid: i32,
    pub path: String,
    pub resources: Resources,
}

impl Cgroups {
    pub fn new(path: String, resources: Resources) -> Self {
        Self {
            pid: 0,
            path,
            resources,
        }
    }
}

/// The closed set of subsystems, threaded through the runtime context.
pub struct CgroupManager {
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl Default for CgroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CgroupManager {
    pub fn new() -> Self {
        Self {
            subsystems: vec![
                Box::new(cpu::CpuSubsystem),
                Box::new(cpuset::CpusetSubsystem),
                Box::new(memory::MemorySubsystem),
                Box::new(blkio::BlkioSubsystem),
                Box::new(devices::DevicesSubsystem),
                Box::new(pids::PidsSubsystem),
                Box::new(net_cls::NetClsSubsystem),
                Box::new(net_prio::NetPrioSubsystem),
                Box::new(freezer::FreezerSubsystem),
                Box::new(hugetlb::HugetlbSubsystem),
            ],
        }
    }

    pub fn subsystems(&self) -> &[Box<dyn Subsystem>] {
        &self.subsystems
    }

    /// Write the resource record through every mounted subsystem.
    /// Per-subsystem failures here are fatal.
    pub fn set(&self, cg: &Cgroups) -> Result<()> {
        for subsystem in &self.subsystems {
            if !hierarchy::subsystem_mounted(subsystem.root_name()) {
                tracing::warn!("subsystem {} is not mounted", subsystem.name());
                continue;
            }
            subsystem.set(&cg.path, &cg.resources).map_err(|e| {
                Error::Cgroup(format!("failed to set subsystem {}: {e}", subsystem.name()))
            })?;
        }
        Ok(())
    }

    /// Place the container pid into every mounted subsystem.
    pub fn apply(&self, cg: &Cgroups) -> Result<()> {
        for subsystem in &self.subsystems {
            if !hierarchy::subsystem_mounted(subsystem.root_name()) {
                tracing::warn!("subsystem {} is not mounted", subsystem.name());
                continue;
            }
            subsystem.apply(&cg.path, cg.pid).map_err(|e| {
                Error::Cgroup(format!(
                    "failed to apply pid {} to subsystem {}: {e}",
                    cg.pid,
                    subsystem.name()
                ))
            })?;
        }
        Ok(())
    }

    /// Tear the container's cgroup directories down.
    ///
    /// The kernel needs a moment to process the exits before the directories
    /// become removable; per-subsystem failures are logged and swallowed.
    pub fn destroy(&self, cg: &Cgroups) {
        std::thread::sleep(Duration::from_millis(500));

        for subsystem in &self.subsystems {
            if !hierarchy::subsystem_mounted(subsystem.root_name()) {
                continue;
            }
            if let Err(e) = subsystem.remove(&cg.path) {
                tracing::debug!(
                    "failed to remove cgroup dir of subsystem {}: {e}",
                    subsystem.name()
                );
            }
        }
    }
}
