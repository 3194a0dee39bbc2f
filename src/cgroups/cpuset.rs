//! cpuset subsystem: CPU and memory-node placement.

use std::fs;
use std::path::Path;

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const CPUSET: &str = "cpuset";
const CPUS: &str = "cpuset.cpus";
const MEMS: &str = "cpuset.mems";

pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        CPUSET
    }

    fn root_name(&self) -> &'static str {
        CPUSET
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(CPUSET, cg_path)?;

        // cpuset.cpus and cpuset.mems must hold a value before any pid can
        // enter cgroup.procs; new directories start empty, so seed every
        // level from its parent first.
        if let Some(parent) = dir.parent() {
            copy_from_parent(parent)?;
        }
        copy_from_parent(&dir)?;

        if let Some(cpus) = &r.cpuset_cpus {
            write_value(&dir, CPUS, cpus)?;
        }
        if let Some(mems) = &r.cpuset_mems {
            write_value(&dir, MEMS, mems)?;
        }

        Ok(())
    }
}

fn copy_from_parent(dir: &Path) -> Result<()> {
    let Some(parent) = dir.parent() else {
        return Ok(());
    };
    for file in [CPUS, MEMS] {
        let value = fs::read_to_string(parent.join(file))?;
        fs::write(dir.join(file), value)?;
    }
    Ok(())
}
