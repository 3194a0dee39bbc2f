//! cpu subsystem: CFS and real-time scheduler budgets, shares.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const CPU: &str = "cpu,cpuacct";
const CFS_PERIOD: &str = "cpu.cfs_period_us";
const CFS_QUOTA: &str = "cpu.cfs_quota_us";
const RT_PERIOD: &str = "cpu.rt_period_us";
const RT_RUNTIME: &str = "cpu.rt_runtime_us";
const SHARES: &str = "cpu.shares";

pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn root_name(&self) -> &'static str {
        CPU
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(CPU, cg_path)?;

        // Kernels built without CONFIG_RT_GROUP_SCHED have no cpu.rt_* files.
        let rt_supported = dir.join(RT_PERIOD).exists();
        if !rt_supported && (r.cpu_rt_period.is_some() || r.cpu_rt_runtime.is_some()) {
            tracing::debug!("host does not support cpu.rt_*, skipping");
        }

        if let Some(period) = r.cpu_cfs_period {
            write_value(&dir, CFS_PERIOD, &period.to_string())?;
        }
        if let Some(quota) = r.cpu_cfs_quota {
            write_value(&dir, CFS_QUOTA, &quota.to_string())?;
        }
        if rt_supported {
            if let Some(rt_period) = r.cpu_rt_period {
                write_value(&dir, RT_PERIOD, &rt_period.to_string())?;
            }
            if let Some(rt_runtime) = r.cpu_rt_runtime {
                write_value(&dir, RT_RUNTIME, &rt_runtime.to_string())?;
            }
        }
        if let Some(shares) = r.cpu_shares {
            write_value(&dir, SHARES, &shares.to_string())?;
        }

        Ok(())
    }
}
