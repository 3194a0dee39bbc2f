//! memory subsystem: hard/soft/swap limits, swappiness, oom control.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const MEMORY: &str = "memory";
const LIMIT: &str = "memory.limit_in_bytes";
const SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
const MEMSW_LIMIT: &str = "memory.memsw.limit_in_bytes";
const SWAPPINESS: &str = "memory.swappiness";
const OOM_CONTROL: &str = "memory.oom_control";
const KMEM_LIMIT: &str = "memory.kmem.limit_in_bytes";
const KMEM_TCP_LIMIT: &str = "memory.kmem.tcp.limit_in_bytes";

pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        MEMORY
    }

    fn root_name(&self) -> &'static str {
        MEMORY
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(MEMORY, cg_path)?;

        // Writing -1 resets a limit to unlimited; the kernel stores it as
        // i64::MAX rounded down to the page size.
        if let Some(limit) = r.memory_limit {
            write_value(&dir, LIMIT, &limit.to_string())?;
        }
        if let Some(soft) = r.memory_soft_limit {
            write_value(&dir, SOFT_LIMIT, &soft.to_string())?;
        }

        // Hosts without swap accounting have no memsw files; swap settings
        // are ignored there rather than failing the whole set.
        let memsw_supported = dir.join(MEMSW_LIMIT).exists();
        if memsw_supported {
            let swap = match (r.memory_limit, r.memory_swap_limit) {
                // Unlimited memory forces unlimited memory+swap.
                (Some(-1), _) => Some(-1),
                (_, swap) => swap,
            };
            if let Some(swap) = swap {
                write_value(&dir, MEMSW_LIMIT, &swap.to_string())?;
            }
        } else if r.memory_swap_limit.is_some() {
            tracing::debug!("host does not support memory.memsw, ignoring swap limit");
        }

        if let Some(swappiness) = r.memory_swappiness {
            write_value(&dir, SWAPPINESS, &swappiness.to_string())?;
        }
        if r.oom_kill_disable {
            write_value(&dir, OOM_CONTROL, "1")?;
        }
        if let Some(kmem) = r.kernel_memory_limit {
            write_value(&dir, KMEM_LIMIT, &kmem.to_string())?;
        }
        if let Some(kmem_tcp) = r.kernel_memory_tcp_limit {
            write_value(&dir, KMEM_TCP_LIMIT, &kmem_tcp.to_string())?;
        }

        Ok(())
    }
}
