//! net_prio subsystem: per-interface egress priority.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const NET_PRIO_ROOT: &str = "net_cls,net_prio";
const IFPRIOMAP: &str = "net_prio.ifpriomap";

pub struct NetPrioSubsystem;

impl Subsystem for NetPrioSubsystem {
    fn name(&self) -> &'static str {
        "net_prio"
    }

    fn root_name(&self) -> &'static str {
        NET_PRIO_ROOT
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(NET_PRIO_ROOT, cg_path)?;

        for map in &r.net_prio_ifpriomap {
            let line = format!("{} {}", map.interface, map.priority);
            write_value(&dir, IFPRIOMAP, &line)?;
        }

        Ok(())
    }
}
