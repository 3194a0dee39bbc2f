//! pids subsystem: process-count limit.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const PIDS: &str = "pids";
const PIDS_MAX: &str = "pids.max";

pub struct PidsSubsystem;

impl Subsystem for PidsSubsystem {
    fn name(&self) -> &'static str {
        PIDS
    }

    fn root_name(&self) -> &'static str {
        PIDS
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(PIDS, cg_path)?;

        if let Some(max) = r.pids_max {
            write_value(&dir, PIDS_MAX, &max.to_string())?;
        }

        Ok(())
    }
}
