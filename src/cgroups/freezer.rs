//! freezer subsystem: freeze/thaw the whole cgroup.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const FREEZER: &str = "freezer";
const STATE: &str = "freezer.state";

const STATES: [&str; 2] = ["FROZEN", "THAWED"];

pub struct FreezerSubsystem;

impl Subsystem for FreezerSubsystem {
    fn name(&self) -> &'static str {
        FREEZER
    }

    fn root_name(&self) -> &'static str {
        FREEZER
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let Some(state) = &r.freezer_state else {
            return Ok(());
        };
        if !STATES.contains(&state.as_str()) {
            tracing::warn!("ignoring unknown freezer state {state:?}");
            return Ok(());
        }

        let dir = subsystem_path(FREEZER, cg_path)?;
        if !dir.join(STATE).exists() {
            // Hosts without CONFIG_CGROUP_FREEZER; skip silently.
            return Ok(());
        }
        write_value(&dir, STATE, state)
    }
}
