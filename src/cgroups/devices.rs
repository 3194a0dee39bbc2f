//! devices subsystem: device access allow/deny lists.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const DEVICES: &str = "devices";
const ALLOW: &str = "devices.allow";
const DENY: &str = "devices.deny";

pub struct DevicesSubsystem;

impl Subsystem for DevicesSubsystem {
    fn name(&self) -> &'static str {
        DEVICES
    }

    fn root_name(&self) -> &'static str {
        DEVICES
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(DEVICES, cg_path)?;

        for rule in &r.devices {
            let file = if rule.allow { ALLOW } else { DENY };
            let line = format!(
                "{} {}:{} {}",
                rule.dev_type, rule.major, rule.minor, rule.access
            );
            write_value(&dir, file, &line)?;
        }

        Ok(())
    }
}
