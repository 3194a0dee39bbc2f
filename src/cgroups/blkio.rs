//! blkio subsystem: IO weights and per-device throttles.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem, ThrottleDevice};
use crate::errors::Result;

const BLKIO: &str = "blkio";
const WEIGHT: &str = "blkio.weight";
const LEAF_WEIGHT: &str = "blkio.leaf_weight";
const WEIGHT_DEVICE: &str = "blkio.weight_device";
const LEAF_WEIGHT_DEVICE: &str = "blkio.leaf_weight_device";
const THROTTLE_READ_BPS: &str = "blkio.throttle.read_bps_device";
const THROTTLE_WRITE_BPS: &str = "blkio.throttle.write_bps_device";
const THROTTLE_READ_IOPS: &str = "blkio.throttle.read_iops_device";
const THROTTLE_WRITE_IOPS: &str = "blkio.throttle.write_iops_device";

pub struct BlkioSubsystem;

impl Subsystem for BlkioSubsystem {
    fn name(&self) -> &'static str {
        BLKIO
    }

    fn root_name(&self) -> &'static str {
        BLKIO
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(BLKIO, cg_path)?;

        if let Some(weight) = r.blkio_weight {
            write_value(&dir, WEIGHT, &weight.to_string())?;
        }
        if let Some(weight) = r.blkio_leaf_weight {
            write_value(&dir, LEAF_WEIGHT, &weight.to_string())?;
        }

        for device in &r.blkio_weight_device {
            let line = format!("{}:{} {}", device.major, device.minor, device.weight);
            write_value(&dir, WEIGHT_DEVICE, &line)?;
        }
        for device in &r.blkio_leaf_weight_device {
            let line = format!("{}:{} {}", device.major, device.minor, device.weight);
            write_value(&dir, LEAF_WEIGHT_DEVICE, &line)?;
        }

        let throttles: [(&str, &[ThrottleDevice]); 4] = [
            (THROTTLE_READ_BPS, &r.blkio_throttle_read_bps_device),
            (THROTTLE_WRITE_BPS, &r.blkio_throttle_write_bps_device),
            (THROTTLE_READ_IOPS, &r.blkio_throttle_read_iops_device),
            (THROTTLE_WRITE_IOPS, &r.blkio_throttle_write_iops_device),
        ];
        for (file, devices) in throttles {
            for device in devices {
                let line = format!("{}:{} {}", device.major, device.minor, device.rate);
                write_value(&dir, file, &line)?;
            }
        }

        Ok(())
    }
}
