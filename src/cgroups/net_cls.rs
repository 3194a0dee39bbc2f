//! net_cls subsystem: packet class identifier.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const NET_CLS_ROOT: &str = "net_cls,net_prio";
const CLASSID: &str = "net_cls.classid";

pub struct NetClsSubsystem;

impl Subsystem for NetClsSubsystem {
    fn name(&self) -> &'static str {
        "net_cls"
    }

    fn root_name(&self) -> &'static str {
        NET_CLS_ROOT
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        let dir = subsystem_path(NET_CLS_ROOT, cg_path)?;

        if let Some(classid) = r.net_cls_classid {
            write_value(&dir, CLASSID, &classid.to_string())?;
        }

        Ok(())
    }
}
