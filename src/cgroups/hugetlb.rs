//! hugetlb subsystem: per-pagesize hugepage byte limits.

use super::hierarchy::{subsystem_path, write_value};
use super::{Resources, Subsystem};
use crate::errors::Result;

const HUGETLB: &str = "hugetlb";

pub struct HugetlbSubsystem;

impl Subsystem for HugetlbSubsystem {
    fn name(&self) -> &'static str {
        HUGETLB
    }

    fn root_name(&self) -> &'static str {
        HUGETLB
    }

    fn set(&self, cg_path: &str, r: &Resources) -> Result<()> {
        if r.hugepages_limit.is_empty() {
            return Ok(());
        }

        let dir = subsystem_path(HUGETLB, cg_path)?;
        for hugepage in &r.hugepages_limit {
            let file = format!("hugetlb.{}.limit_in_bytes", hugepage.page_size);
            if !dir.join(&file).exists() {
                tracing::warn!("host does not support hugepage size {}", hugepage.page_size);
                continue;
            }
            write_value(&dir, &file, &hugepage.limit.to_string())?;
        }

        Ok(())
    }
}
