//! Directory enumeration: the container set is whatever lives under
//! `<containers-dir>/*/config.json`.

use super::{Container, Status};
use crate::errors::{Error, Result};
use crate::runtime::{Layout, CONFIG_NAME};
use crate::store;
use crate::util;

/// Load every container record, reconciling stale pids: a stored pid with
/// no `/proc/<pid>` means the process died behind our back, so the record
/// is rewritten as stopped.
pub fn all_containers(layout: &Layout) -> Result<Vec<Container>> {
    let containers_dir = layout.containers_dir();
    if !containers_dir.exists() {
        std::fs::create_dir_all(&containers_dir)?;
        return Ok(Vec::new());
    }

    let mut containers = Vec::new();
    for entry in std::fs::read_dir(&containers_dir)? {
        let config = entry?.path().join(CONFIG_NAME);
        let loaded = match store::load::<Container>(&config) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(config = %config.display(), "failed to load container: {e}");
                continue;
            }
        };
        containers.push(reconcile(loaded)?);
    }

    containers.sort_by(|a, b| a.created.cmp(&b.created));
    Ok(containers)
}

fn reconcile(mut c: Container) -> Result<Container> {
    if c.cgroups.pid > 0 && !util::is_process_alive(c.cgroups.pid) {
        tracing::debug!(container = %c.uuid, pid = c.cgroups.pid, "process is gone");
        c.cgroups.pid = 0;
        c.status = Status::Stopped;
        c.dump()?;
    }
    Ok(c)
}

/// Linear scan by human name or uuid.
pub fn get_container(layout: &Layout, identifier: &str) -> Result<Container> {
    all_containers(layout)?
        .into_iter()
        .find(|c| c.name == identifier || c.uuid == identifier)
        .ok_or_else(|| Error::not_found("container", identifier))
}
