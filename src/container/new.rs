//! `run` validation: everything that must hold before any kernel state
//! changes.

use std::collections::BTreeMap;
use std::net::TcpListener;

use chrono::Utc;

use super::{scan, Container, Rootfs, Status, MYDOCKER};
use crate::cgroups::{Cgroups, Resources};
use crate::errors::{Error, Result};
use crate::network::{self, Endpoint};
use crate::runtime::Runtime;
use crate::util;

/// Validated-input bundle for creating a container; the CLI translates its
/// flags into this.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub detach: bool,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub dns: Vec<String>,
    pub image: String,
    /// Command vector; empty means "use the image's default".
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub publish: Vec<String>,
    pub storage_driver: String,
    pub resources: Resources,
}

/// Validate a [`RunSpec`] into a `creating` container with a config
/// snapshot on disk. IPs are reserved and the image refcount bumped here;
/// nothing else in the kernel is touched yet.
pub fn new_container(rt: &mut Runtime, spec: RunSpec) -> Result<Container> {
    let name = spec.name.clone().unwrap_or_else(util::random_name);
    if scan::get_container(&rt.layout, &name).is_ok() {
        return Err(Error::Conflict(format!("the container name {name} already exists")));
    }
    let uuid = util::sha256_hex(&name)[..12].to_string();

    let image = rt.images.get_by_name_or_uuid(&spec.image)?.clone();
    let image_dir = rt.images.root_dir(&image);

    let mut commands = image.entrypoint.clone();
    if !spec.args.is_empty() {
        commands.extend(spec.args.iter().cloned());
    } else {
        commands.extend(image.command.iter().cloned());
    }
    if commands.is_empty() {
        return Err(Error::Validation("missing container command".into()));
    }

    let driver_name = {
        let driver = rt.storage_driver(&spec.storage_driver)?;
        if !driver.allowed() {
            return Err(Error::Validation(format!(
                "the storage driver {} is not usable on this host",
                driver.name()
            )));
        }
        driver.name().to_string()
    };

    let container_dir = rt.layout.container_dir(&uuid);
    let rootfs = Rootfs {
        container_dir: container_dir.clone(),
        image_dir,
        write_dir: container_dir.join("diff"),
        merge_dir: container_dir.join("merged"),
    };

    let volumes = parse_volumes(&spec.volumes)?;
    let envs = parse_envs(&image.envs, &spec.envs)?;

    let existing = scan::all_containers(&rt.layout)?;
    let ports = parse_ports(&spec.publish, &existing)?;

    let endpoints = create_endpoints(rt, &name, &spec.networks, &ports)?;

    rt.images.change_counts(&spec.image, 1)?;

    let container = Container {
        detach: spec.detach,
        hostname: spec.hostname.clone().unwrap_or_else(|| name.clone()),
        uuid: uuid.clone(),
        name,
        dns: spec.dns.clone(),
        image: spec.image.clone(),
        commands,
        status: Status::Creating,
        storage_driver: driver_name,
        rootfs,
        volumes,
        envs,
        ports,
        endpoints,
        cgroups: Cgroups::new(format!("{MYDOCKER}/{uuid}"), spec.resources),
        created: Utc::now(),
    };

    container.dump()?;
    Ok(container)
}

/// `-v /src:/dst`; the source is deduped against trailing slashes.
fn parse_volumes(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut volumes = BTreeMap::new();
    for arg in args {
        let (source, inner) = arg
            .split_once(':')
            .filter(|(src, dst)| !src.is_empty() && !dst.is_empty())
            .ok_or_else(|| {
                Error::Validation(format!("the argument of -v should be '/src:/dst', got {arg:?}"))
            })?;
        if !source.starts_with('/') || !inner.starts_with('/') {
            return Err(Error::Validation(format!(
                "volume paths must be absolute, got {arg:?}"
            )));
        }
        let source = source.trim_end_matches('/');
        volumes.insert(source.to_string(), inner.to_string());
    }
    Ok(volumes)
}

/// `-e key=value`; image-declared environment first so flags override it.
fn parse_envs(image_envs: &[String], flag_envs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut envs = BTreeMap::new();
    for arg in image_envs.iter().chain(flag_envs) {
        // The value may itself contain '='.
        let (key, value) = arg.split_once('=').filter(|(k, _)| !k.is_empty()).ok_or_else(
            || Error::Validation(format!("the argument of -e should be 'key=value', got {arg:?}")),
        )?;
        envs.insert(key.to_string(), value.to_string());
    }
    Ok(envs)
}

/// One `-p out:in` flag, host port first.
pub fn parse_port_mapping(arg: &str) -> Result<(u16, u16)> {
    let bad = || {
        Error::Validation(format!(
            "the argument of -p should be 'out:in' with ports in [0, 65535], got {arg:?}"
        ))
    };
    let (out_port, in_port) = arg.split_once(':').ok_or_else(bad)?;
    let out_port: u16 = out_port.trim().parse().map_err(|_| bad())?;
    let in_port: u16 = in_port.trim().parse().map_err(|_| bad())?;
    Ok((out_port, in_port))
}

fn parse_ports(args: &[String], existing: &[Container]) -> Result<BTreeMap<u16, u16>> {
    let mut ports = BTreeMap::new();
    for arg in args {
        let (out_port, in_port) = parse_port_mapping(arg)?;

        // Bind-probe the host port, then cross-check every other
        // container's declared ports: a stopped container still owns its
        // published ports.
        let probe = TcpListener::bind(("0.0.0.0", out_port)).map_err(|_| {
            Error::Conflict(format!("the host port {out_port} is already in use"))
        })?;
        drop(probe);

        for other in existing {
            if other.ports.contains_key(&out_port) {
                return Err(Error::Conflict(format!(
                    "the host port {out_port} is already published by container {}",
                    other.name
                )));
            }
        }

        ports.insert(out_port, in_port);
    }
    Ok(ports)
}

/// Reserve one IP per requested network. `--net none` disables networking
/// entirely; no flag at all lands the container on the default network.
fn create_endpoints(
    rt: &mut Runtime,
    container_name: &str,
    networks: &[String],
    ports: &BTreeMap<u16, u16>,
) -> Result<Vec<Endpoint>> {
    let requested: Vec<String> = if networks.is_empty() {
        vec![network::DEFAULT_NETWORK.to_string()]
    } else {
        networks.to_vec()
    };
    let mut names: Vec<String> = Vec::new();
    for name in requested {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    if names.iter().any(|n| n == "none") {
        return Ok(Vec::new());
    }

    let mut endpoints: Vec<Endpoint> = Vec::new();
    for name in &names {
        let nw = match rt.networks.get(name) {
            Ok(nw) => nw.clone(),
            Err(e) => {
                release_endpoints(rt, &endpoints);
                return Err(e);
            }
        };
        let ip = match rt.networks.allocate_ip(name) {
            Ok(ip) => ip,
            Err(e) => {
                release_endpoints(rt, &endpoints);
                return Err(e);
            }
        };
        endpoints.push(Endpoint::new(container_name, &nw, ip, ports.clone()));
    }
    Ok(endpoints)
}

fn release_endpoints(rt: &mut Runtime, endpoints: &[Endpoint]) {
    for ep in endpoints {
        if let Err(e) = rt.networks.release_ip(&ep.network, ep.ip) {
            tracing::warn!(endpoint = %ep.uuid, "failed to release ip during rollback: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testutil::test_container;
    use crate::image::Image;
    use crate::runtime::Layout;
    use crate::storage::{OverlayDriver, StorageDriver, OVERLAY};

    fn seeded_runtime(dir: &std::path::Path) -> Runtime {
        let mut rt = Runtime::with_layout(Layout::new(dir)).unwrap();
        rt.images.insert_for_test(Image {
            uuid: "3f57d9401f8d".to_string(),
            repo_tag: "busybox:latest".to_string(),
            size: "4.3MB".to_string(),
            counts: 0,
            working_dir: String::new(),
            entrypoint: Vec::new(),
            command: vec!["sh".to_string()],
            envs: vec!["PATH=/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
            created: chrono::Utc::now(),
        });
        rt
    }

    fn offline_spec() -> RunSpec {
        RunSpec {
            image: "busybox".to_string(),
            networks: vec!["none".to_string()],
            storage_driver: OVERLAY.to_string(),
            ..RunSpec::default()
        }
    }

    #[test]
    fn test_new_container_writes_snapshot_and_bumps_refcount() {
        if !OverlayDriver.allowed() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut rt = seeded_runtime(dir.path());

        let c = new_container(&mut rt, offline_spec()).unwrap();

        assert_eq!(c.status, Status::Creating);
        assert_eq!(c.uuid.len(), 12);
        assert!(c.uuid.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert!(c.config_path().exists());
        assert!(c.endpoints.is_empty());
        // Image command fills in when no args are given; PATH comes along.
        assert_eq!(c.commands, vec!["sh"]);
        assert!(c.envs.contains_key("PATH"));
        assert_eq!(c.cgroups.path, format!("mydocker/{}", c.uuid));
        assert_eq!(rt.images.get_by_name_or_uuid("busybox").unwrap().counts, 1);
    }

    #[test]
    fn test_new_container_rejects_duplicate_name() {
        if !OverlayDriver.allowed() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut rt = seeded_runtime(dir.path());

        let c = new_container(&mut rt, offline_spec()).unwrap();

        let mut dup = offline_spec();
        dup.name = Some(c.name.clone());
        assert!(matches!(new_container(&mut rt, dup), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_new_container_unknown_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut rt = Runtime::with_layout(Layout::new(dir.path())).unwrap();

        let mut spec = offline_spec();
        spec.image = "nope".to_string();
        assert!(new_container(&mut rt, spec).is_err());
    }

    #[test]
    fn test_parse_volumes() {
        let volumes =
            parse_volumes(&["/srv/data/:/data".to_string(), "/var/log:/log".to_string()]).unwrap();
        assert_eq!(volumes.get("/srv/data"), Some(&"/data".to_string()));
        assert_eq!(volumes.get("/var/log"), Some(&"/log".to_string()));

        assert!(parse_volumes(&["nope".to_string()]).is_err());
        assert!(parse_volumes(&[":/data".to_string()]).is_err());
        assert!(parse_volumes(&["relative:/data".to_string()]).is_err());
    }

    #[test]
    fn test_parse_envs_flag_overrides_image() {
        let image_envs = vec!["PATH=/usr/bin".to_string(), "LANG=C".to_string()];
        let flag_envs = vec!["LANG=en_US.UTF-8".to_string(), "OPTS=a=b=c".to_string()];
        let envs = parse_envs(&image_envs, &flag_envs).unwrap();

        assert_eq!(envs.get("PATH"), Some(&"/usr/bin".to_string()));
        assert_eq!(envs.get("LANG"), Some(&"en_US.UTF-8".to_string()));
        // Values keep embedded '='.
        assert_eq!(envs.get("OPTS"), Some(&"a=b=c".to_string()));

        assert!(parse_envs(&[], &["novalue".to_string()]).is_err());
        assert!(parse_envs(&[], &["=x".to_string()]).is_err());
    }

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!(parse_port_mapping("8080:80").unwrap(), (8080, 80));
        assert!(parse_port_mapping("8080").is_err());
        assert!(parse_port_mapping("8080:").is_err());
        assert!(parse_port_mapping("99999:80").is_err());
        assert!(parse_port_mapping("-1:80").is_err());
    }

    #[test]
    fn test_parse_ports_rejects_declared_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut other = test_container(dir.path(), "other");
        other.ports.insert(18473, 80);

        let result = parse_ports(&["18473:8080".to_string()], std::slice::from_ref(&other));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn test_parse_ports_rejects_bound_port() {
        // Hold a listener open so the bind probe fails.
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = parse_ports(&[format!("{port}:80")], &[]);
        assert!(matches!(result, Err(Error::Conflict(_))));
    }
}
