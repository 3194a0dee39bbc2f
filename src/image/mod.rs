//! Image store adapter.
//!
//! Images are materialized through an external docker daemon: `docker pull`
//! fetches the image, `docker inspect` yields its metadata, and a throwaway
//! `docker create` + `docker export` produces the rootfs tarball that gets
//! unpacked under `<images>/<uuid>`. The catalog itself (repositories.json)
//! and the refcounts are owned here.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::runtime::Layout;
use crate::store;
use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// First 12 hex chars of the content digest.
    pub uuid: String,
    pub repo_tag: String,
    pub size: String,
    /// Number of containers created from this image.
    pub counts: i32,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub envs: Vec<String>,
    pub created: DateTime<Utc>,
}

pub struct ImageStore {
    catalog: PathBuf,
    images_dir: PathBuf,
    images: Vec<Image>,
}

impl ImageStore {
    pub fn open(layout: &Layout) -> Result<Self> {
        let catalog = layout.image_catalog();
        let images = store::load(&catalog)?.unwrap_or_default();
        Ok(Self {
            catalog,
            images_dir: layout.images_dir(),
            images,
        })
    }

    fn dump(&self) -> Result<()> {
        store::dump(&self.catalog, &self.images)
    }

    pub fn list(&self) -> &[Image] {
        &self.images
    }

    pub fn root_dir(&self, img: &Image) -> PathBuf {
        self.images_dir.join(&img.uuid)
    }

    /// Resolve `identifier` as a repo:tag (with or without the tag), or a
    /// uuid.
    pub fn get_by_name_or_uuid(&self, identifier: &str) -> Result<&Image> {
        if identifier.is_empty() {
            return Err(Error::Validation("missing image name or uuid".into()));
        }
        self.images
            .iter()
            .find(|img| {
                img.repo_tag == identifier
                    || img.repo_tag == format!("{identifier}:latest")
                    || img.uuid == identifier
            })
            .ok_or_else(|| Error::not_found("image", identifier))
    }

    pub fn exist(&self, identifier: &str) -> bool {
        self.get_by_name_or_uuid(identifier).is_ok()
    }

    /// Pull an image through the docker daemon and materialize its rootfs.
    /// Pulling an already-present repo:tag is a no-op.
    pub fn pull(&mut self, name: &str) -> Result<()> {
        let repo_tag = normalize_tag(name);
        if self.images.iter().any(|img| img.repo_tag == repo_tag) {
            tracing::info!(image = %repo_tag, "image already present");
            return Ok(());
        }

        docker_pull(&repo_tag)?;
        let info = docker_inspect(&repo_tag)?;

        let mut made_rootfs = self.images.iter().any(|img| img.uuid == info.uuid);
        for tag in &info.repo_tags {
            let img = Image {
                uuid: info.uuid.clone(),
                repo_tag: tag.clone(),
                size: util::human_size(info.size),
                counts: 0,
                working_dir: info.working_dir.clone(),
                entrypoint: info.entrypoint.clone(),
                command: info.command.clone(),
                envs: info.envs.clone(),
                created: Utc::now(),
            };
            if !made_rootfs {
                // One rootfs per uuid, however many tags point at it.
                self.make_rootfs(&img)?;
                made_rootfs = true;
            }
            if !self.images.iter().any(|i| i.repo_tag == img.repo_tag) {
                self.images.push(img);
            }
        }

        self.dump()
    }

    /// Remove an image that no container references.
    pub fn delete(&mut self, identifier: &str) -> Result<()> {
        let img = self.get_by_name_or_uuid(identifier)?.clone();
        if img.counts > 0 {
            return Err(Error::Conflict(format!(
                "there still exist {} containers using the image {}",
                img.counts, img.repo_tag
            )));
        }

        self.images.retain(|i| i.uuid != img.uuid);
        self.dump()?;

        let root = self.images_dir.join(&img.uuid);
        if root.exists() {
            std::fs::remove_dir_all(root)?;
        }
        Ok(())
    }

    /// Adjust the refcount of every tag sharing the image's uuid.
    pub fn change_counts(&mut self, identifier: &str, delta: i32) -> Result<()> {
        let uuid = self.get_by_name_or_uuid(identifier)?.uuid.clone();
        for img in &mut self.images {
            if img.uuid == uuid {
                img.counts += delta;
            }
        }
        self.dump()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, img: Image) {
        self.images.push(img);
    }

    /// Export the image's flattened filesystem into `<images>/<uuid>`.
    fn make_rootfs(&self, img: &Image) -> Result<()> {
        let scratch = format!("mydocker-export-{}", img.uuid);

        run_docker(
            &["create", "--name", scratch.as_str(), img.uuid.as_str()],
            "docker create",
        )?;
        let result = (|| {
            let tarball = tempfile::Builder::new()
                .prefix("mydocker-rootfs-")
                .suffix(".tar")
                .tempfile()?;
            let tar_path = tarball.path().to_string_lossy().into_owned();
            run_docker(
                &["export", "-o", tar_path.as_str(), scratch.as_str()],
                "docker export",
            )?;

            let root = self.root_dir(img);
            std::fs::create_dir_all(&root)?;
            unpack_tarball(tarball.path(), &root)
        })();
        let _ = run_docker(&["rm", "-f", scratch.as_str()], "docker rm");

        result
    }
}

fn normalize_tag(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

fn docker_pull(repo_tag: &str) -> Result<()> {
    // Skip the pull when the daemon already has the image.
    let present = Command::new("docker")
        .args(["image", "inspect", repo_tag])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if present {
        return Ok(());
    }

    let status = Command::new("docker")
        .args(["pull", repo_tag])
        .status()
        .map_err(|e| Error::Image(format!("failed to run docker pull: {e}")))?;
    if !status.success() {
        return Err(Error::Image(format!("failed to pull image {repo_tag}")));
    }
    Ok(())
}

struct InspectInfo {
    uuid: String,
    size: u64,
    working_dir: String,
    repo_tags: Vec<String>,
    entrypoint: Vec<String>,
    command: Vec<String>,
    envs: Vec<String>,
}

fn docker_inspect(repo_tag: &str) -> Result<InspectInfo> {
    let format = [
        "{{.Id}}",
        "{{.Size}}",
        "{{.Config.WorkingDir}}",
        "{{json .RepoTags}}",
        "{{json .Config.Entrypoint}}",
        "{{json .Config.Cmd}}",
        "{{json .Config.Env}}",
    ]
    .join("#");

    let output = Command::new("docker")
        .args(["image", "inspect", "-f", &format, repo_tag])
        .output()
        .map_err(|e| Error::Image(format!("failed to run docker inspect: {e}")))?;
    if !output.status.success() {
        return Err(Error::Image(format!(
            "failed to inspect image {repo_tag}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_inspect_output(String::from_utf8_lossy(&output.stdout).trim())
}

fn parse_inspect_output(raw: &str) -> Result<InspectInfo> {
    let fields: Vec<&str> = raw.split('#').collect();
    if fields.len() != 7 {
        return Err(Error::Image(format!(
            "unexpected docker inspect output: {raw:?}"
        )));
    }

    // The id is "sha256:<64 hex>"; the uuid is its first 12 digest chars.
    let id = fields[0];
    if id.len() < 19 {
        return Err(Error::Image(format!("unexpected image id: {id:?}")));
    }
    let uuid = id[7..19].to_string();

    let size: u64 = fields[1]
        .parse()
        .map_err(|_| Error::Image(format!("unexpected image size: {:?}", fields[1])))?;

    // Entrypoint/Cmd/Env serialize as JSON null when unset.
    let json_list = |raw: &str| -> Result<Vec<String>> {
        Ok(serde_json::from_str::<Option<Vec<String>>>(raw)?.unwrap_or_default())
    };

    Ok(InspectInfo {
        uuid,
        size,
        working_dir: fields[2].to_string(),
        repo_tags: json_list(fields[3])?,
        entrypoint: json_list(fields[4])?,
        command: json_list(fields[5])?,
        envs: json_list(fields[6])?,
    })
}

fn run_docker(args: &[&str], op: &str) -> Result<()> {
    let status = Command::new("docker")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| Error::Image(format!("failed to run {op}: {e}")))?;
    if !status.success() {
        return Err(Error::Image(format!("{op} failed")));
    }
    Ok(())
}

/// Unpack a rootfs tarball, transparently handling gzip compression.
fn unpack_tarball(tarball: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    let mut file = File::open(tarball)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    drop(file);

    let file = File::open(tarball)?;
    if n == 2 && magic == [0x1f, 0x8b] {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)?;
    } else {
        tar::Archive::new(file).unpack(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_store() -> (tempfile::TempDir, ImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let images = ImageStore::open(&layout).unwrap();
        (dir, images)
    }

    fn test_image(uuid: &str, repo_tag: &str) -> Image {
        Image {
            uuid: uuid.to_string(),
            repo_tag: repo_tag.to_string(),
            size: "5.6MB".to_string(),
            counts: 0,
            working_dir: String::new(),
            entrypoint: Vec::new(),
            command: vec!["sh".to_string()],
            envs: vec!["PATH=/usr/bin:/bin".to_string()],
            created: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("busybox"), "busybox:latest");
        assert_eq!(normalize_tag("busybox:1.36"), "busybox:1.36");
        assert_eq!(normalize_tag("registry:5000/img:v1"), "registry:5000/img:v1");
    }

    #[test]
    fn test_parse_inspect_output() {
        let raw = concat!(
            "sha256:3f57d9401f8d42f986df300f0c69192fc41da28ccc8d797829467780db3dd741",
            "#4261550#/app",
            "#[\"busybox:latest\",\"busybox:1.36\"]",
            "#null",
            "#[\"sh\"]",
            "#[\"PATH=/usr/local/sbin:/usr/local/bin\"]",
        );
        let info = parse_inspect_output(raw).unwrap();
        assert_eq!(info.uuid, "3f57d9401f8d");
        assert_eq!(info.size, 4_261_550);
        assert_eq!(info.working_dir, "/app");
        assert_eq!(info.repo_tags, vec!["busybox:latest", "busybox:1.36"]);
        assert!(info.entrypoint.is_empty());
        assert_eq!(info.command, vec!["sh"]);
        assert_eq!(info.envs.len(), 1);
    }

    #[test]
    fn test_parse_inspect_output_rejects_garbage() {
        assert!(parse_inspect_output("nope").is_err());
        assert!(parse_inspect_output("a#b#c#d#e#f#g").is_err());
    }

    #[test]
    fn test_lookup_by_name_tag_and_uuid() {
        let (_dir, mut images) = scratch_store();
        images.images.push(test_image("3f57d9401f8d", "busybox:latest"));

        assert!(images.exist("busybox"));
        assert!(images.exist("busybox:latest"));
        assert!(images.exist("3f57d9401f8d"));
        assert!(!images.exist("alpine"));
        assert!(images.get_by_name_or_uuid("").is_err());
    }

    #[test]
    fn test_change_counts_covers_all_tags_of_uuid() {
        let (_dir, mut images) = scratch_store();
        images.images.push(test_image("3f57d9401f8d", "busybox:latest"));
        images.images.push(test_image("3f57d9401f8d", "busybox:1.36"));

        images.change_counts("busybox:latest", 1).unwrap();
        assert!(images.images.iter().all(|img| img.counts == 1));

        images.change_counts("busybox:1.36", -1).unwrap();
        assert!(images.images.iter().all(|img| img.counts == 0));
    }

    #[test]
    fn test_delete_referenced_image_fails() {
        let (_dir, mut images) = scratch_store();
        images.images.push(test_image("3f57d9401f8d", "busybox:latest"));
        images.change_counts("busybox", 1).unwrap();

        assert!(matches!(images.delete("busybox"), Err(Error::Conflict(_))));

        images.change_counts("busybox", -1).unwrap();
        images.delete("busybox").unwrap();
        assert!(!images.exist("busybox"));
    }

    #[test]
    fn test_catalog_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        {
            let mut images = ImageStore::open(&layout).unwrap();
            images.images.push(test_image("3f57d9401f8d", "busybox:latest"));
            images.dump().unwrap();
        }
        let images = ImageStore::open(&layout).unwrap();
        assert!(images.exist("busybox"));
    }
}
