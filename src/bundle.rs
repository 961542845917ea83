//! Sidecar bundle building.
//!
//! Materialises a disposable OCI runtime bundle (`config.json` + `rootfs/`)
//! per sidecar from the root filesystem shipped with the agent, then shapes
//! its spec to the target through an ordered list of [`SpecEdit`]s.
//!
//! ```text
//! <workdir>/<sidecar-id>/
//! ├── config.json      OCI spec, rewritten after every edit
//! ├── mounts           bind mounts made into rootfs (one per line)
//! └── rootfs/          copy of the sidecar image
//! ```
//!
//! Bind mounts from a target are recorded in `mounts` so they can be undone
//! before the directory is deleted, even by a later [`crate::sidecar::sweep_orphans`].

use crate::constants::{OCI_RUNTIME_SPEC_VERSION, PROC_ROOT, SIDECAR_PATH_ENV, validate_container_id};
use crate::error::{Error, Result};
use crate::introspect::Namespace;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

/// Name of the file listing bind mounts inside a bundle.
const MOUNTS_FILE: &str = "mounts";

/// Capabilities every sidecar starts with.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
];

// =============================================================================
// Bundle Builder
// =============================================================================

/// Creates sidecar bundles below a work directory.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    workdir: PathBuf,
    image: PathBuf,
    proc_root: PathBuf,
}

impl BundleBuilder {
    /// Creates a builder copying `image` (directory or tarball) into bundles
    /// under `workdir`.
    pub fn new(workdir: impl Into<PathBuf>, image: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            image: image.into(),
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Resolves target paths below a different proc root.
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    /// Directory holding all bundles.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Materialises `<workdir>/<id>/rootfs` and writes a default spec.
    ///
    /// On any failure the bundle directory is removed again.
    pub fn create(&self, id: &str) -> Result<Bundle> {
        validate_container_id(id)
            .map_err(|reason| Error::BundleBuildFailed(format!("invalid sidecar id '{id}': {reason}")))?;

        let path = self.workdir.join(id);
        if path.exists() {
            return Err(Error::BundleBuildFailed(format!(
                "bundle {} already exists",
                path.display()
            )));
        }
        let rootfs = path.join("rootfs");
        fs::create_dir_all(&rootfs)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to create rootfs: {e}")))?;

        let populated = self.populate(&rootfs).and_then(|()| {
            let mut bundle = Bundle {
                id: id.to_string(),
                path: path.clone(),
                rootfs: rootfs.clone(),
                spec: default_spec(),
                mounts: Vec::new(),
                proc_root: self.proc_root.clone(),
                removed: false,
            };
            bundle.write_spec()?;
            Ok(bundle)
        });

        match populated {
            Ok(bundle) => {
                info!("created bundle {}", path.display());
                Ok(bundle)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&path) {
                    warn!("failed to remove incomplete bundle {}: {}", path.display(), cleanup);
                }
                Err(e)
            }
        }
    }

    fn populate(&self, rootfs: &Path) -> Result<()> {
        let meta = fs::metadata(&self.image).map_err(|e| {
            Error::BundleBuildFailed(format!("sidecar image {}: {e}", self.image.display()))
        })?;
        if meta.is_dir() {
            copy_tree(&self.image, rootfs)
        } else {
            extract_archive(&self.image, rootfs)
        }
    }
}

/// Extracts a `.tar` or gzip-compressed tarball into `rootfs`.
///
/// Entries with absolute paths or `..` components are rejected with
/// [`Error::PathTraversal`].
pub fn extract_archive(archive: &Path, rootfs: &Path) -> Result<()> {
    let mut file = File::open(archive)
        .map_err(|e| Error::BundleBuildFailed(format!("failed to open {}: {e}", archive.display())))?;
    let mut magic = [0u8; 2];
    let gzip = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    let extraction_error = |e: std::io::Error| Error::BundleBuildFailed(format!("failed to extract sidecar image: {e}"));
    for entry in archive.entries().map_err(extraction_error)? {
        let mut entry = entry.map_err(extraction_error)?;
        let path = entry.path().map_err(extraction_error)?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().to_string(),
            });
        }

        entry.unpack_in(rootfs).map_err(extraction_error)?;
    }
    Ok(())
}

/// Recursively copies a directory tree, keeping symlinks and permissions.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&source)?, &target)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&source, &target)?;
            fs::set_permissions(&target, entry.metadata()?.permissions())?;
        } else if file_type.is_file() {
            fs::copy(&source, &target)?;
        } else {
            debug!("skipping special file {}", source.display());
        }
    }
    Ok(())
}

fn default_spec() -> OciSpec {
    let caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
    OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        root: OciRoot {
            path: "rootfs".to_string(),
            readonly: false,
        },
        process: OciProcess {
            terminal: false,
            user: OciUser { uid: 0, gid: 0 },
            args: vec!["/bin/sh".to_string()],
            env: vec![SIDECAR_PATH_ENV.to_string()],
            cwd: "/".to_string(),
            capabilities: Some(OciCapabilities {
                bounding: caps.clone(),
                effective: caps.clone(),
                permitted: caps,
                ambient: Vec::new(),
            }),
            no_new_privileges: true,
        },
        hostname: None,
        mounts: default_mounts(),
        annotations: BTreeMap::new(),
        linux: Some(OciLinux {
            namespaces: ["pid", "network", "ipc", "uts", "mount"]
                .iter()
                .map(|t| OciNamespace {
                    ns_type: t.to_string(),
                    path: None,
                })
                .collect(),
            cgroups_path: None,
            resources: None,
        }),
    }
}

fn default_mounts() -> Vec<OciMount> {
    let opts = |o: &[&str]| o.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]),
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: opts(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: opts(&["nosuid", "noexec", "nodev", "ro"]),
        },
    ]
}

// =============================================================================
// Bundle
// =============================================================================

/// A sidecar bundle on disk.
#[derive(Debug)]
pub struct Bundle {
    id: String,
    path: PathBuf,
    rootfs: PathBuf,
    spec: OciSpec,
    mounts: Vec<PathBuf>,
    proc_root: PathBuf,
    removed: bool,
}

impl Bundle {
    /// Loads an existing bundle directory (used when sweeping orphans).
    pub fn load(path: &Path) -> Result<Self> {
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::BundleBuildFailed(format!("invalid bundle path {}", path.display())))?;
        let spec = match fs::read(path.join("config.json")) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(_) => default_spec(),
        };
        let mounts = match File::open(path.join(MOUNTS_FILE)) {
            Ok(file) => BufReader::new(file)
                .lines()
                .map_while(std::result::Result::ok)
                .filter(|l| !l.trim().is_empty())
                .map(PathBuf::from)
                .collect(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            id,
            path: path.to_path_buf(),
            rootfs: path.join("rootfs"),
            spec,
            mounts,
            proc_root: PathBuf::from(PROC_ROOT),
            removed: false,
        })
    }

    /// Sidecar id the bundle belongs to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bundle directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root filesystem directory.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Current spec.
    pub fn spec(&self) -> &OciSpec {
        &self.spec
    }

    /// Bind mounts made into the rootfs.
    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Applies `edits` in order and rewrites `config.json`.
    ///
    /// Nothing is written if any edit fails.
    pub fn edit_spec(&mut self, edits: &[SpecEdit]) -> Result<()> {
        let mut spec = self.spec.clone();
        for edit in edits {
            edit.apply(&mut spec)?;
        }
        self.spec = spec;
        self.write_spec()
    }

    fn write_spec(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.spec)?;
        fs::write(self.path.join("config.json"), json)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to write config.json: {e}")))
    }

    fn rootfs_path(&self, to: &str) -> Result<PathBuf> {
        let relative = Path::new(to.trim_start_matches('/'));
        if relative.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::PathTraversal {
                path: to.to_string(),
            });
        }
        Ok(self.rootfs.join(relative))
    }

    fn process_path(&self, pid: u32, from: &str) -> PathBuf {
        self.proc_root
            .join(pid.to_string())
            .join("root")
            .join(from.trim_start_matches('/'))
    }

    /// Bind-mounts `/proc/<pid>/root/<from>` onto `<rootfs>/<to>`.
    pub fn mount_from_process(&mut self, pid: u32, from: &str, to: &str) -> Result<()> {
        let source = self.process_path(pid, from);
        let target = self.rootfs_path(to)?;

        let meta = fs::metadata(&source).map_err(|e| {
            Error::BundleBuildFailed(format!("cannot access {from} of process {pid}: {e}"))
        })?;
        if meta.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                File::create(&target)?;
            }
        }

        nix::mount::mount(
            Some(&source),
            &target,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND | nix::mount::MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            Error::BundleBuildFailed(format!(
                "failed to bind mount {} to {}: {e}",
                source.display(),
                target.display()
            ))
        })?;
        debug!("mounted {} to {}", source.display(), target.display());

        self.mounts.push(target.clone());
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(MOUNTS_FILE))?;
        writeln!(file, "{}", target.display())?;
        Ok(())
    }

    /// Copies a file from the target's filesystem into `<rootfs>/<to>`.
    pub fn copy_file_from_process(&self, pid: u32, from: &str, to: &str) -> Result<()> {
        let source = self.process_path(pid, from);
        let target = self.rootfs_path(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_symlink() {
            fs::remove_file(&target)?;
        }
        fs::copy(&source, &target).map_err(|e| {
            Error::BundleBuildFailed(format!("cannot copy {from} of process {pid}: {e}"))
        })?;
        Ok(())
    }

    /// Undoes bind mounts and deletes the bundle directory. Idempotent.
    ///
    /// The directory is kept if an unmount fails so target data below a
    /// mount point is never deleted.
    pub fn remove(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        while let Some(mount) = self.mounts.last() {
            match nix::mount::umount2(mount, nix::mount::MntFlags::MNT_DETACH) {
                Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
                    debug!("unmounted {}", mount.display());
                    self.mounts.pop();
                }
                Err(e) => {
                    return Err(Error::Internal(format!(
                        "failed to unmount {}, keeping bundle: {e}",
                        mount.display()
                    )));
                }
            }
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.removed = true;
        debug!("removed bundle {}", self.path.display());
        Ok(())
    }
}

// =============================================================================
// Spec Edits
// =============================================================================

/// One modification of a sidecar spec. Applying an edit twice yields the
/// same spec as applying it once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecEdit {
    /// Sets the hostname; adds a private UTS namespace if none is present.
    Hostname(String),
    /// Sets an annotation.
    Annotation(String, String),
    /// Sets the process argv.
    Args(Vec<String>),
    /// Sets the process working directory.
    Cwd(String),
    /// Sets an environment variable (`KEY=value`).
    Env(String),
    /// Mounts the root filesystem read-only.
    ReadonlyRoot,
    /// Joins namespaces of the target process `pid`.
    Namespaces { pid: u32, namespaces: Vec<Namespace> },
    /// Places the sidecar in a cgroup.
    CgroupsPath(String),
    /// Grants additional capabilities.
    Capabilities(Vec<String>),
    /// Mounts a tmpfs at `/tmp` unless something is mounted there already.
    TmpfsTmp,
    /// Bind-mounts a host path into the sidecar.
    BindMount {
        source: String,
        destination: String,
        readonly: bool,
    },
}

impl SpecEdit {
    /// Applies the edit to `spec`.
    pub fn apply(&self, spec: &mut OciSpec) -> Result<()> {
        match self {
            Self::Hostname(hostname) => {
                spec.hostname = Some(hostname.clone());
                let linux = spec.linux_mut();
                if !linux.namespaces.iter().any(|ns| ns.ns_type == "uts") {
                    linux.namespaces.push(OciNamespace {
                        ns_type: "uts".to_string(),
                        path: None,
                    });
                }
            }
            Self::Annotation(key, value) => {
                spec.annotations.insert(key.clone(), value.clone());
            }
            Self::Args(args) => spec.process.args = args.clone(),
            Self::Cwd(cwd) => spec.process.cwd = cwd.clone(),
            Self::Env(var) => {
                let key = var.split('=').next().unwrap_or(var);
                spec.process
                    .env
                    .retain(|e| e.split('=').next() != Some(key));
                spec.process.env.push(var.clone());
            }
            Self::ReadonlyRoot => spec.root.readonly = true,
            Self::Namespaces { pid, namespaces } => {
                for ns in namespaces {
                    if !ns.is_current() {
                        return Err(Error::NamespaceUnavailable {
                            kind: ns.kind.to_string(),
                            pid: *pid,
                        });
                    }
                    let ns_type = ns.kind.oci_type();
                    let path = Some(ns.path.display().to_string());
                    let linux = spec.linux_mut();
                    match linux.namespaces.iter_mut().find(|n| n.ns_type == ns_type) {
                        Some(existing) => existing.path = path,
                        None => linux.namespaces.push(OciNamespace {
                            ns_type: ns_type.to_string(),
                            path,
                        }),
                    }
                }
            }
            Self::CgroupsPath(path) => spec.linux_mut().cgroups_path = Some(path.clone()),
            Self::Capabilities(caps) => {
                let set = spec.process.capabilities.get_or_insert_with(OciCapabilities::default);
                for cap in caps {
                    for list in [&mut set.bounding, &mut set.effective, &mut set.permitted] {
                        if !list.contains(cap) {
                            list.push(cap.clone());
                        }
                    }
                }
            }
            Self::TmpfsTmp => {
                if !spec.mounts.iter().any(|m| m.destination == "/tmp") {
                    spec.mounts.push(OciMount {
                        destination: "/tmp".to_string(),
                        mount_type: "tmpfs".to_string(),
                        source: "tmpfs".to_string(),
                        options: ["noexec", "nosuid", "nodev", "rprivate"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    });
                }
            }
            Self::BindMount {
                source,
                destination,
                readonly,
            } => {
                let mut options = vec!["rbind".to_string(), "rprivate".to_string()];
                if *readonly {
                    options.push("ro".to_string());
                }
                let mount = OciMount {
                    destination: destination.clone(),
                    mount_type: "bind".to_string(),
                    source: source.clone(),
                    options,
                };
                match spec.mounts.iter_mut().find(|m| m.destination == *destination) {
                    Some(existing) => *existing = mount,
                    None => spec.mounts.push(mount),
                }
            }
        }
        Ok(())
    }
}

/// Builds the `cgroupsPath` placing a sidecar below the target's cgroup.
///
/// With the systemd driver the sidecar becomes a scope in the nearest slice
/// of the target (`<slice>:sb:<child>`).
pub fn cgroups_path(parent: &str, child: &str, systemd: bool) -> String {
    if systemd {
        let slice = parent
            .split('/')
            .rev()
            .find(|c| c.ends_with(".slice"))
            .unwrap_or("system.slice");
        return format!("{slice}:sb:{child}");
    }
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI runtime spec (the subset sidecars use).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

impl OciSpec {
    fn linux_mut(&mut self) -> &mut OciLinux {
        self.linux.get_or_insert_with(OciLinux::default)
    }

    /// Returns the namespace entry of the given OCI type.
    pub fn namespace(&self, ns_type: &str) -> Option<&OciNamespace> {
        self.linux
            .as_ref()
            .and_then(|l| l.namespaces.iter().find(|n| n.ns_type == ns_type))
    }
}

/// OCI root filesystem config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(default)]
    pub no_new_privileges: bool,
}

/// OCI user config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

/// OCI capability sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciCapabilities {
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::{NamespaceKind, TargetProcess};
    use tempfile::TempDir;

    fn image_dir(temp: &TempDir) -> PathBuf {
        let image = temp.path().join("image");
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::write(image.join("bin/stress-ng"), b"#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink("stress-ng", image.join("bin/stress")).unwrap();
        image
    }

    #[test]
    fn test_create_from_directory() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let bundle = builder.create("sb-stress-1-abcdef12").unwrap();

        assert!(bundle.rootfs().join("bin/stress-ng").is_file());
        assert!(bundle.rootfs().join("bin/stress").is_symlink());
        let raw = fs::read_to_string(bundle.path().join("config.json")).unwrap();
        let spec: OciSpec = serde_json::from_str(&raw).unwrap();
        assert_eq!(spec.root.path, "rootfs");
        assert!(spec.namespace("mount").is_some());
    }

    #[test]
    fn test_create_twice_fails() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let _first = builder.create("sb-x-1-abc").unwrap();
        let err = builder.create("sb-x-1-abc").unwrap_err();
        assert!(matches!(err, Error::BundleBuildFailed(_)));
    }

    #[test]
    fn test_missing_image_removes_bundle_dir() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), temp.path().join("nope"));
        assert!(builder.create("sb-x-1-abc").is_err());
        assert!(!temp.path().join("work/sb-x-1-abc").exists());
    }

    #[test]
    fn test_edits_are_idempotent() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let mut bundle = builder.create("sb-net-1-abc").unwrap();
        let edits = vec![
            SpecEdit::Hostname("sb-net-1-abc".to_string()),
            SpecEdit::Annotation("com.steadybit.sidecar".to_string(), "true".to_string()),
            SpecEdit::Args(vec!["ip".to_string(), "-batch".to_string(), "-".to_string()]),
            SpecEdit::Cwd("/tmp".to_string()),
            SpecEdit::ReadonlyRoot,
            SpecEdit::Capabilities(vec!["CAP_NET_ADMIN".to_string()]),
            SpecEdit::TmpfsTmp,
            SpecEdit::Env("PATH=/bin".to_string()),
        ];
        bundle.edit_spec(&edits).unwrap();
        let once = bundle.spec().clone();
        bundle.edit_spec(&edits).unwrap();
        assert_eq!(&once, bundle.spec());

        assert_eq!(once.hostname.as_deref(), Some("sb-net-1-abc"));
        assert!(once.root.readonly);
        assert_eq!(once.process.cwd, "/tmp");
        assert_eq!(once.process.env, vec!["PATH=/bin".to_string()]);
        let caps = once.process.capabilities.unwrap();
        assert_eq!(caps.effective.iter().filter(|c| *c == "CAP_NET_ADMIN").count(), 1);
        assert_eq!(once.mounts.iter().filter(|m| m.destination == "/tmp").count(), 1);
    }

    #[test]
    fn test_join_namespaces_of_process() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let mut bundle = builder.create("sb-net-2-abc").unwrap();
        let pid = std::process::id();
        let target = TargetProcess::inspect(Path::new("/proc"), pid).unwrap();
        let net = target.require_namespace(NamespaceKind::Net).unwrap().clone();

        bundle
            .edit_spec(&[SpecEdit::Namespaces {
                pid,
                namespaces: vec![net],
            }])
            .unwrap();
        let ns = bundle.spec().namespace("network").unwrap();
        assert_eq!(ns.path.as_deref(), Some(format!("/proc/{pid}/ns/net").as_str()));
        assert_eq!(bundle.spec().namespace("pid").unwrap().path, None);
    }

    #[test]
    fn test_stale_namespace_rejected_without_write() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let mut bundle = builder.create("sb-net-3-abc").unwrap();
        let before = fs::read_to_string(bundle.path().join("config.json")).unwrap();

        let stale = Namespace {
            kind: NamespaceKind::Net,
            path: PathBuf::from("/proc/999999999/ns/net"),
            inode: 1,
        };
        let err = bundle
            .edit_spec(&[
                SpecEdit::Hostname("changed".to_string()),
                SpecEdit::Namespaces {
                    pid: 999999999,
                    namespaces: vec![stale],
                },
            ])
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceUnavailable { .. }));
        let after = fs::read_to_string(bundle.path().join("config.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_cgroups_path() {
        assert_eq!(cgroups_path("/docker/abc", "stress", false), "/docker/abc/stress");
        assert_eq!(
            cgroups_path(
                "/kubepods.slice/kubepods-pod1.slice/cri-containerd-abc.scope",
                "network",
                true
            ),
            "kubepods-pod1.slice:sb:network"
        );
        assert_eq!(cgroups_path("/", "x", true), "system.slice:sb:x");
    }

    #[test]
    fn test_copy_file_from_process() {
        let temp = TempDir::new().unwrap();
        let proc_root = temp.path().join("proc");
        fs::create_dir_all(proc_root.join("42/root/etc")).unwrap();
        fs::write(proc_root.join("42/root/etc/resolv.conf"), "nameserver 10.0.0.10\n").unwrap();

        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp))
            .with_proc_root(&proc_root);
        let bundle = builder.create("sb-dig-1-abc").unwrap();
        bundle
            .copy_file_from_process(42, "/etc/resolv.conf", "/etc/resolv.conf")
            .unwrap();
        assert_eq!(
            fs::read_to_string(bundle.rootfs().join("etc/resolv.conf")).unwrap(),
            "nameserver 10.0.0.10\n"
        );
        assert!(matches!(
            bundle.copy_file_from_process(42, "/etc/hosts", "/../../escape"),
            Err(Error::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let mut bundle = builder.create("sb-x-2-abc").unwrap();
        let path = bundle.path().to_path_buf();
        bundle.remove().unwrap();
        assert!(!path.exists());
        bundle.remove().unwrap();
    }

    #[test]
    fn test_load_existing_bundle() {
        let temp = TempDir::new().unwrap();
        let builder = BundleBuilder::new(temp.path().join("work"), image_dir(&temp));
        let mut bundle = builder.create("sb-x-3-abc").unwrap();
        bundle
            .edit_spec(&[SpecEdit::Annotation("k".to_string(), "v".to_string())])
            .unwrap();

        let loaded = Bundle::load(bundle.path()).unwrap();
        assert_eq!(loaded.id(), "sb-x-3-abc");
        assert_eq!(loaded.spec().annotations.get("k").map(String::as_str), Some("v"));
        assert!(loaded.mounts().is_empty());
    }
}
