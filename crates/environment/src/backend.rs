// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EnvironmentError;
use crate::types::EnvironmentDescription;

/// What a successful provisioning run produced, expressed as paths relative to the scratch
/// directory the backend was asked to provision into. Persisted as a sidecar JSON file inside
/// the environment root so that a later cache hit can reconstruct a `Handle` without having to
/// re-provision or guess at the layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedLayout {
    pub runtime_bin: PathBuf,
    pub lib_dirs: Vec<PathBuf>,
}

/// A collaborator that knows how to provision one `kind` of environment. Backends never touch
/// the cache's locking or atomic-rename machinery themselves; the `EnvironmentManager` owns
/// that, and only ever calls `provision` with an already-locked, already-created scratch
/// directory that is guaranteed not to be observed by any other caller until it is renamed into
/// place (or removed, on failure).
#[async_trait]
pub trait Backend: Send + Sync {
    async fn provision(
        &self,
        description: &EnvironmentDescription,
        scratch_dir: &Path,
    ) -> Result<ProvisionedLayout, EnvironmentError>;
}

/// Points at an already-installed system runtime; does no provisioning of its own beyond
/// recording where that runtime lives. `config` must carry a `runtime_bin` (absolute path to
/// the interpreter/runtime binary) and may carry a `search_paths` array of additional absolute
/// library directories.
pub struct BareRuntimeBackend;

#[async_trait]
impl Backend for BareRuntimeBackend {
    async fn provision(
        &self,
        description: &EnvironmentDescription,
        scratch_dir: &Path,
    ) -> Result<ProvisionedLayout, EnvironmentError> {
        let runtime_bin = description.config_str("runtime_bin").ok_or_else(|| {
            EnvironmentError::ProvisionFailed {
                operation: "reading bare-runtime config".to_owned(),
                stderr: "config is missing required key `runtime_bin`".to_owned(),
                exit_code: None,
            }
        })?;

        // Record a symlink inside the scratch dir so that the materialized tree has a stable
        // `bin/<runtime_bin>` shape regardless of backend, even though the real binary lives
        // outside the cache entirely.
        let bin_dir = scratch_dir.join("bin");
        tokio::fs::create_dir_all(&bin_dir)
            .await
            .map_err(|e| EnvironmentError::io("creating bare-runtime bin directory", e))?;
        let link_name = bin_dir.join(
            Path::new(runtime_bin)
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("runtime")),
        );
        #[cfg(unix)]
        tokio::fs::symlink(runtime_bin, &link_name)
            .await
            .map_err(|e| EnvironmentError::io("linking bare runtime binary", e))?;

        let lib_dirs = description
            .config_str_list("search_paths")
            .into_iter()
            .map(PathBuf::from)
            .collect();

        Ok(ProvisionedLayout {
            runtime_bin: link_name
                .strip_prefix(scratch_dir)
                .unwrap_or(&link_name)
                .to_path_buf(),
            lib_dirs,
        })
    }
}

/// Shells out to an opaque external provisioning command to build an isolated runtime tree and
/// install packages into it. The package manager itself is never inspected or reimplemented:
/// per the scope of this component, it is a subprocess whose exit code and stderr are the only
/// signal we interpret.
///
/// `config` must carry:
/// - `provision_command`: argv (list of strings) to run, with `{prefix}` substituted for the
///   scratch directory and `{packages}` substituted with the space-joined package list.
/// - `packages`: a list of package specifiers to install.
/// - `runtime_bin`: the path, relative to the prefix, where the provisioned runtime binary is
///   expected to land.
pub struct VirtualRuntimeBackend;

#[async_trait]
impl Backend for VirtualRuntimeBackend {
    async fn provision(
        &self,
        description: &EnvironmentDescription,
        scratch_dir: &Path,
    ) -> Result<ProvisionedLayout, EnvironmentError> {
        run_external_provisioner(description, scratch_dir, None).await
    }
}

/// Shells to an external package manager binary (e.g. the executable named by `CONDA_EXE`) with
/// a prefix path and package list; success is zero exit status plus the expected binary being
/// present afterwards. Structurally identical to `VirtualRuntimeBackend` — the distinction is
/// which concrete package manager the caller's `provision_command` names — but kept as a
/// separate type so each backend's identity in the registry, and in logs, is unambiguous.
pub struct PackageManagerRuntimeBackend;

#[async_trait]
impl Backend for PackageManagerRuntimeBackend {
    async fn provision(
        &self,
        description: &EnvironmentDescription,
        scratch_dir: &Path,
    ) -> Result<ProvisionedLayout, EnvironmentError> {
        run_external_provisioner(description, scratch_dir, Some(&crate::config::conda_executable())).await
    }
}

/// `conda_exe`, when given, is substituted for a `{conda_exe}` token in `provision_command` --
/// the package-manager-runtime backend's way of honoring `CONDA_EXE`/`CONDA_HOME` without the
/// virtual-runtime backend (which has no such external package manager) needing to care.
async fn run_external_provisioner(
    description: &EnvironmentDescription,
    scratch_dir: &Path,
    conda_exe: Option<&str>,
) -> Result<ProvisionedLayout, EnvironmentError> {
    let argv = description.config_str_list("provision_command");
    if argv.is_empty() {
        return Err(EnvironmentError::ProvisionFailed {
            operation: "reading provisioner config".to_owned(),
            stderr: "config is missing required key `provision_command`".to_owned(),
            exit_code: None,
        });
    }
    let packages = description.config_str_list("packages");
    let runtime_bin_rel = description.config_str("runtime_bin").ok_or_else(|| {
        EnvironmentError::ProvisionFailed {
            operation: "reading provisioner config".to_owned(),
            stderr: "config is missing required key `runtime_bin`".to_owned(),
            exit_code: None,
        }
    })?;

    let prefix = scratch_dir.display().to_string();
    let joined_packages = packages.join(" ");
    let rendered: Vec<String> = argv
        .iter()
        .map(|arg| {
            let substituted = arg
                .replace("{prefix}", &prefix)
                .replace("{packages}", &joined_packages);
            match conda_exe {
                Some(conda_exe) => substituted.replace("{conda_exe}", conda_exe),
                None => substituted,
            }
        })
        .collect();

    let (program, args) = rendered
        .split_first()
        .expect("checked non-empty above");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EnvironmentError::io("spawning the provisioning subprocess", e))?;

    if !output.status.success() {
        return Err(EnvironmentError::ProvisionFailed {
            operation: "running the provisioning subprocess".to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        });
    }

    let runtime_bin = PathBuf::from(runtime_bin_rel);
    if !scratch_dir.join(&runtime_bin).exists() {
        return Err(EnvironmentError::ProvisionFailed {
            operation: "verifying the provisioned runtime binary".to_owned(),
            stderr: format!(
                "provisioner exited successfully but {} is not present",
                runtime_bin.display()
            ),
            exit_code: output.status.code(),
        });
    }

    let lib_dirs = description
        .config_str_list("search_paths")
        .into_iter()
        .map(PathBuf::from)
        .collect();

    Ok(ProvisionedLayout {
        runtime_bin,
        lib_dirs,
    })
}

/// The remote backend touches no local filesystem at all: provisioning of the inner description
/// is deferred entirely to the remote peer when a bridge session is opened against it (see the
/// `remote_facade` crate). Its `provision` is a no-op that only records enough of a stub layout
/// for the cache's bookkeeping to stay uniform across backends.
pub struct RemoteBackend;

#[async_trait]
impl Backend for RemoteBackend {
    async fn provision(
        &self,
        _description: &EnvironmentDescription,
        _scratch_dir: &Path,
    ) -> Result<ProvisionedLayout, EnvironmentError> {
        Ok(ProvisionedLayout {
            runtime_bin: PathBuf::from("remote"),
            lib_dirs: Vec::new(),
        })
    }
}

/// An explicit, static `kind -> Backend` registry, per the design note preferring this over
/// runtime plugin discovery: the set of backends is fixed at compile time and initialized once.
pub struct Registry(HashMap<String, Box<dyn Backend>>);

impl Registry {
    pub fn get(&self, kind: &str) -> Result<&dyn Backend, EnvironmentError> {
        self.0
            .get(kind)
            .map(|b| b.as_ref())
            .ok_or_else(|| EnvironmentError::UnknownKind {
                kind: kind.to_owned(),
            })
    }

    pub fn register(&mut self, kind: impl Into<String>, backend: Box<dyn Backend>) {
        self.0.insert(kind.into(), backend);
    }
}

pub fn default_registry() -> Registry {
    let mut registry = Registry(HashMap::new());
    registry.register("bare-runtime", Box::new(BareRuntimeBackend));
    registry.register("virtual-runtime", Box::new(VirtualRuntimeBackend));
    registry.register(
        "package-manager-runtime",
        Box::new(PackageManagerRuntimeBackend),
    );
    registry.register("remote", Box::new(RemoteBackend));
    registry
}
