// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hashing::Fingerprint;

use crate::backend::{default_registry, ProvisionedLayout, Registry};
use crate::error::EnvironmentError;
use crate::types::{EnvironmentDescription, EnvironmentHandle};

const LAYOUT_FILE_NAME: &str = ".layout.json";
const READY_FILE_NAME: &str = ".ready";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Provisions and caches environments on a shared, cross-process on-disk cache rooted at
/// `cache_root`. See the crate-level cache layout documentation for the directory shape.
pub struct EnvironmentManager {
    cache_root: PathBuf,
    registry: Registry,
    lock_timeout: Duration,
}

impl EnvironmentManager {
    pub fn new(cache_root: PathBuf) -> Self {
        EnvironmentManager {
            cache_root,
            registry: default_registry(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_registry(cache_root: PathBuf, registry: Registry) -> Self {
        EnvironmentManager {
            cache_root,
            registry,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Materializes `description` into a `Handle`, provisioning it if this is the first request
    /// for its fingerprint (process-wide or cross-process) and otherwise returning the existing
    /// one. If `exist_ok` is false and the environment is already materialized, returns
    /// `AlreadyExists` instead of succeeding silently.
    pub async fn materialize(
        &self,
        description: &EnvironmentDescription,
        exist_ok: bool,
    ) -> Result<EnvironmentHandle, EnvironmentError> {
        let fingerprint = description.fingerprint();
        let kind_dir = self.cache_root.join(&description.kind);
        tokio::fs::create_dir_all(&kind_dir)
            .await
            .map_err(|e| EnvironmentError::io("creating the environment kind directory", e))?;

        let env_dir = kind_dir.join(fingerprint.to_hex());
        let ready_marker = env_dir.join(READY_FILE_NAME);

        if path_exists(&ready_marker).await {
            if !exist_ok {
                return Err(EnvironmentError::AlreadyExists { path: env_dir });
            }
            return self.handle_for(&env_dir, fingerprint).await;
        }

        let lock_path = kind_dir.join(format!(".lock-{}", fingerprint.to_hex()));
        let lock = self.acquire_lock(&lock_path, &fingerprint).await?;

        // Another process (or another concurrent caller in this one) may have finished
        // provisioning while we waited for the lock.
        if path_exists(&ready_marker).await {
            drop(lock);
            if !exist_ok {
                return Err(EnvironmentError::AlreadyExists { path: env_dir });
            }
            return self.handle_for(&env_dir, fingerprint).await;
        }

        let scratch_dir =
            kind_dir.join(format!(".scratch-{}-{}", fingerprint.to_hex(), std::process::id()));
        // A scratch dir from a crashed prior attempt under the same PID is vanishingly unlikely
        // but cheap to guard against.
        let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
        tokio::fs::create_dir_all(&scratch_dir)
            .await
            .map_err(|e| EnvironmentError::io("creating the scratch directory", e))?;

        let backend = match self.registry.get(&description.kind) {
            Ok(backend) => backend,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
                drop(lock);
                return Err(e);
            }
        };

        let layout = match backend.provision(description, &scratch_dir).await {
            Ok(layout) => layout,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
                drop(lock);
                return Err(e);
            }
        };

        if let Err(e) = write_layout(&scratch_dir, &layout).await {
            let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
            drop(lock);
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&scratch_dir, &env_dir).await {
            let _ = tokio::fs::remove_dir_all(&scratch_dir).await;
            drop(lock);
            return Err(EnvironmentError::io("renaming the scratch directory into place", e));
        }

        // The marker file is written last, and only once the directory is already at its final
        // path: its presence is the sole signal that an environment is fully materialized.
        if let Err(e) = tokio::fs::write(&ready_marker, fingerprint.to_hex()).await {
            let _ = tokio::fs::remove_dir_all(&env_dir).await;
            drop(lock);
            return Err(EnvironmentError::io("writing the ready marker", e));
        }

        drop(lock);

        Ok(EnvironmentHandle {
            fingerprint,
            root_path: env_dir.clone(),
            runtime_bin: env_dir.join(&layout.runtime_bin),
            search_paths: layout
                .lib_dirs
                .into_iter()
                .map(|dir| env_dir.join(dir))
                .collect(),
        })
    }

    /// Removes a materialized environment's entire root tree. Idempotent: discarding an already
    /// (or never) materialized environment is not an error.
    pub async fn discard(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        match tokio::fs::remove_dir_all(&handle.root_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EnvironmentError::io("discarding the environment", e)),
        }
    }

    async fn handle_for(
        &self,
        env_dir: &Path,
        fingerprint: Fingerprint,
    ) -> Result<EnvironmentHandle, EnvironmentError> {
        let layout = read_layout(env_dir).await?;
        Ok(EnvironmentHandle {
            fingerprint,
            root_path: env_dir.to_path_buf(),
            runtime_bin: env_dir.join(&layout.runtime_bin),
            search_paths: layout
                .lib_dirs
                .into_iter()
                .map(|dir| env_dir.join(dir))
                .collect(),
        })
    }

    /// Acquires the advisory, cross-process exclusive lock for `fingerprint`, polling until
    /// either it is obtained or `self.lock_timeout` elapses, in which case `Busy` is returned.
    /// File locks are held for the lifetime of the returned handle and are released
    /// unconditionally (by the OS, on file-descriptor close) when it is dropped.
    async fn acquire_lock(
        &self,
        lock_path: &Path,
        fingerprint: &Fingerprint,
    ) -> Result<std::fs::File, EnvironmentError> {
        let lock_path = lock_path.to_path_buf();
        let timeout = self.lock_timeout;
        let fingerprint_hex = fingerprint.to_hex();

        tokio::task::spawn_blocking(move || {
            use fs4::FileExt;

            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
                .map_err(|e| EnvironmentError::io("opening the provisioning lock file", e))?;

            let deadline = Instant::now() + timeout;
            loop {
                match file.try_lock_exclusive() {
                    Ok(()) => return Ok(file),
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(LOCK_POLL_INTERVAL);
                    }
                    Err(_) => {
                        return Err(EnvironmentError::Busy {
                            fingerprint: fingerprint_hex,
                        })
                    }
                }
            }
        })
        .await
        .expect("lock-acquisition task panicked")
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn write_layout(scratch_dir: &Path, layout: &ProvisionedLayout) -> Result<(), EnvironmentError> {
    let bytes = serde_json::to_vec(layout).expect("ProvisionedLayout always serializes");
    tokio::fs::write(scratch_dir.join(LAYOUT_FILE_NAME), bytes)
        .await
        .map_err(|e| EnvironmentError::io("writing the environment layout sidecar", e))
}

async fn read_layout(env_dir: &Path) -> Result<ProvisionedLayout, EnvironmentError> {
    let bytes = tokio::fs::read(env_dir.join(LAYOUT_FILE_NAME))
        .await
        .map_err(|e| EnvironmentError::io("reading the environment layout sidecar", e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EnvironmentError::io("parsing the environment layout sidecar", e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvironmentDescription;
    use serde_json::json;

    #[tokio::test]
    async fn materialize_is_idempotent_and_caches_by_fingerprint() {
        let cache_root = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
        let description = EnvironmentDescription::new("bare-runtime")
            .with_config("runtime_bin", json!("/usr/bin/true"));

        let handle1 = manager.materialize(&description, true).await.unwrap();
        assert!(handle1.root_path.join(".ready").exists());

        let handle2 = manager.materialize(&description, true).await.unwrap();
        assert_eq!(handle1, handle2);
    }

    #[tokio::test]
    async fn materialize_rejects_duplicate_without_exist_ok() {
        let cache_root = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
        let description = EnvironmentDescription::new("bare-runtime")
            .with_config("runtime_bin", json!("/usr/bin/true"));

        manager.materialize(&description, true).await.unwrap();
        let result = manager.materialize(&description, false).await;
        assert!(matches!(result, Err(EnvironmentError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn failed_provision_leaves_no_partial_directory() {
        let cache_root = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
        // Missing `runtime_bin` causes BareRuntimeBackend to fail.
        let description = EnvironmentDescription::new("bare-runtime");

        let result = manager.materialize(&description, true).await;
        assert!(result.is_err());

        let kind_dir = cache_root.path().join("bare-runtime");
        let env_dir = kind_dir.join(description.fingerprint().to_hex());
        assert!(!env_dir.exists());
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let cache_root = tempfile::tempdir().unwrap();
        let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
        let description = EnvironmentDescription::new("bare-runtime")
            .with_config("runtime_bin", json!("/usr/bin/true"));

        let handle = manager.materialize(&description, true).await.unwrap();
        manager.discard(&handle).await.unwrap();
        assert!(!handle.root_path.exists());
        manager.discard(&handle).await.unwrap();
    }
}
