// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Environment-variable-driven defaults. Callers are always free to pass an explicit
//! `cache_root`/provisioner path instead; these exist only for the common case of a command-line
//! wrapper that wants the same defaults every invocation.

use std::path::PathBuf;

const CACHE_ROOT_VAR: &str = "CACHE_ROOT";
const XDG_CACHE_HOME: &str = "XDG_CACHE_HOME";
const CONDA_EXE_VAR: &str = "CONDA_EXE";
const CONDA_HOME_VAR: &str = "CONDA_HOME";

/// The cache root to use when the caller hasn't named one explicitly: `CACHE_ROOT` if set,
/// otherwise the platform's XDG-style cache directory joined with `capsule`.
///
/// Follows the unix XDG base spec: <http://standards.freedesktop.org/basedir-spec/latest/index.html>.
pub fn default_cache_root() -> PathBuf {
    if let Ok(value) = std::env::var(CACHE_ROOT_VAR) {
        if !value.is_empty() {
            return PathBuf::from(value);
        }
    }

    let cache_path = std::env::var(XDG_CACHE_HOME)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".cache")))
        .unwrap_or_else(|| PathBuf::from(".cache"));
    cache_path.join("capsule")
}

/// The package-manager-runtime backend's executable lookup, honoring `CONDA_EXE` (a full
/// override) then `CONDA_HOME` (a prefix to resolve `bin/conda` under), falling back to the bare
/// command name so it's resolved against `$PATH`.
pub fn conda_executable() -> String {
    if let Ok(exe) = std::env::var(CONDA_EXE_VAR) {
        if !exe.is_empty() {
            return exe;
        }
    }
    if let Ok(home) = std::env::var(CONDA_HOME_VAR) {
        if !home.is_empty() {
            return PathBuf::from(home).join("bin").join("conda").to_string_lossy().into_owned();
        }
    }
    "conda".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(env)]
    fn cache_root_honors_explicit_override() {
        std::env::set_var(CACHE_ROOT_VAR, "/tmp/explicit-cache-root");
        assert_eq!(default_cache_root(), PathBuf::from("/tmp/explicit-cache-root"));
        std::env::remove_var(CACHE_ROOT_VAR);
    }

    #[test]
    #[serial(env)]
    fn conda_executable_honors_conda_exe_override() {
        std::env::remove_var(CONDA_HOME_VAR);
        std::env::set_var(CONDA_EXE_VAR, "/opt/conda/bin/mamba");
        assert_eq!(conda_executable(), "/opt/conda/bin/mamba");
        std::env::remove_var(CONDA_EXE_VAR);
    }

    #[test]
    #[serial(env)]
    fn conda_executable_honors_conda_home_fallback() {
        std::env::remove_var(CONDA_EXE_VAR);
        std::env::set_var(CONDA_HOME_VAR, "/opt/conda");
        assert_eq!(conda_executable(), "/opt/conda/bin/conda");
        std::env::remove_var(CONDA_HOME_VAR);
    }

    #[test]
    #[serial(env)]
    fn conda_executable_defaults_to_bare_command() {
        std::env::remove_var(CONDA_EXE_VAR);
        std::env::remove_var(CONDA_HOME_VAR);
        assert_eq!(conda_executable(), "conda");
    }
}
