// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::path::PathBuf;

use hashing::Fingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An immutable description of the environment an invocation wants to run in.
///
/// `config` is a `BTreeMap` rather than a `HashMap` specifically so that serialization (and
/// therefore fingerprinting) is ordered by key without any extra sorting step: serde walks a
/// `BTreeMap` in key order, and `serde_json`'s own `Map` does the same in the absence of the
/// `preserve_order` feature. Together these give us the canonical form the fingerprint is taken
/// over for free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescription {
    pub kind: String,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl EnvironmentDescription {
    pub fn new(kind: impl Into<String>) -> Self {
        EnvironmentDescription {
            kind: kind.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// A `remote`-kind description wrapping `inner` for execution against `host`. Because the
    /// host address and the inner description both end up as ordinary config entries, the
    /// generic [`fingerprint`](Self::fingerprint) already folds in both -- host A and host B
    /// with an otherwise-identical inner description land in distinct cache slots without any
    /// special-casing in the fingerprint computation itself.
    pub fn remote(host: impl Into<String>, inner: &EnvironmentDescription) -> Self {
        EnvironmentDescription::new("remote")
            .with_config("host", serde_json::Value::String(host.into()))
            .with_config(
                "inner_description",
                serde_json::to_value(inner).expect("EnvironmentDescription always serializes"),
            )
    }

    /// The remote host address this description names, if it's a `remote`-kind description
    /// built via [`remote`](Self::remote).
    pub fn remote_host(&self) -> Option<&str> {
        self.config_str("host")
    }

    /// The wrapped inner description, if this is a `remote`-kind description built via
    /// [`remote`](Self::remote).
    pub fn remote_inner(&self) -> Option<EnvironmentDescription> {
        self.config
            .get("inner_description")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_str_list(&self, key: &str) -> Vec<String> {
        self.config
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The canonical byte serialization that the fingerprint is computed over. Deliberately
    /// excludes anything ambient (the caller's `$PATH`, environment variables, the current
    /// working directory): only what's already in `self` participates.
    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("EnvironmentDescription always serializes")
    }

    /// Computes this description's fingerprint: SHA-256 of its canonical serialization. Two
    /// descriptions that are `==` always produce the same fingerprint, and the same holds
    /// across process restarts and machines, since nothing ambient feeds into it.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = Sha256::digest(self.canonical_bytes());
        Fingerprint::from_bytes(digest)
    }
}

/// A materialized, ready-to-run environment.
///
/// A `Handle` is either fully present on disk (or, for the `remote` backend, fully deferred to
/// the remote peer) or it does not exist: there is no partially-materialized state that a
/// `Handle` can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub fingerprint: Fingerprint,
    pub root_path: PathBuf,
    pub runtime_bin: PathBuf,
    pub search_paths: Vec<PathBuf>,
}

impl EnvironmentHandle {
    /// Directory search path composition: this handle's own search paths first (primary wins),
    /// then each inheritance root in order (earlier wins on duplicate names — this is a
    /// load-ordering guarantee, not deduplication: duplicate entries are preserved).
    pub fn effective_search_path(&self, inheritance: &InheritanceList) -> Vec<PathBuf> {
        let mut composed = self.search_paths.clone();
        for handle in &inheritance.0 {
            composed.extend(handle.search_paths.clone());
        }
        composed
    }
}

/// An ordered list of additional environment roots whose search paths are appended, in order,
/// after the primary handle's own search paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritanceList(pub Vec<EnvironmentHandle>);

impl InheritanceList {
    pub fn new(handles: Vec<EnvironmentHandle>) -> Self {
        InheritanceList(handles)
    }

    pub fn empty() -> Self {
        InheritanceList(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_independent_of_insertion_order() {
        let a = EnvironmentDescription::new("virtual-runtime")
            .with_config("packages", json!(["a", "b"]))
            .with_config("python", json!("3.11"));
        let b = EnvironmentDescription::new("virtual-runtime")
            .with_config("python", json!("3.11"))
            .with_config("packages", json!(["a", "b"]));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn remote_fingerprint_differs_by_host_for_the_same_inner_description() {
        let inner = EnvironmentDescription::new("virtual-runtime").with_config("python", json!("3.11"));
        let a = EnvironmentDescription::remote("host-a:9443", &inner);
        let b = EnvironmentDescription::remote("host-b:9443", &inner);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.remote_inner().unwrap(), inner);
        assert_eq!(b.remote_host(), Some("host-b:9443"));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = EnvironmentDescription::new("virtual-runtime").with_config("python", json!("3.11"));
        let b = EnvironmentDescription::new("virtual-runtime").with_config("python", json!("3.12"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn effective_search_path_orders_primary_then_inheritance() {
        let primary = EnvironmentHandle {
            fingerprint: hashing::EMPTY_FINGERPRINT,
            root_path: PathBuf::from("/cache/k/f1"),
            runtime_bin: PathBuf::from("/cache/k/f1/bin/run"),
            search_paths: vec![PathBuf::from("/cache/k/f1/lib")],
        };
        let i1 = EnvironmentHandle {
            fingerprint: hashing::EMPTY_FINGERPRINT,
            root_path: PathBuf::from("/cache/k/f2"),
            runtime_bin: PathBuf::from("/cache/k/f2/bin/run"),
            search_paths: vec![PathBuf::from("/cache/k/f2/lib")],
        };
        let i2 = EnvironmentHandle {
            fingerprint: hashing::EMPTY_FINGERPRINT,
            root_path: PathBuf::from("/cache/k/f3"),
            runtime_bin: PathBuf::from("/cache/k/f3/bin/run"),
            search_paths: vec![PathBuf::from("/cache/k/f3/lib")],
        };
        let inheritance = InheritanceList::new(vec![i1.clone(), i2.clone()]);
        let effective = primary.effective_search_path(&inheritance);
        assert_eq!(
            effective,
            vec![
                PathBuf::from("/cache/k/f1/lib"),
                PathBuf::from("/cache/k/f2/lib"),
                PathBuf::from("/cache/k/f3/lib"),
            ]
        );
    }
}
