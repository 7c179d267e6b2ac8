// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! Fingerprinting and cached provisioning of execution environments.
//!
//! Cache layout under `cache_root`:
//!
//! ```text
//! <cache_root>/
//!   <kind>/
//!     <fingerprint>/           # materialized env (atomic)
//!       bin/<runtime_bin>
//!       <libdir>/...
//!       .layout.json           # sidecar recording runtime_bin/search_paths relative paths
//!       .ready                 # marker file; absence => not materialized
//!     .lock-<fingerprint>      # advisory exclusive lock
//!     .scratch-<fingerprint>-<pid>/   # pre-rename staging
//! ```

mod backend;
mod config;
mod error;
mod manager;
mod types;

pub use backend::{default_registry, Backend, ProvisionedLayout, Registry};
pub use config::default_cache_root;
pub use error::EnvironmentError;
pub use manager::EnvironmentManager;
pub use types::{EnvironmentDescription, EnvironmentHandle, InheritanceList};

pub use hashing::Fingerprint;
