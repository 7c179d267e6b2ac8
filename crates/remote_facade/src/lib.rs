// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! The remote facade: a streaming gRPC client/server pair that lets one runtime delegate the
//! environment manager and execution bridge to a peer. The server materializes the inner
//! environment and runs the bridge on the caller's behalf; the client streams the resulting log
//! frames to its own sink and returns the single terminal result, exactly as a local
//! [`bridge::run`] call would.

mod client;
mod convert;
mod error;
mod server;

pub use client::RemoteFacadeClient;
pub use error::RemoteFacadeError;
pub use server::RemoteFacadeServer;
