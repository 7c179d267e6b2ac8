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

//! The inter-process execution bridge: spawns the agent entrypoint for a materialized
//! environment, transports a serialized callable to it over a local Unix-domain-socket bridge,
//! relays its stdout/stderr through the Log Pipe, and decodes its final result (or re-raises its
//! captured exception).
//!
//! This crate owns the controller side of the bridge session protocol described by the crate's
//! design: `CREATED -> LISTENING -> CHILD_SPAWNED -> CONNECTED -> REQUEST_SENT ->
//! RESULT_RECEIVED -> CLOSED`. The agent entrypoint itself -- the process on the other end of
//! the socket -- is a separate collaborator; see the `agent` crate for a reference
//! implementation used by this crate's own integration tests.

mod address;
mod error;
mod session;
mod types;
mod wire;

pub use address::{decode_address, encode_address};
pub use error::BridgeError;
pub use session::{bridge_log, run, RunOptions, SessionState, DEFAULT_AGENT_ENTRYPOINT};
pub use types::{CallRequest, CallResult, ExecutionOutcome, UserException};
pub use wire::{framed, recv_exactly_one_result, recv_request, send_request, send_result, Transport};
