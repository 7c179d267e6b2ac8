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

//! A reference implementation of the agent entrypoint contract described alongside the
//! execution bridge: connect to the address the controller passed on argv, receive one framed
//! `CallRequest`, execute it under a top-level catch, send one framed `CallResult`, close.
//!
//! The real system treats this process as an external collaborator -- in a dynamic-language
//! deployment it is whatever interpreter the materialized environment names. This crate exists
//! so the `bridge` crate's session protocol has a real, Rust-native peer to test against, and so
//! a caller who wants to run statically-known Rust functions through the bridge has a concrete
//! entrypoint to point `runtime_bin` at.

use std::sync::Arc;

use codec::registry::{CallError, Registry, UserError};
use codec::Codec;
use serde_json::json;
use tokio::net::UnixStream;

/// Parses the argv this process was handed, per the contract `-m <entrypoint> <encoded_address>
/// <codec_name>`. `args` excludes argv[0] (the program name).
pub fn parse_args(args: &[String]) -> Result<(String, String), String> {
    match args {
        [flag, _entrypoint, encoded_address, codec_name] if flag == "-m" => {
            Ok((encoded_address.clone(), codec_name.clone()))
        }
        other => Err(format!(
            "expected `-m <entrypoint> <encoded_address> <codec_name>`, got {other:?}"
        )),
    }
}

/// Connects to the bridge socket named by `args`, executes the one call it receives against
/// `registry`, and sends back exactly one result frame.
pub async fn serve(args: &[String], registry: &Registry) -> Result<(), String> {
    let (encoded_address, codec_name) = parse_args(args)?;
    let address = bridge::decode_address(&encoded_address)?;
    let codec = codec::lookup(&codec_name).ok_or_else(|| format!("unknown codec {codec_name:?}"))?;

    let stream = UnixStream::connect(&address)
        .await
        .map_err(|e| format!("connecting to the bridge socket at {address}: {e}"))?;
    let mut transport = bridge::framed(stream);

    let request = bridge::recv_request(&mut transport)
        .await
        .map_err(|e| e.to_string())?;

    let result = handle_request(&request, &codec, registry);

    bridge::send_result(&mut transport, &result)
        .await
        .map_err(|e| e.to_string())
}

fn handle_request(request: &bridge::CallRequest, codec: &Arc<dyn Codec>, registry: &Registry) -> bridge::CallResult {
    if request.was_raised {
        // The payload already decodes to a pre-raised exception; our contract is to hand it
        // straight back as a user exception rather than attempt to call it.
        return bridge::CallResult::Err {
            payload: request.payload.clone(),
            codec: request.codec.clone(),
            is_user_exception: true,
        };
    }

    let callable = match codec.decode_callable(&request.payload) {
        Ok(callable) => callable,
        Err(e) => return infra_error(codec, format!("decoding the callable: {e}")),
    };

    match registry.call(&callable.function, callable.args) {
        Ok(value) => match codec.encode_value(&value) {
            Ok(payload) => bridge::CallResult::Ok {
                payload,
                codec: codec.name().to_owned(),
            },
            Err(e) => infra_error(codec, format!("encoding the result: {e}")),
        },
        Err(CallError::User(UserError { exception_type, message })) => {
            user_exception(codec, &exception_type, &message)
        }
        Err(CallError::UnknownFunction(name)) => {
            infra_error(codec, format!("no function registered with name {name:?}"))
        }
    }
}

fn user_exception(codec: &Arc<dyn Codec>, exception_type: &str, message: &str) -> bridge::CallResult {
    exception_result(codec, exception_type, message, true)
}

fn infra_error(codec: &Arc<dyn Codec>, message: impl Into<String>) -> bridge::CallResult {
    exception_result(codec, "AgentError", &message.into(), false)
}

fn exception_result(
    codec: &Arc<dyn Codec>,
    exception_type: &str,
    message: &str,
    is_user_exception: bool,
) -> bridge::CallResult {
    let value = json!({ "exception_type": exception_type, "message": message });
    match codec.encode_value(&value) {
        Ok(payload) => bridge::CallResult::Err {
            payload,
            codec: codec.name().to_owned(),
            is_user_exception,
        },
        Err(_) => bridge::CallResult::Err {
            payload: exception_type.as_bytes().to_vec(),
            codec: "json".to_owned(),
            is_user_exception: false,
        },
    }
}

/// A small registry of demonstration functions, used by the `capsule-agent` binary and by this
/// crate's own tests. `divide` in particular exists so that integration tests can exercise the
/// user-exception path without inventing a fake failure.
pub fn demo_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("add", |args| {
        let pair = args
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| UserError::new("TypeError", "add expects a 2-element array"))?;
        let a = pair[0]
            .as_i64()
            .ok_or_else(|| UserError::new("TypeError", "expected an integer"))?;
        let b = pair[1]
            .as_i64()
            .ok_or_else(|| UserError::new("TypeError", "expected an integer"))?;
        Ok(json!(a + b))
    });
    registry.register("divide", |args| {
        let pair = args
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| UserError::new("TypeError", "divide expects a 2-element array"))?;
        let a = pair[0]
            .as_i64()
            .ok_or_else(|| UserError::new("TypeError", "expected an integer"))?;
        let b = pair[1]
            .as_i64()
            .ok_or_else(|| UserError::new("TypeError", "expected an integer"))?;
        if b == 0 {
            return Err(UserError::new("ZeroDivisionError", "division by zero"));
        }
        Ok(json!(a / b))
    });
    registry.register("echo", |args| Ok(args));
    registry
}
