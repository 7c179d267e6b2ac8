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

//! The codec collaborator: the sole place that knows how to turn a `Callable` or a return value
//! into bytes and back. The execution bridge never inspects a callable's contents — it only
//! ever moves the bytes a `Codec` produced from one place to another.
//!
//! Rust has no runtime representation of an arbitrary closure the way a dynamic language does,
//! so `Callable` stands in for "the thing to call": a named, registered function plus its
//! already-serialized arguments. A `Codec` is responsible for turning that (and the function's
//! eventual return value) into the bytes that cross the wire; resolving the function name to an
//! actual Rust function is the separate concern of a `Registry` (see [`registry`]).

pub mod registry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// A named function call: the statically-typed substitute for an arbitrary serialized closure.
/// `function` names an entry in a [`registry::Registry`]; `args` is whatever that function's
/// codec-specific argument representation is (typically a JSON value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callable {
    pub function: String,
    pub args: serde_json::Value,
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("while {operation}: {message}")]
    Failed { operation: String, message: String },
}

impl CodecError {
    pub fn new(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        CodecError::Failed {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

/// The interchangeable `{encode, decode}` collaborator named throughout the rest of this system.
/// Implementations are looked up by name (see [`lookup`]) so that the bridge and remote facade
/// can pass a bare `codec_name: &str` across process and wire boundaries instead of a live trait
/// object.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn encode_callable(&self, callable: &Callable) -> Result<Vec<u8>, CodecError>;
    fn decode_callable(&self, bytes: &[u8]) -> Result<Callable, CodecError>;

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;
    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// The default, always-available codec: plain JSON. Portable and human-readable, at the cost of
/// being unable to represent non-JSON-expressible argument/return shapes.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode_callable(&self, callable: &Callable) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(callable).map_err(|e| CodecError::new("encoding the callable", e))
    }

    fn decode_callable(&self, bytes: &[u8]) -> Result<Callable, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::new("decoding the callable", e))
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::new("encoding the return value", e))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::new("decoding the return value", e))
    }
}

/// A more compact binary codec built on `bincode`. `bincode` cannot deserialize a self-describing
/// type like `serde_json::Value` directly -- its `Deserialize` impl calls
/// `deserialize_any`, which `bincode` explicitly does not support -- so this codec frames the
/// same JSON rendering [`JsonCodec`] would produce inside a length-prefixed `bincode` envelope
/// rather than handing `Value`/`Callable` to `bincode` as the top-level type. That keeps the
/// payload dense for the parts of a message that aren't already JSON text, while staying
/// round-trippable for arbitrary JSON-representable values.
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn name(&self) -> &str {
        "bincode"
    }

    fn encode_callable(&self, callable: &Callable) -> Result<Vec<u8>, CodecError> {
        encode_json_framed(callable, "encoding the callable")
    }

    fn decode_callable(&self, bytes: &[u8]) -> Result<Callable, CodecError> {
        decode_json_framed(bytes, "decoding the callable")
    }

    fn encode_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        encode_json_framed(value, "encoding the return value")
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        decode_json_framed(bytes, "decoding the return value")
    }
}

fn encode_json_framed<T: Serialize>(value: &T, operation: &str) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(value).map_err(|e| CodecError::new(operation, e))?;
    bincode::serialize(&json).map_err(|e| CodecError::new(operation, e))
}

fn decode_json_framed<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    operation: &str,
) -> Result<T, CodecError> {
    let json: Vec<u8> = bincode::deserialize(bytes).map_err(|e| CodecError::new(operation, e))?;
    serde_json::from_slice(&json).map_err(|e| CodecError::new(operation, e))
}

fn built_in_codecs() -> &'static HashMap<&'static str, Arc<dyn Codec>> {
    static CODECS: OnceLock<HashMap<&'static str, Arc<dyn Codec>>> = OnceLock::new();
    CODECS.get_or_init(|| {
        let mut codecs: HashMap<&'static str, Arc<dyn Codec>> = HashMap::new();
        codecs.insert("json", Arc::new(JsonCodec));
        codecs.insert("bincode", Arc::new(BincodeCodec));
        codecs
    })
}

/// Looks up a codec by the name carried in a `CallRequest`/`CallResult`/wire frame.
pub fn lookup(name: &str) -> Option<Arc<dyn Codec>> {
    built_in_codecs().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips_callable() {
        let codec = JsonCodec;
        let callable = Callable {
            function: "double".to_owned(),
            args: serde_json::json!([21]),
        };
        let bytes = codec.encode_callable(&callable).unwrap();
        let decoded = codec.decode_callable(&bytes).unwrap();
        assert_eq!(decoded.function, "double");
        assert_eq!(decoded.args, serde_json::json!([21]));
    }

    #[test]
    fn bincode_codec_round_trips_value() {
        let codec = BincodeCodec;
        let value = serde_json::json!({"ok": true, "n": 3});
        let bytes = codec.encode_value(&value).unwrap();
        let decoded = codec.decode_value(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn bincode_codec_round_trips_callable_with_nested_json_value() {
        // A `serde_json::Value` is self-describing, and `bincode` cannot deserialize a
        // self-describing type as its top-level target -- this regresses that specific failure
        // mode by round-tripping a `Callable` whose `args` is a nested object/array mix.
        let codec = BincodeCodec;
        let callable = Callable {
            function: "process".to_owned(),
            args: serde_json::json!({"items": [1, 2, 3], "label": "batch"}),
        };
        let bytes = codec.encode_callable(&callable).unwrap();
        let decoded = codec.decode_callable(&bytes).unwrap();
        assert_eq!(decoded.function, "process");
        assert_eq!(decoded.args, callable.args);
    }

    #[test]
    fn malformed_bytes_surface_as_codec_error_for_every_built_in_codec() {
        for name in ["json", "bincode"] {
            let codec = lookup(name).unwrap();
            let result = codec.decode_callable(b"not a valid encoding of anything");
            assert!(result.is_err(), "codec {name:?} should have rejected garbage bytes");
        }
    }

    #[test]
    fn lookup_finds_built_ins_and_rejects_unknown() {
        assert!(lookup("json").is_some());
        assert!(lookup("bincode").is_some());
        assert!(lookup("msgpack").is_none());
    }
}
