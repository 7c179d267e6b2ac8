// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde::{Deserialize, Serialize};

/// The envelope sent from the controller to the agent entrypoint: a codec-encoded payload plus
/// enough metadata for the agent to decode and (if `was_raised`) re-raise it rather than call
/// it. This is the wire form of "a zero-argument callable or a pre-raised exception instance".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub payload: Vec<u8>,
    pub codec: String,
    pub was_raised: bool,
}

impl CallRequest {
    pub fn new(payload: Vec<u8>, codec: impl Into<String>) -> Self {
        CallRequest {
            payload,
            codec: codec.into(),
            was_raised: false,
        }
    }
}

/// The envelope sent back from the agent entrypoint: either the callable's return value, or an
/// error — distinguishing a normal user exception (`is_user_exception = true`) from a bridge or
/// infrastructure failure that happened to occur inside the child (`false`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallResult {
    Ok {
        payload: Vec<u8>,
        codec: String,
    },
    Err {
        payload: Vec<u8>,
        codec: String,
        is_user_exception: bool,
    },
}

/// A decoded, caught exception the callable raised, reified into a value rather than
/// re-thrown. Produced only when `RunOptions::ignore_exceptions` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserException {
    pub exception_type: String,
    pub message: String,
}

impl std::fmt::Display for UserException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

/// What a completed, successful call produced: either the callable's own return value, or (with
/// `ignore_exceptions` set) the exception it raised, reified rather than propagated.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Value(serde_json::Value),
    UserException(UserException),
}
