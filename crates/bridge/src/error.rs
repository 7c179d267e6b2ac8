// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::types::UserException;

/// The execution bridge's error taxonomy. Every variant names the operation that was in
/// progress; `ChildCrashed` and `ProvisionFailed`-style variants additionally carry whatever
/// diagnostic detail (exit status, a stderr tail) was available at the point of failure.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("serialization error while {phase}: {message}")]
    SerializationError { phase: String, message: String },

    #[error("failed to spawn the agent entrypoint: {message}")]
    SpawnFailed { message: String },

    #[error("timed out waiting for the agent entrypoint to connect")]
    HandshakeTimeout,

    #[error("protocol fault while {operation}: {message}")]
    ProtocolFault { operation: String, message: String },

    #[error("child process exited before sending a result (exit status: {exit_status:?})")]
    ChildCrashed { exit_status: Option<i32> },

    #[error("the callable raised {0}")]
    UserException(UserException),
}

impl BridgeError {
    pub fn serialization(phase: impl Into<String>, message: impl std::fmt::Display) -> Self {
        BridgeError::SerializationError {
            phase: phase.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::ProtocolFault {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
