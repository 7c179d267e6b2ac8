// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bridge::UserException;

/// The remote facade's own error taxonomy, distinct from [`bridge::BridgeError`]: it additionally
/// has to account for the channel itself misbehaving, on top of everything that can go wrong in
/// the session the server runs on our behalf.
#[derive(thiserror::Error, Debug)]
pub enum RemoteFacadeError {
    #[error("remote channel failed: {0}")]
    ChannelFailed(String),

    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    #[error("serialization error while {phase}: {message}")]
    SerializationError { phase: String, message: String },

    #[error("the callable raised {0}")]
    UserException(UserException),
}

impl RemoteFacadeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RemoteFacadeError::ProtocolFault(message.into())
    }

    pub fn serialization(phase: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RemoteFacadeError::SerializationError {
            phase: phase.into(),
            message: message.to_string(),
        }
    }
}
