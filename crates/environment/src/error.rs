// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

/// The error taxonomy for environment materialization. Every variant carries a human-readable
/// message naming the operation in progress; callers should match on the variant rather than on
/// message text.
#[derive(thiserror::Error, Debug)]
pub enum EnvironmentError {
    #[error("environment already exists at {path} and exist_ok was not set")]
    AlreadyExists { path: std::path::PathBuf },

    #[error("timed out acquiring the provisioning lock for fingerprint {fingerprint}")]
    Busy { fingerprint: String },

    #[error("provisioning failed (exit code {exit_code:?}) while {operation}: {stderr}")]
    ProvisionFailed {
        operation: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("no backend is registered for environment kind {kind:?}")]
    UnknownKind { kind: String },

    #[error("i/o error while {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl EnvironmentError {
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        EnvironmentError::Io {
            operation: operation.into(),
            source,
        }
    }
}
