// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Resolves the function name carried by a [`crate::Callable`] to an actual Rust function.
//!
//! This is the agent entrypoint's half of the "callable transport" design: the bridge treats a
//! `Callable` as an opaque blob end to end, but *something* on the child side has to turn
//! `{function: "my_task", args: [...]}` into a call to real code. A `Registry` is that
//! something — a static, compile-time table, not a dynamic plugin loader.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Raised by registered functions to indicate a user-level failure (as opposed to a codec or
/// protocol failure). Carries enough detail for the bridge to re-raise something meaningful in
/// the caller's context.
#[derive(Debug, Clone)]
pub struct UserError {
    pub exception_type: String,
    pub message: String,
}

impl UserError {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        UserError {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

impl std::error::Error for UserError {}

type RegisteredFn = Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, UserError> + Send + Sync>;

/// A static table of callable functions, keyed by name. The agent entrypoint builds one of
/// these at startup and consults it once per session to resolve the `function` field of the
/// `Callable` it received.
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, RegisteredFn>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, UserError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn call(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value, CallError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| CallError::UnknownFunction(name.to_owned()))?;
        function(args).map_err(CallError::User)
    }
}

#[derive(Debug)]
pub enum CallError {
    UnknownFunction(String),
    User(UserError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::UnknownFunction(name) => write!(f, "no function registered with name {name:?}"),
            CallError::User(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CallError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_registered_function() {
        let mut registry = Registry::new();
        registry.register("double", |args| {
            let n = args.as_i64().ok_or_else(|| UserError::new("TypeError", "expected an integer"))?;
            Ok(serde_json::json!(n * 2))
        });

        let result = registry.call("double", serde_json::json!(21)).unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn unknown_function_is_reported() {
        let registry = Registry::new();
        let result = registry.call("missing", serde_json::json!(null));
        assert!(matches!(result, Err(CallError::UnknownFunction(_))));
    }

    #[test]
    fn user_errors_propagate() {
        let mut registry = Registry::new();
        registry.register("fail", |_args| {
            Err(UserError::new("ValueError", "always fails"))
        });
        let result = registry.call("fail", serde_json::json!(null));
        match result {
            Err(CallError::User(e)) => assert_eq!(e.exception_type, "ValueError"),
            _ => panic!("expected a user error"),
        }
    }
}
