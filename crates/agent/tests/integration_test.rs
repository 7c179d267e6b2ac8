// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! End-to-end tests driving the real `capsule-agent` binary through the `bridge` session
//! protocol: a materialized "environment" here is just this crate's own build output, with
//! `runtime_bin` pointed at the binary cargo already built for us.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge::RunOptions;
use codec::{Callable, JsonCodec};
use environment::EnvironmentHandle;
use logpipe::{LogRecord, LogSink};

fn agent_handle() -> EnvironmentHandle {
    EnvironmentHandle {
        fingerprint: hashing::EMPTY_FINGERPRINT,
        root_path: PathBuf::from(env!("CARGO_MANIFEST_DIR")),
        runtime_bin: PathBuf::from(env!("CARGO_BIN_EXE_capsule-agent")),
        search_paths: Vec::new(),
    }
}

/// A sink that just remembers every record it's given, for assertions.
#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<LogRecord>>>);

impl LogSink for RecordingSink {
    fn record(&self, record: LogRecord) {
        self.0.lock().unwrap().push(record);
    }
}

fn options() -> RunOptions {
    RunOptions::new(Arc::new(JsonCodec)).with_ignore_exceptions(false)
}

#[tokio::test]
async fn runs_a_registered_function_and_decodes_its_result() {
    let handle = agent_handle();
    let callable = Callable {
        function: "add".to_owned(),
        args: serde_json::json!([1, 2]),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let outcome = bridge::run(&handle, &callable, sink, &options()).await.unwrap();

    match outcome {
        bridge::ExecutionOutcome::Value(value) => assert_eq!(value, serde_json::json!(3)),
        other => panic!("expected a value, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_function_surfaces_as_a_bridge_error() {
    let handle = agent_handle();
    let callable = Callable {
        function: "does-not-exist".to_owned(),
        args: serde_json::json!(null),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let result = bridge::run(&handle, &callable, sink, &options()).await;
    assert!(result.is_err(), "expected an error, got {result:?}");
}

#[tokio::test]
async fn user_exception_propagates_as_a_bridge_error_by_default() {
    let handle = agent_handle();
    let callable = Callable {
        function: "divide".to_owned(),
        args: serde_json::json!([1, 0]),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let result = bridge::run(&handle, &callable, sink, &options()).await;
    match result {
        Err(bridge::BridgeError::UserException(cause)) => {
            assert_eq!(cause.exception_type, "ZeroDivisionError");
        }
        other => panic!("expected a user exception, got {other:?}"),
    }
}

#[tokio::test]
async fn user_exception_is_reified_when_ignore_exceptions_is_set() {
    let handle = agent_handle();
    let callable = Callable {
        function: "divide".to_owned(),
        args: serde_json::json!([1, 0]),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());
    let options = options().with_ignore_exceptions(true);

    let outcome = bridge::run(&handle, &callable, sink, &options).await.unwrap();
    match outcome {
        bridge::ExecutionOutcome::UserException(cause) => {
            assert_eq!(cause.exception_type, "ZeroDivisionError");
        }
        other => panic!("expected a reified user exception, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_runtime_binary_reports_spawn_failure() {
    let mut handle = agent_handle();
    handle.runtime_bin = PathBuf::from("/nonexistent/not-a-real-binary");
    let callable = Callable {
        function: "add".to_owned(),
        args: serde_json::json!([1, 2]),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let result = bridge::run(&handle, &callable, sink, &options()).await;
    assert!(matches!(result, Err(bridge::BridgeError::SpawnFailed { .. })));
}

#[tokio::test]
async fn handshake_timeout_is_honored() {
    // Pointing `runtime_bin` at something that never connects back (here, a no-op shell command)
    // should time out rather than hang, exercising the bounded-wait path without needing a
    // purpose-built hanging binary.
    let mut handle = agent_handle();
    handle.runtime_bin = PathBuf::from("/bin/true");
    let callable = Callable {
        function: "add".to_owned(),
        args: serde_json::json!([1, 2]),
    };
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());
    let mut options = options();
    options.handshake_timeout = Duration::from_millis(200);

    let result = bridge::run(&handle, &callable, sink, &options).await;
    assert!(
        matches!(result, Err(bridge::BridgeError::HandshakeTimeout)),
        "expected a handshake timeout, got {result:?}"
    );
}
