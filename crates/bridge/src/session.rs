// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use children::ManagedChild;
use codec::{Callable, Codec};
use environment::{EnvironmentHandle, InheritanceList};
use logpipe::{Level, LogPipe, LogRecord, LogSink, Source};
use tokio::net::UnixListener;
use tokio::process::Command;

use crate::address::encode_address;
use crate::error::BridgeError;
use crate::types::{CallRequest, CallResult, ExecutionOutcome, UserException};
use crate::wire;

/// The default module path passed to the agent entrypoint when the caller doesn't override it.
pub const DEFAULT_AGENT_ENTRYPOINT: &str = "capsule_agent";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHILD_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_LOG_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// The session's progress, mirroring the state machine named in the design:
/// `CREATED -> LISTENING -> CHILD_SPAWNED -> CONNECTED -> REQUEST_SENT -> RESULT_RECEIVED ->
/// CLOSED`, with terminal error states reached on any bounded wait timing out. Exposed for
/// logging and tests; callers never construct or match on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Listening,
    ChildSpawned,
    Connected,
    RequestSent,
    ResultReceived,
    Closed,
    SpawnFailed,
    HandshakeFailed,
    ProtocolFault,
    ChildCrashed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-call options for [`run`]. `codec` selects both how the callable is encoded on the way in
/// and how the bridge interprets the `codec` field the agent reports back on the way out.
pub struct RunOptions {
    pub codec: Arc<dyn Codec>,
    pub inheritance: InheritanceList,
    pub ignore_exceptions: bool,
    pub agent_entrypoint: String,
    pub handshake_timeout: Duration,
    pub child_grace: Duration,
    pub kill_grace: Duration,
    pub log_drain_grace: Duration,
}

impl RunOptions {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        RunOptions {
            codec,
            inheritance: InheritanceList::empty(),
            ignore_exceptions: false,
            agent_entrypoint: DEFAULT_AGENT_ENTRYPOINT.to_owned(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            child_grace: DEFAULT_CHILD_GRACE,
            kill_grace: DEFAULT_KILL_GRACE,
            log_drain_grace: DEFAULT_LOG_DRAIN_GRACE,
        }
    }

    pub fn with_inheritance(mut self, inheritance: InheritanceList) -> Self {
        self.inheritance = inheritance;
        self
    }

    pub fn with_ignore_exceptions(mut self, ignore_exceptions: bool) -> Self {
        self.ignore_exceptions = ignore_exceptions;
        self
    }
}

/// The platform-standard variable name injected into the child for library lookup, overridable
/// via the `SEARCH_PATH_VAR` environment variable (its *value* names the variable to set, e.g.
/// `PYTHONPATH` for a Python runtime).
fn search_path_env_name() -> String {
    std::env::var("SEARCH_PATH_VAR").unwrap_or_else(|_| "CAPSULE_LIBRARY_PATH".to_owned())
}

/// Runs `callable` inside `handle`'s environment, relaying the child's stdout/stderr to `sink`
/// as `LogRecord`s and returning its decoded result.
///
/// Every bounded wait in the session protocol (handshake, result frame, child exit, log drain)
/// is bounded by the corresponding field of `options`; exceeding one transitions the session to
/// its terminal error state and unwinds everything spawned so far (listener, child, log
/// readers) before returning.
pub async fn run(
    handle: &EnvironmentHandle,
    callable: &Callable,
    sink: Arc<dyn LogSink>,
    options: &RunOptions,
) -> Result<ExecutionOutcome, BridgeError> {
    let mut state = SessionState::Created;
    log::trace!("bridge session: {state}");

    // Step 1: serialize the callable. No child is spawned if this fails.
    let payload = options.codec.encode_callable(callable).map_err(|e| {
        BridgeError::serialization("preparing the codec and encoding the callable", e)
    })?;
    let request = CallRequest::new(payload, options.codec.name());

    // Step 2: open the listener under a private, auto-removed temp directory.
    let socket_dir = tempfile::Builder::new()
        .prefix("capsule-bridge-")
        .tempdir()
        .map_err(|e| BridgeError::SpawnFailed {
            message: format!("creating the bridge socket directory: {e}"),
        })?;
    let socket_path = socket_dir.path().join("bridge.sock");
    let listener = UnixListener::bind(&socket_path).map_err(|e| BridgeError::SpawnFailed {
        message: format!("binding the bridge socket: {e}"),
    })?;
    state = SessionState::Listening;
    log::trace!("bridge session: {state}");

    let encoded_address = encode_address(&socket_path.to_string_lossy());

    // Step 3: spawn the child, with the composed search path and the Log Pipe's write ends
    // wired up as its stdout/stderr.
    let (log_pipe, writers) = LogPipe::new(sink.clone()).map_err(|e| BridgeError::SpawnFailed {
        message: format!("creating the log pipe: {e}"),
    })?;

    let search_path = handle.effective_search_path(&options.inheritance);
    let search_path_joined = std::env::join_paths(&search_path)
        .map_err(|e| BridgeError::SpawnFailed {
            message: format!("composing the search path: {e}"),
        })?;

    let mut command = Command::new(&handle.runtime_bin);
    command
        .arg("-m")
        .arg(&options.agent_entrypoint)
        .arg(&encoded_address)
        .arg(options.codec.name())
        .env(search_path_env_name(), search_path_joined)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writers.stdout))
        .stderr(Stdio::from(writers.stderr));

    let mut child = match ManagedChild::spawn(command, options.kill_grace) {
        Ok(child) => child,
        Err(message) => {
            state = SessionState::SpawnFailed;
            log::trace!("bridge session: {state}");
            let _ = log_pipe.join(options.log_drain_grace);
            return Err(BridgeError::SpawnFailed { message });
        }
    };
    state = SessionState::ChildSpawned;
    log::trace!("bridge session: {state}");

    // Step 4: accept exactly one connection, send the request, and await exactly one result
    // frame. Any failure here tears down the child and log pipe before returning.
    let session_result = run_session(&mut child, &listener, &request, options, &mut state).await;

    // Step 5 + 6: close, wait for the child, then stop logging -- unconditionally, on every
    // exit path, successful or not.
    teardown_child(child, options).await;
    if let Err(timeout_err) = log_pipe.join(options.log_drain_grace) {
        if session_result.is_ok() {
            log::warn!("log drain did not finish within its grace period: {timeout_err}");
        }
    }

    let call_result = session_result?;
    state = SessionState::ResultReceived;
    log::trace!("bridge session: {state}");
    let outcome = decode_result(call_result, options)?;
    state = SessionState::Closed;
    log::trace!("bridge session: {state}");
    Ok(outcome)
}

async fn run_session(
    child: &mut ManagedChild,
    listener: &UnixListener,
    request: &CallRequest,
    options: &RunOptions,
    state: &mut SessionState,
) -> Result<CallResult, BridgeError> {
    let accept = tokio::time::timeout(options.handshake_timeout, listener.accept()).await;
    let stream = match accept {
        Ok(Ok((stream, _addr))) => stream,
        Ok(Err(e)) => {
            *state = SessionState::HandshakeFailed;
            return Err(BridgeError::protocol("accepting the agent connection", e.to_string()));
        }
        Err(_) => {
            *state = SessionState::HandshakeFailed;
            return Err(BridgeError::HandshakeTimeout);
        }
    };
    *state = SessionState::Connected;
    log::trace!("bridge session: {state}");

    let mut transport = wire::framed(stream);
    wire::send_request(&mut transport, request).await.map_err(|e| {
        *state = SessionState::ProtocolFault;
        e
    })?;
    *state = SessionState::RequestSent;
    log::trace!("bridge session: {state}");

    let recv = tokio::time::timeout(options.handshake_timeout, wire::recv_exactly_one_result(&mut transport)).await;
    match recv {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => {
            *state = SessionState::ProtocolFault;
            Err(e)
        }
        Err(_) => {
            // The child may simply have crashed without ever writing a result.
            let exit_status = child.try_wait().ok().flatten().map(|s| s.code().unwrap_or(-1));
            *state = SessionState::ChildCrashed;
            Err(BridgeError::ChildCrashed { exit_status })
        }
    }
}

async fn teardown_child(mut child: ManagedChild, options: &RunOptions) {
    if tokio::time::timeout(options.child_grace, child.wait()).await.is_ok() {
        return;
    }
    log::warn!("agent entrypoint did not exit within its grace period; terminating it");
    // `graceful_shutdown_sync` sends SIGINT, waits, then escalates to SIGKILL -- all
    // bounded, synchronous work, so it runs on a blocking thread rather than stalling the
    // executor driving this session.
    match tokio::task::spawn_blocking(move || child.graceful_shutdown_sync()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("failed to terminate a hung agent entrypoint: {e}"),
        Err(join_err) => log::warn!("graceful shutdown task panicked: {join_err}"),
    }
}

fn decode_result(result: CallResult, options: &RunOptions) -> Result<ExecutionOutcome, BridgeError> {
    match result {
        CallResult::Ok { payload, codec } => {
            let codec_impl = resolve_codec(&codec, options)?;
            let value = codec_impl
                .decode_value(&payload)
                .map_err(|e| BridgeError::serialization("decoding the result", e))?;
            Ok(ExecutionOutcome::Value(value))
        }
        CallResult::Err {
            payload,
            codec,
            is_user_exception,
        } => {
            let codec_impl = resolve_codec(&codec, options)?;
            let value = codec_impl
                .decode_value(&payload)
                .map_err(|e| BridgeError::serialization("decoding the raised exception", e))?;
            let exception_type = value
                .get("exception_type")
                .and_then(|v| v.as_str())
                .unwrap_or("Exception")
                .to_owned();
            let message = value
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_owned();

            if is_user_exception {
                let cause = UserException { exception_type, message };
                if options.ignore_exceptions {
                    Ok(ExecutionOutcome::UserException(cause))
                } else {
                    Err(BridgeError::UserException(cause))
                }
            } else {
                // A bridge/infrastructure failure is always surfaced, regardless of
                // `ignore_exceptions`.
                Err(BridgeError::serialization(
                    "inside the agent entrypoint",
                    format!("{exception_type}: {message}"),
                ))
            }
        }
    }
}

fn resolve_codec(name: &str, options: &RunOptions) -> Result<Arc<dyn Codec>, BridgeError> {
    if name == options.codec.name() {
        return Ok(options.codec.clone());
    }
    codec::lookup(name)
        .ok_or_else(|| BridgeError::serialization("decoding the result", format!("unknown codec {name:?}")))
}

/// Emits a `LogRecord` attributed to the bridge itself (as opposed to the child's stdout or
/// stderr), used for session-lifecycle diagnostics the caller's sink should also see.
pub fn bridge_log(sink: &dyn LogSink, level: Level, message: impl Into<String>) {
    sink.record(LogRecord::new(level, Source::Bridge, message));
}
