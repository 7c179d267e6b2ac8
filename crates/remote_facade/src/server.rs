// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The server half of the remote facade: materializes the inner environment named by an
//! incoming request, runs it through the execution bridge, and streams logs as they arrive
//! followed by exactly one terminal frame.

use std::pin::Pin;
use std::sync::Arc;

use bridge::{BridgeError, ExecutionOutcome, RunOptions};
use codec::{Callable, Codec};
use environment::EnvironmentManager;
use logpipe::{LogRecord, LogSink};
use protos::gen::capsule::remote::v1 as pb;
use serde_json::json;
use task_executor::TailTasks;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::convert::{description_from_proto, log_record_to_proto};

const LOG_CHANNEL_CAPACITY: usize = 64;

/// The gRPC service implementation. One instance is shared (via `Arc`, internally) across all
/// connections; besides a handle to the environment cache, it tracks its own in-flight per-call
/// streaming tasks as `TailTasks` so a server shutdown can give them a bounded grace period to
/// finish draining rather than aborting mid-stream.
pub struct RemoteFacadeServer {
    manager: Arc<EnvironmentManager>,
    tasks: TailTasks,
}

impl RemoteFacadeServer {
    pub fn new(manager: Arc<EnvironmentManager>) -> Self {
        RemoteFacadeServer {
            manager,
            tasks: TailTasks::new(),
        }
    }

    /// Waits, up to `timeout`, for every in-flight `run` call's streaming task to finish on its
    /// own before the caller tears down the server. Tasks that are still running when `timeout`
    /// elapses are aborted.
    pub async fn shutdown(&self, timeout: std::time::Duration) {
        self.tasks.clone().wait(timeout).await;
    }
}

/// Forwards each `LogRecord` into the response stream as a non-terminal `PartialResult`,
/// from whichever thread the Log Pipe's readers call it on.
struct StreamingSink {
    tx: mpsc::Sender<Result<pb::PartialResult, Status>>,
}

impl LogSink for StreamingSink {
    fn record(&self, record: LogRecord) {
        let frame = pb::PartialResult {
            logs: vec![log_record_to_proto(&record)],
            result: None,
            is_complete: false,
        };
        // The Log Pipe's readers call this from plain OS threads, never from a tokio worker, so
        // blocking here does not stall the runtime. A full channel just backpressures the child.
        let _ = self.tx.blocking_send(Ok(frame));
    }
}

#[tonic::async_trait]
impl pb::capsule_remote_server::CapsuleRemote for RemoteFacadeServer {
    type RunStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<pb::PartialResult, Status>> + Send + 'static>>;

    async fn run(&self, request: Request<pb::BoundFunction>) -> Result<Response<Self::RunStream>, Status> {
        let bound = request.into_inner();
        let description = description_from_proto(
            bound
                .environment_description
                .ok_or_else(|| Status::invalid_argument("missing environment_description"))?,
        )
        .map_err(Status::invalid_argument)?;
        let codec = codec::lookup(&bound.codec)
            .ok_or_else(|| Status::invalid_argument(format!("unknown codec {:?}", bound.codec)))?;
        let callable = codec
            .decode_callable(&bound.encoded_callable)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let manager = self.manager.clone();
        self.tasks.spawn_on(
            "remote-facade-run",
            &Handle::current(),
            run_and_stream(manager, description, callable, codec, tx),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

async fn run_and_stream(
    manager: Arc<EnvironmentManager>,
    description: environment::EnvironmentDescription,
    callable: Callable,
    codec: Arc<dyn Codec>,
    tx: mpsc::Sender<Result<pb::PartialResult, Status>>,
) {
    let handle = match manager.materialize(&description, true).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = tx.send(Err(Status::internal(format!("materializing the environment: {e}")))).await;
            return;
        }
    };

    let sink: Arc<dyn LogSink> = Arc::new(StreamingSink { tx: tx.clone() });
    let options = RunOptions::new(codec.clone()).with_ignore_exceptions(true);

    let terminal = match bridge::run(&handle, &callable, sink, &options).await {
        Ok(ExecutionOutcome::Value(value)) => codec
            .encode_value(&value)
            .map(|payload| pb::ResultPayload {
                payload,
                codec: codec.name().to_owned(),
                was_raised: false,
            })
            .map_err(|e| Status::internal(format!("encoding the result: {e}"))),
        Ok(ExecutionOutcome::UserException(cause)) => encode_exception(&codec, &cause.exception_type, &cause.message)
            .map_err(|e| Status::internal(format!("encoding the raised exception: {e}"))),
        Err(BridgeError::UserException(cause)) => {
            encode_exception(&codec, &cause.exception_type, &cause.message)
                .map_err(|e| Status::internal(format!("encoding the raised exception: {e}")))
        }
        Err(e) => Err(Status::internal(e.to_string())),
    };

    let frame = match terminal {
        Ok(result) => Ok(pb::PartialResult {
            logs: Vec::new(),
            result: Some(result),
            is_complete: true,
        }),
        Err(status) => Err(status),
    };
    let _ = tx.send(frame).await;
}

fn encode_exception(codec: &Arc<dyn Codec>, exception_type: &str, message: &str) -> Result<pb::ResultPayload, codec::CodecError> {
    let value = json!({ "exception_type": exception_type, "message": message });
    let payload = codec.encode_value(&value)?;
    Ok(pb::ResultPayload {
        payload,
        codec: codec.name().to_owned(),
        was_raised: true,
    })
}
