// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The client half of the remote facade: opens (or reuses) a channel to a peer, sends one
//! `BoundFunction`, and forwards the resulting stream to the caller's sink, decoding the
//! terminal frame into an [`bridge::ExecutionOutcome`].

use std::sync::Arc;

use bridge::{ExecutionOutcome, UserException};
use codec::{Callable, Codec};
use environment::EnvironmentDescription;
use logpipe::LogSink;
use protos::gen::capsule::remote::v1 as pb;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::convert::{description_to_proto, log_record_from_proto};
use crate::error::RemoteFacadeError;

/// A lazily-connected handle to a remote facade peer. Cheap to clone: the underlying `tonic`
/// channel multiplexes independently of this wrapper.
#[derive(Clone)]
pub struct RemoteFacadeClient {
    channel: Channel,
}

impl RemoteFacadeClient {
    /// Opens a channel to `endpoint` (e.g. `http://host:port`). The connection itself is lazy:
    /// this only validates and parses the URI; the first `run` call performs the actual connect.
    pub fn connect_lazy(endpoint: impl Into<String>) -> Result<Self, RemoteFacadeError> {
        let endpoint = Endpoint::from_shared(endpoint.into())
            .map_err(|e| RemoteFacadeError::ChannelFailed(e.to_string()))?;
        Ok(RemoteFacadeClient {
            channel: endpoint.connect_lazy(),
        })
    }

    /// Runs `callable` against `description` on the remote peer, forwarding every log frame to
    /// `sink` as it arrives and returning the decoded terminal result.
    pub async fn run(
        &self,
        description: &EnvironmentDescription,
        callable: &Callable,
        codec: &Arc<dyn Codec>,
        sink: Arc<dyn LogSink>,
    ) -> Result<ExecutionOutcome, RemoteFacadeError> {
        let mut client = pb::capsule_remote_client::CapsuleRemoteClient::new(self.channel.clone());

        let environment_description = description_to_proto(description)
            .map_err(|e| RemoteFacadeError::serialization("encoding the environment description", e))?;
        let encoded_callable = codec
            .encode_callable(callable)
            .map_err(|e| RemoteFacadeError::serialization("encoding the callable", e))?;

        let request = pb::BoundFunction {
            encoded_callable,
            codec: codec.name().to_owned(),
            environment_description: Some(environment_description),
        };

        let mut stream = client
            .run(Request::new(request))
            .await
            .map_err(|status| RemoteFacadeError::ChannelFailed(status.to_string()))?
            .into_inner();

        let mut terminal: Option<pb::ResultPayload> = None;
        loop {
            let frame = stream
                .message()
                .await
                .map_err(|status| RemoteFacadeError::ChannelFailed(status.to_string()))?;
            let Some(frame) = frame else { break };

            for log in frame.logs {
                sink.record(log_record_from_proto(log));
            }

            if frame.is_complete {
                if terminal.is_some() {
                    return Err(RemoteFacadeError::protocol("multiple terminal frames received"));
                }
                terminal = Some(
                    frame
                        .result
                        .ok_or_else(|| RemoteFacadeError::protocol("terminal frame carried no result"))?,
                );
            }
        }

        let terminal = terminal.ok_or_else(|| RemoteFacadeError::protocol("no terminal frame received"))?;
        decode_terminal(terminal, codec)
    }
}

fn decode_terminal(result: pb::ResultPayload, codec: &Arc<dyn Codec>) -> Result<ExecutionOutcome, RemoteFacadeError> {
    let result_codec = if result.codec == codec.name() {
        codec.clone()
    } else {
        codec::lookup(&result.codec)
            .ok_or_else(|| RemoteFacadeError::serialization("decoding the result", format!("unknown codec {:?}", result.codec)))?
    };

    let value = result_codec
        .decode_value(&result.payload)
        .map_err(|e| RemoteFacadeError::serialization("decoding the result", e))?;

    if !result.was_raised {
        return Ok(ExecutionOutcome::Value(value));
    }

    let exception_type = value
        .get("exception_type")
        .and_then(|v| v.as_str())
        .unwrap_or("Exception")
        .to_owned();
    let message = value.get("message").and_then(|v| v.as_str()).unwrap_or("").to_owned();
    Err(RemoteFacadeError::UserException(UserException { exception_type, message }))
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use codec::JsonCodec;
    use protos::gen::capsule::remote::v1::capsule_remote_server::CapsuleRemoteServer;
    use tokio::net::TcpListener;
    use tonic::{Request, Response, Status};

    use super::*;

    struct NoopSink;
    impl LogSink for NoopSink {
        fn record(&self, _record: logpipe::LogRecord) {}
    }

    /// Replays a fixed sequence of `PartialResult`s to whatever client connects, regardless of
    /// what it asked for -- enough to drive the client's terminal-frame bookkeeping without a
    /// real `bridge::run` underneath.
    struct StubService {
        frames: Vec<pb::PartialResult>,
    }

    #[tonic::async_trait]
    impl pb::capsule_remote_server::CapsuleRemote for StubService {
        type RunStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<pb::PartialResult, Status>> + Send + 'static>>;

        async fn run(&self, _request: Request<pb::BoundFunction>) -> Result<Response<Self::RunStream>, Status> {
            let stream = tokio_stream::iter(self.frames.clone().into_iter().map(Ok));
            Ok(Response::new(Box::pin(stream)))
        }
    }

    async fn start_stub_server(frames: Vec<pb::PartialResult>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = StubService { frames };
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(CapsuleRemoteServer::new(service))
                .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    fn terminal_frame() -> pb::PartialResult {
        pb::PartialResult {
            logs: Vec::new(),
            result: Some(pb::ResultPayload {
                payload: Vec::new(),
                codec: "json".to_owned(),
                was_raised: false,
            }),
            is_complete: true,
        }
    }

    #[tokio::test]
    async fn stream_closing_without_a_terminal_frame_is_a_protocol_fault() {
        let endpoint = start_stub_server(Vec::new()).await;
        let client = RemoteFacadeClient::connect_lazy(endpoint).unwrap();
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let callable = Callable {
            function: "add".to_owned(),
            args: serde_json::json!([1, 2]),
        };

        let result = client
            .run(&EnvironmentDescription::new("bare-runtime"), &callable, &codec, Arc::new(NoopSink))
            .await;
        match result {
            Err(RemoteFacadeError::ProtocolFault(message)) => {
                assert_eq!(message, "no terminal frame received");
            }
            other => panic!("expected a protocol fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_second_terminal_frame_is_a_protocol_fault() {
        let endpoint = start_stub_server(vec![terminal_frame(), terminal_frame()]).await;
        let client = RemoteFacadeClient::connect_lazy(endpoint).unwrap();
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let callable = Callable {
            function: "add".to_owned(),
            args: serde_json::json!([1, 2]),
        };

        let result = client
            .run(&EnvironmentDescription::new("bare-runtime"), &callable, &codec, Arc::new(NoopSink))
            .await;
        match result {
            Err(RemoteFacadeError::ProtocolFault(message)) => {
                assert_eq!(message, "multiple terminal frames received");
            }
            other => panic!("expected a protocol fault, got {other:?}"),
        }
    }
}
