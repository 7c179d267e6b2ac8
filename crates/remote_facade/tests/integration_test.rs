// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Runs a real server and client, in-process, over a loopback TCP connection -- exercising the
//! full remote facade stack against the same `capsule-agent` binary the bridge's own tests use.

use std::sync::{Arc, Mutex};

use codec::{Callable, JsonCodec};
use environment::EnvironmentManager;
use logpipe::{LogRecord, LogSink};
use protos::gen::capsule::remote::v1::capsule_remote_server::CapsuleRemoteServer;
use remote_facade::{RemoteFacadeClient, RemoteFacadeServer};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Vec<LogRecord>>>);

impl LogSink for RecordingSink {
    fn record(&self, record: LogRecord) {
        self.0.lock().unwrap().push(record);
    }
}

async fn start_server(manager: EnvironmentManager) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = RemoteFacadeServer::new(Arc::new(manager));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(CapsuleRemoteServer::new(service))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    format!("http://{addr}")
}

fn bare_runtime_description() -> environment::EnvironmentDescription {
    environment::EnvironmentDescription::new("bare-runtime")
        .with_config("runtime_bin", serde_json::json!(env!("CARGO_BIN_EXE_capsule-agent")))
}

#[tokio::test]
async fn runs_a_registered_function_over_the_wire() {
    let cache_root = tempfile::tempdir().unwrap();
    let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
    let endpoint = start_server(manager).await;

    let client = RemoteFacadeClient::connect_lazy(endpoint).unwrap();
    let codec: Arc<dyn codec::Codec> = Arc::new(JsonCodec);
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let callable = Callable {
        function: "add".to_owned(),
        args: serde_json::json!([4, 5]),
    };

    let outcome = client
        .run(&bare_runtime_description(), &callable, &codec, sink)
        .await
        .unwrap();

    match outcome {
        bridge::ExecutionOutcome::Value(value) => assert_eq!(value, serde_json::json!(9)),
        other => panic!("expected a value, got {other:?}"),
    }
}

#[tokio::test]
async fn user_exception_surfaces_as_a_facade_error() {
    let cache_root = tempfile::tempdir().unwrap();
    let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
    let endpoint = start_server(manager).await;

    let client = RemoteFacadeClient::connect_lazy(endpoint).unwrap();
    let codec: Arc<dyn codec::Codec> = Arc::new(JsonCodec);
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let callable = Callable {
        function: "divide".to_owned(),
        args: serde_json::json!([1, 0]),
    };

    let result = client.run(&bare_runtime_description(), &callable, &codec, sink).await;
    match result {
        Err(remote_facade::RemoteFacadeError::UserException(cause)) => {
            assert_eq!(cause.exception_type, "ZeroDivisionError");
        }
        other => panic!("expected a user exception, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_environment_kind_surfaces_as_a_channel_failure() {
    let cache_root = tempfile::tempdir().unwrap();
    let manager = EnvironmentManager::new(cache_root.path().to_path_buf());
    let endpoint = start_server(manager).await;

    let client = RemoteFacadeClient::connect_lazy(endpoint).unwrap();
    let codec: Arc<dyn codec::Codec> = Arc::new(JsonCodec);
    let sink: Arc<dyn LogSink> = Arc::new(RecordingSink::default());

    let description = environment::EnvironmentDescription::new("not-a-real-kind");
    let callable = Callable {
        function: "add".to_owned(),
        args: serde_json::json!([1, 2]),
    };

    let result = client.run(&description, &callable, &codec, sink).await;
    assert!(matches!(result, Err(remote_facade::RemoteFacadeError::ChannelFailed(_))));
}
