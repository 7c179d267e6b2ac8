// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Frame-level transport for one bridge session's request/response exchange.
//!
//! Framing (length-prefixing) and the codec named in a `CallRequest`/`CallResult` are
//! deliberately different layers: `tokio_util::codec::LengthDelimitedCodec` is the "local-bridge
//! library" that frames the wire, while the `payload` bytes inside a frame are whatever the
//! caller-selected [`codec::Codec`] produced. The envelope itself (this module's concern) is
//! always JSON, regardless of which codec the payload was encoded with.

use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::BridgeError;
use crate::types::{CallRequest, CallResult};

pub type Transport = Framed<UnixStream, LengthDelimitedCodec>;

pub fn framed(stream: UnixStream) -> Transport {
    Framed::new(stream, LengthDelimitedCodec::new())
}

async fn send<T: Serialize>(transport: &mut Transport, value: &T) -> Result<(), BridgeError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| BridgeError::protocol("encoding a frame envelope", e.to_string()))?;
    transport
        .send(bytes.into())
        .await
        .map_err(|e| BridgeError::protocol("writing a frame to the bridge socket", e.to_string()))
}

async fn recv_one<T: DeserializeOwned>(
    transport: &mut Transport,
    operation: &str,
) -> Result<T, BridgeError> {
    match transport.next().await {
        Some(Ok(bytes)) => serde_json::from_slice(&bytes)
            .map_err(|e| BridgeError::protocol(operation.to_owned(), e.to_string())),
        Some(Err(e)) => Err(BridgeError::protocol(operation.to_owned(), e.to_string())),
        None => Err(BridgeError::protocol(
            operation.to_owned(),
            "connection closed before a frame was received".to_owned(),
        )),
    }
}

pub async fn send_request(transport: &mut Transport, request: &CallRequest) -> Result<(), BridgeError> {
    send(transport, request).await
}

pub async fn recv_request(transport: &mut Transport) -> Result<CallRequest, BridgeError> {
    recv_one(transport, "waiting for the call request frame").await
}

pub async fn send_result(transport: &mut Transport, result: &CallResult) -> Result<(), BridgeError> {
    send(transport, result).await
}

/// Receives exactly one `CallResult` frame and confirms the agent did not send a second one
/// before closing — the session protocol treats any additional frame after the first as a
/// fault (§4.4).
pub async fn recv_exactly_one_result(transport: &mut Transport) -> Result<CallResult, BridgeError> {
    let result: CallResult = recv_one(transport, "waiting for the result frame").await?;
    match transport.next().await {
        None => Ok(result),
        Some(Ok(_)) => Err(BridgeError::protocol(
            "waiting for the result frame",
            "received more than one result frame",
        )),
        Some(Err(e)) => Err(BridgeError::protocol(
            "waiting for the result frame",
            format!("connection error after the result frame: {e}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn ok_result() -> CallResult {
        CallResult::Ok {
            payload: b"1".to_vec(),
            codec: "json".to_owned(),
        }
    }

    #[tokio::test]
    async fn recv_exactly_one_result_accepts_a_single_frame_then_close() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut writer = framed(client);
        let mut reader = framed(server);

        send_result(&mut writer, &ok_result()).await.unwrap();
        drop(writer);

        let result = recv_exactly_one_result(&mut reader).await.unwrap();
        assert!(matches!(result, CallResult::Ok { .. }));
    }

    #[tokio::test]
    async fn recv_exactly_one_result_rejects_a_second_frame() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut writer = framed(client);
        let mut reader = framed(server);

        send_result(&mut writer, &ok_result()).await.unwrap();
        send_result(&mut writer, &ok_result()).await.unwrap();

        let err = recv_exactly_one_result(&mut reader).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol fault while waiting for the result frame: received more than one result frame"
        );
    }
}
