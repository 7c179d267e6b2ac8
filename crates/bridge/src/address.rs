// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The listener address is passed to the agent entrypoint as an argv token, and argv tokens have
//! to survive a shell and an exec boundary intact. Base64-over-UTF-8 makes that reversible
//! regardless of what characters the underlying address (a filesystem path, for Unix sockets)
//! happens to contain.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub fn encode_address(address: &str) -> String {
    STANDARD.encode(address.as_bytes())
}

pub fn decode_address(encoded: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("invalid base64 in encoded address: {e}"))?;
    String::from_utf8(bytes).map_err(|e| format!("encoded address was not valid utf-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_paths() {
        let original = "/tmp/capsule-7f3a/bridge.sock";
        assert_eq!(decode_address(&encode_address(original)).unwrap(), original);
    }

    #[test]
    fn round_trips_unusual_bytes() {
        for original in ["", "a", "has spaces/and-dashes_ok", "\u{1F980}/weird"] {
            assert_eq!(decode_address(&encode_address(original)).unwrap(), original);
        }
    }
}
