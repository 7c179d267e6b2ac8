// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(unused_must_use)]
// See https://github.com/hyperium/tonic/issues/1056
#![allow(clippy::derive_partial_eq_without_eq)]

//! Generated gRPC/protobuf types for the remote facade's wire protocol (§6 of the design: one
//! `BoundFunction` request, a stream of `PartialResult` responses). This crate contains nothing
//! but generated code and is never hand-edited beyond this `gen` nesting, which mirrors the
//! package path so that `prost`'s cross-references between messages resolve.

pub mod gen {
    pub mod capsule {
        pub mod remote {
            pub mod v1 {
                tonic::include_proto!("capsule.remote.v1");
            }
        }
    }
}
