//! Generated protobuf/gRPC types for the Weave network transport.
//!
//! The relay and its clients exchange [`Frame`]s over the `MeshTransport.Attach`
//! bidirectional stream. Application messages ride as JSON bytes in
//! `Frame::kind = Envelope(..)`, so the JSON wire shape stays the only contract
//! between endpoints.

pub mod v1 {
    tonic::include_proto!("weave.v1");
}

pub use v1::*;

impl Frame {
    pub fn hello(endpoint: impl Into<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Hello(Hello {
                endpoint: endpoint.into(),
            })),
        }
    }

    pub fn envelope(bytes: Vec<u8>) -> Self {
        Self {
            kind: Some(frame::Kind::Envelope(bytes)),
        }
    }

    pub fn notice(code: u32, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Notice(Notice {
                code,
                reason: reason.into(),
            })),
        }
    }
}
