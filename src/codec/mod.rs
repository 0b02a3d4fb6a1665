//! Codec module - payload encoding for byte accounting.
//!
//! [`MsgPackCodec`] turns parameter and result objects into MessagePack
//! bytes. The in-process gateway uses it to measure what a call would put on
//! the wire, which feeds the throughput counters.

mod msgpack;

pub use msgpack::{Measured, MsgPackCodec};
