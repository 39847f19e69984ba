//! Inter-process communication between the pool and its worker processes.
//!
//! This module provides the envelope format, the framing used on the
//! worker's stdin/stdout, and correlation ids for request/reply exchanges.

pub mod protocol;

pub use protocol::{
    CorrelationIds, Envelope, EnvelopeKind, read_envelope, read_message, write_envelope,
    write_message,
};
