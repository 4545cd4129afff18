// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire protocol error types.

use std::io;
use thiserror::Error;

/// Errors that can occur while framing or parsing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed the stream. This is a normal disconnect.
    #[error("stream closed")]
    StreamClosed,

    /// A line was read but did not contain a valid message.
    #[error("malformed wire message: {0}")]
    Malformed(String),

    /// A message could not be serialized.
    #[error("failed to serialize wire message: {0}")]
    Serialization(String),

    /// Underlying transport failure.
    #[error("wire transport error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// Check if this error means the peer went away.
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, Self::StreamClosed)
    }
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
