//! §7 error-kind taxonomy: a flat classification the Session worker's
//! dispatch loop matches on to decide how to log and whether to tear the
//! connection down. Not a `std::error::Error` impl — it classifies a
//! failure already carried as an `io::Error`/[`FrameError`], it does not
//! replace either as the propagated error type.

use std::io;

use crate::frame::FrameError;

/// Classification of a failure observed while running a Session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A recoverable I/O hiccup; the connection may still be usable.
    TransientIO,
    /// The peer closed its side of the connection.
    PeerClosed,
    /// The Framer rejected the bytes on the wire.
    MalformedFrame,
    /// Policy denied a `CMD`.
    PolicyViolation,
    /// A peer exceeded `MAX_FLAG_TRIES` during setup.
    SetupAbuse,
    /// Unrecoverable; the process should exit.
    Fatal,
}

impl ErrorKind {
    /// Classify a socket read/write error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            _ => Self::TransientIO,
        }
    }

    /// Every [`FrameError`] variant is, by definition, a malformed frame.
    pub fn from_frame_error(_err: &FrameError) -> Self {
        Self::MalformedFrame
    }
}
