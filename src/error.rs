//! This module defines the core's error type and the specialized error
//! types nested within it, following the error table of the queue/connection
//! design.

use std::fmt;

use crate::{BundleToken, Token};

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The top level error type, covering every failure mode a caller of the
/// queue, connection, or download manager can observe.
#[derive(Debug)]
pub enum Error {
    /// No queue item exists for the given bundle/path.
    QueueItemNotFound,
    /// No bundle exists for the given token.
    BundleNotFound(BundleToken),
    /// A file with the same TTH is already queued or shared under a
    /// different path. Distinct from a plain dupe-add, which is a no-op.
    FileWithDifferentTth,
    /// The file is already complete and queued for hashing/verification.
    AlreadyFinished,
    /// The target path is already occupied by an unrelated file.
    TargetExists,
    /// The size of an added bundle did not match an already-known size
    /// for the same TTH.
    SizeMismatch,
    /// A priority change was rejected, e.g. attempting to un-pause a
    /// bundle that has no remaining sources.
    InvalidPriority,
    /// No segment is currently available for the given source (it has
    /// nothing left we need, or its free parts don't reach the minimum
    /// segment size).
    NoSegment,
    /// The connection token refers to no known connection or expected
    /// connection.
    UnknownToken(Token),
    /// The same token was registered twice.
    DuplicateToken(Token),
    /// A new connection was rejected by flood protection.
    ConnectionFlooded,
    /// A message arrived that is not valid for the connection's current
    /// state.
    ProtocolViolation(ProtocolError),
    /// The persistence layer failed to load or save bundle state.
    Persistence(PersistenceError),
    /// Wraps an I/O error from the persistence layer or a connection.
    Io(std::io::Error),
    /// A background task's receiving end was dropped before a reply
    /// could be delivered.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueueItemNotFound => write!(f, "queue item not found"),
            Error::BundleNotFound(token) => write!(f, "bundle not found: {}", token),
            Error::FileWithDifferentTth => {
                write!(f, "file already queued or shared with a different TTH")
            }
            Error::AlreadyFinished => write!(f, "file is already finished"),
            Error::TargetExists => write!(f, "target path already exists"),
            Error::SizeMismatch => write!(f, "size does not match existing entry for this TTH"),
            Error::InvalidPriority => write!(f, "invalid priority change"),
            Error::NoSegment => write!(f, "no segment available"),
            Error::UnknownToken(token) => write!(f, "unknown connection token: {}", token),
            Error::DuplicateToken(token) => write!(f, "duplicate connection token: {}", token),
            Error::ConnectionFlooded => write!(f, "connection rejected by flood protection"),
            Error::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            Error::Persistence(e) => write!(f, "persistence error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Channel => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::ProtocolViolation(e)
    }
}

impl From<PersistenceError> for Error {
    fn from(e: PersistenceError) -> Self {
        Error::Persistence(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

/// Errors produced while decoding or validating an incoming ADC/NMDC wire
/// message.
#[derive(Debug)]
pub enum ProtocolError {
    /// The message did not parse as a well-formed ADC or NMDC line.
    Malformed(String),
    /// A message was received before the handshake that establishes it
    /// completed (e.g. `GET` before `MyNick`/`INF`).
    HandshakeNotComplete,
    /// The peer's advertised TTH did not match what we asked for.
    TthMismatch,
    /// The peer announced a file list or tree response we did not
    /// request.
    Unsolicited,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(line) => write!(f, "malformed message: {}", line),
            ProtocolError::HandshakeNotComplete => write!(f, "handshake not complete"),
            ProtocolError::TthMismatch => write!(f, "TTH mismatch"),
            ProtocolError::Unsolicited => write!(f, "unsolicited response"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors produced while loading or saving bundle XML.
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Xml(String),
    /// The legacy monolithic queue file failed to migrate (malformed
    /// beyond what the legacy schema allows). Left on disk under its
    /// original name so the load can be retried or inspected by hand.
    LegacyMigrationFailed(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "{}", e),
            PersistenceError::Xml(msg) => write!(f, "{}", msg),
            PersistenceError::LegacyMigrationFailed(msg) => {
                write!(f, "failed to migrate legacy queue file: {}", msg)
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

impl From<quick_xml::Error> for PersistenceError {
    fn from(e: quick_xml::Error) -> Self {
        PersistenceError::Xml(e.to_string())
    }
}
