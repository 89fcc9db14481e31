#![deny(unsafe_code)]

//! # Overview
//!
//! The two protocol drivers that sit on either end of the framed stream:
//! [`sender::run`] walks a [`flist::FileList`] and issues directory/file/
//! size/data/complete frames; [`receiver::run`] reads headers off the
//! inbound local pipe and dispatches each one to rebuild the destination
//! tree. [`preflight::exchange`] is the small pre-flight manifest swap the
//! initiator runs before `sender::run` starts framing data proper.
//!
//! # Design
//!
//! Grounded in the original `sender.cpp` (`send_file`/`handle_files`) and
//! `receiver.cpp` (`receive_files` plus its `pst_rec_callback_*` table,
//! dispatched through `postmaster.h`'s callback-per-message-kind registry).
//! The callback table becomes a `match` over [`wire::Kind`] here, per the
//! "tagged messages over polymorphism" design note — there is a closed set
//! of frame kinds, so a function-pointer table buys nothing a `match` arm
//! doesn't already give for free, and the compiler checks exhaustiveness.
//!
//! Neither driver touches the transport socket or the crypto pipeline
//! directly: they only read and write whichever `Read`/`Write` the session
//! orchestrator hands them (ordinarily the ends of a local pipe that the
//! transport thread pair relays to the wire), so both drivers are testable
//! against an in-memory buffer with no sockets or threads involved.

pub mod preflight;
pub mod receiver;
pub mod sender;

/// Errors raised by either protocol driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A wire-level framing error (bad kind byte, short read, oversized
    /// payload).
    #[error(transparent)]
    Wire(#[from] wire::WireError),
    /// A file-list walk, pack/unpack, or checkpoint-log error.
    #[error(transparent)]
    Flist(#[from] flist::FlistError),
    /// A platform helper (directory creation, mtime restore) failed.
    #[error(transparent)]
    Platform(#[from] platform::Error),
    /// Plain local I/O failure (file open/read/write) not already wrapped
    /// by one of the above.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The receiver saw a `DATA` frame without a preceding `FILENAME`/`FIFO`
    /// frame having opened an output file.
    #[error("received out-of-order DATA frame for {path}")]
    OutOfOrderData { path: String },
    /// A frame kind arrived that neither driver expects in its current
    /// role (e.g. a second `F_SIZE` before any `FILENAME`).
    #[error("unexpected frame kind {kind:?} in this role")]
    UnexpectedKind { kind: wire::Kind },
    /// The sender's `COMPLETE` frame was not followed by a `CONTROL(ACK)`.
    #[error("peer did not acknowledge COMPLETE (got {0:?} instead)")]
    MissingAck(wire::Kind),
}
