//! Walks a [`FileList`] and frames it onto the outbound stream.
//!
//! Grounded in `sender.cpp`'s `handle_files`/`send_file`: directories become
//! `DIRNAME` frames, regular files become a `FILENAME`/`F_SIZE` pair
//! followed by one or more `DATA` frames and a closing `DATA_COMPLETE`, and
//! anything the destination already has (per a checkpoint log or the
//! pre-flight manifest) is skipped rather than re-sent. FIFOs and character
//! devices get the same regular-file treatment when `all_files` is set,
//! and are warned about and skipped otherwise — `send_file`'s behavior for
//! `opts.regular_files`. Block devices, sockets, and anything this
//! implementation can't classify are always skipped with a warning; the
//! original's hard failure on an unsupported type becomes a log line here,
//! since one odd file shouldn't abort an otherwise good transfer.

use std::fs::File;
use std::io::{Read, Write};

use flist::{CheckpointLog, CheckpointSet, FileEntry, FileList, Kind as FlistKind};
use wire::{ControlKind, Header, Kind};

use crate::Error;

/// Options controlling how [`run`] walks and skips entries. Borrowed rather
/// than owned so the caller keeps its checkpoint log open across calls.
pub struct SendOptions<'a> {
    /// Send absolute paths instead of each entry's root-relative path.
    pub full_root: bool,
    /// Send FIFOs and character devices as if they were regular files.
    pub all_files: bool,
    /// How to compare a checkpointed entry's stashed mtime against its
    /// current one.
    pub checkpoint_policy: core::CheckpointPolicy,
    /// Entries already recorded as transferred in a prior, interrupted run.
    pub checkpoint: Option<&'a CheckpointSet>,
    /// Where to append newly completed regular files, if resuming support
    /// is enabled for this transfer.
    pub checkpoint_log: Option<&'a mut CheckpointLog>,
    /// The peer's pre-flight manifest of what it already has under its
    /// destination root, keyed by destination-relative path.
    pub remote_has: Option<&'a FileList>,
}

/// Frames every entry in `plan` onto `writer`, then sends `COMPLETE` and
/// blocks on `reader` for the peer's `CONTROL(ACK)`.
pub fn run<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    plan: &FileList,
    opts: &mut SendOptions<'_>,
) -> Result<(), Error> {
    for entry in plan.iter() {
        send_entry(writer, entry, opts)?;
    }

    Header::new(Kind::Complete, 0).write(writer)?;
    writer.flush()?;

    let header = Header::read(reader)?;
    if header.kind != Kind::Control || header.ctrl_msg != ControlKind::Ack {
        return Err(Error::MissingAck(header.kind));
    }
    Ok(())
}

fn send_entry<W: Write>(
    writer: &mut W,
    entry: &FileEntry,
    opts: &mut SendOptions<'_>,
) -> Result<(), Error> {
    let dest = entry.destination_path(opts.full_root);

    match entry.kind {
        FlistKind::Directory => {
            let bytes = path_bytes(dest);
            Header::new(Kind::Dirname, bytes.len() as u64).write(writer)?;
            writer.write_all(&bytes)?;
            Ok(())
        }
        FlistKind::Regular => send_regular(writer, entry, opts, Kind::Filename),
        FlistKind::Fifo | FlistKind::CharDevice if opts.all_files => {
            send_regular(writer, entry, opts, Kind::Fifo)
        }
        FlistKind::Fifo | FlistKind::CharDevice => {
            tracing::warn!(path = %entry.path.display(), "skipping FIFO/character device (pass --all-files to send it)");
            Ok(())
        }
        FlistKind::Symlink | FlistKind::BlockDevice | FlistKind::Socket | FlistKind::Unknown => {
            tracing::warn!(path = %entry.path.display(), kind = ?entry.kind, "skipping unsupported file type");
            Ok(())
        }
    }
}

fn send_regular<W: Write>(
    writer: &mut W,
    entry: &FileEntry,
    opts: &mut SendOptions<'_>,
    filename_kind: Kind,
) -> Result<(), Error> {
    if let Some(checkpoint) = opts.checkpoint {
        if checkpoint.is_completed(entry, opts.checkpoint_policy) {
            tracing::debug!(path = %entry.path.display(), "skipping, already checkpointed");
            return Ok(());
        }
    }

    let dest = entry.destination_path(opts.full_root);
    if let Some(remote_has) = opts.remote_has {
        if let Some(remote_entry) = remote_has.iter().find(|e| e.path == dest) {
            if remote_entry.mtime_sec == entry.mtime_sec && remote_entry.len == entry.len {
                tracing::debug!(path = %entry.path.display(), "skipping, peer already has a matching copy");
                return Ok(());
            }
        }
    }

    let name_bytes = path_bytes(dest);
    let mut header = Header::filename(name_bytes.len() as u64, entry.mtime_sec, entry.mtime_nsec);
    header.kind = filename_kind;
    header.write(writer)?;
    writer.write_all(&name_bytes)?;

    Header::new(Kind::FSize, 8).write(writer)?;
    writer.write_all(&entry.len.to_le_bytes())?;

    let mut file = File::open(&entry.path)?;
    let mut buf = vec![0u8; wire::BLOCK_PAYLOAD_LEN.min(8 * 1024 * 1024)];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        Header::new(Kind::Data, n as u64).write(writer)?;
        writer.write_all(&buf[..n])?;
    }

    Header::new(Kind::DataComplete, 0).write(writer)?;

    if let Some(log) = opts.checkpoint_log.as_mut() {
        log.record(entry)?;
    }
    Ok(())
}

fn path_bytes(path: &std::path::Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}
