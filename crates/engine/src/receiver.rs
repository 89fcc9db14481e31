//! Dispatches frames off the inbound stream and rebuilds the destination
//! tree underneath `base_path`.
//!
//! Grounded in `receiver.cpp`'s `receive_files` main loop and its
//! `pst_rec_callback_*` handlers, collapsed from a registered-callback
//! table into the `match` in [`run`]. `expecting_data`/`read_new_header`
//! survive as the literal state fields on [`TransferState`] the original
//! used to guard against a `DATA` frame arriving before any `FILENAME`; the
//! `FileList` pre-flight handler (`pst_rec_callback_filelist`) is folded
//! into the same dispatch since it is just another frame kind to the
//! receiver, identified the same way the sender identifies a destination
//! path — by the entry's path relative to its root, never its absolute
//! source path.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use wire::{ControlKind, Header, Kind};

use crate::Error;

/// Tracks the file currently being written, mirroring the original's
/// `expecting_data`/`read_new_header` flags plus the open file handle and
/// the size/mtime a `FILENAME`/`F_SIZE` pair announced for it.
#[derive(Default)]
struct TransferState {
    fout: Option<File>,
    dest_path: PathBuf,
    announced_size: u64,
    bytes_written: u64,
    mtime_sec: u32,
    mtime_nsec: u64,
    expecting_data: bool,
}

/// Reads frames from `reader` and rebuilds them under `base_path`,
/// acknowledging the sender's `COMPLETE` frame on `writer` and returning
/// once it has been sent.
pub fn run<R: Read, W: Write>(reader: &mut R, writer: &mut W, base_path: &Path) -> Result<(), Error> {
    let mut state = TransferState::default();

    loop {
        let header = Header::read(reader)?;
        match header.kind {
            Kind::Dirname => {
                let path = read_path(reader, header.data_len)?;
                platform::mkdir_parents(&base_path.join(&path))?;
            }
            Kind::Filename | Kind::Fifo => {
                let path = read_path(reader, header.data_len)?;
                open_destination(base_path, &path, &header, &mut state)?;
            }
            Kind::FSize => {
                let mut buf = [0u8; 8];
                wire::read_data(reader, &mut buf)?;
                state.announced_size = u64::from_le_bytes(buf);
            }
            Kind::Data => {
                if !state.expecting_data {
                    return Err(Error::OutOfOrderData {
                        path: state.dest_path.display().to_string(),
                    });
                }
                let mut buf = vec![0u8; header.data_len as usize];
                wire::read_data(reader, &mut buf)?;
                let fout = state
                    .fout
                    .as_mut()
                    .expect("expecting_data implies an open file");
                fout.write_all(&buf)?;
                state.bytes_written += buf.len() as u64;
            }
            Kind::DataComplete => {
                finish_file(&mut state)?;
            }
            Kind::Complete => {
                Header::control(ControlKind::Ack).write(writer)?;
                writer.flush()?;
                return Ok(());
            }
            Kind::FileList => {
                reply_to_preflight(reader, writer, &header, base_path)?;
            }
            Kind::Wait => {
                tracing::debug!("received WAIT frame, ignoring");
            }
            Kind::Control => {
                return Err(Error::UnexpectedKind { kind: Kind::Control });
            }
        }
    }
}

fn open_destination(
    base_path: &Path,
    relative: &Path,
    header: &Header,
    state: &mut TransferState,
) -> Result<(), Error> {
    let dest = base_path.join(relative);
    if let Some(parent) = dest.parent() {
        platform::mkdir_parents(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&dest)?;

    state.fout = Some(file);
    state.dest_path = dest;
    state.mtime_sec = header.mtime_sec;
    state.mtime_nsec = header.mtime_nsec;
    state.bytes_written = 0;
    state.announced_size = 0;
    state.expecting_data = true;
    Ok(())
}

fn finish_file(state: &mut TransferState) -> Result<(), Error> {
    if state.bytes_written != state.announced_size {
        tracing::warn!(
            path = %state.dest_path.display(),
            expected = state.announced_size,
            got = state.bytes_written,
            "received byte count does not match announced file size"
        );
    }
    if let Some(file) = state.fout.take() {
        file.set_len(state.announced_size)?;
    }
    if let Err(err) = platform::restore_mtime(&state.dest_path, state.mtime_sec, state.mtime_nsec) {
        tracing::warn!(path = %state.dest_path.display(), error = %err, "failed to restore modification time");
    }
    state.expecting_data = false;
    Ok(())
}

/// Answers a pre-flight `FileList` frame: for every entry the peer asked
/// about, fills in the local modification time if a matching file already
/// exists under `base_path`, zeroing it out otherwise, then sends the
/// filled-in list back as another `FileList` frame.
fn reply_to_preflight<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    header: &Header,
    base_path: &Path,
) -> Result<(), Error> {
    let mut payload = vec![0u8; header.data_len as usize];
    wire::read_data(reader, &mut payload)?;
    let requested = flist::unpack_file_list(&payload)?;

    let answered: flist::FileList = requested
        .iter()
        .cloned()
        .map(|mut entry| {
            match fs::metadata(base_path.join(&entry.path)) {
                Ok(metadata) => {
                    let (sec, nsec) = platform::mtime_of(&metadata);
                    entry.mtime_sec = sec;
                    entry.mtime_nsec = nsec;
                    entry.len = metadata.len();
                }
                Err(_) => {
                    entry.mtime_sec = 0;
                    entry.mtime_nsec = 0;
                    entry.len = 0;
                }
            }
            entry
        })
        .collect();

    let packed = flist::pack_file_list(&answered);
    Header::new(Kind::FileList, packed.len() as u64).write(writer)?;
    writer.write_all(&packed)?;
    Ok(())
}

fn read_path<R: Read>(reader: &mut R, len: u64) -> Result<PathBuf, Error> {
    let mut buf = vec![0u8; len as usize];
    wire::read_data(reader, &mut buf)?;
    Ok(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_path_frame<W: Write>(w: &mut W, kind: Kind, path: &str) {
        let bytes = path.as_bytes();
        Header::new(kind, bytes.len() as u64).write(w).unwrap();
        w.write_all(bytes).unwrap();
    }

    #[test]
    fn reconstructs_a_single_file_and_acks_complete() {
        let dir = tempfile::tempdir().unwrap();

        let mut inbound = Vec::new();
        write_path_frame(&mut inbound, Kind::Filename, "a.txt");
        Header::new(Kind::FSize, 8).write(&mut inbound).unwrap();
        inbound.write_all(&5u64.to_le_bytes()).unwrap();
        Header::new(Kind::Data, 5).write(&mut inbound).unwrap();
        inbound.write_all(b"hello").unwrap();
        Header::new(Kind::DataComplete, 0).write(&mut inbound).unwrap();
        Header::new(Kind::Complete, 0).write(&mut inbound).unwrap();

        let mut reader = Cursor::new(inbound);
        let mut outbound = Vec::new();
        run(&mut reader, &mut outbound, dir.path()).unwrap();

        let contents = fs::read(dir.path().join("a.txt")).unwrap();
        assert_eq!(contents, b"hello");

        let mut out_cursor = Cursor::new(outbound);
        let ack = Header::read(&mut out_cursor).unwrap();
        assert_eq!(ack.kind, Kind::Control);
        assert_eq!(ack.ctrl_msg, ControlKind::Ack);
    }

    #[test]
    fn out_of_order_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbound = Vec::new();
        Header::new(Kind::Data, 3).write(&mut inbound).unwrap();
        inbound.write_all(b"abc").unwrap();

        let mut reader = Cursor::new(inbound);
        let mut outbound = Vec::new();
        let err = run(&mut reader, &mut outbound, dir.path()).unwrap_err();
        assert!(matches!(err, Error::OutOfOrderData { .. }));
    }

    #[test]
    fn dirname_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut inbound = Vec::new();
        write_path_frame(&mut inbound, Kind::Dirname, "nested/child");
        Header::new(Kind::Complete, 0).write(&mut inbound).unwrap();

        let mut reader = Cursor::new(inbound);
        let mut outbound = Vec::new();
        run(&mut reader, &mut outbound, dir.path()).unwrap();

        assert!(dir.path().join("nested/child").is_dir());
    }

    #[test]
    fn preflight_filelist_fills_in_existing_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"data").unwrap();

        let mut requested = flist::FileList::new();
        requested.push(flist::FileEntry {
            path: PathBuf::from("existing.txt"),
            root: PathBuf::new(),
            kind: flist::Kind::Regular,
            len: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        });
        requested.push(flist::FileEntry {
            path: PathBuf::from("missing.txt"),
            root: PathBuf::new(),
            kind: flist::Kind::Regular,
            len: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        });
        let packed = flist::pack_file_list(&requested);

        let mut inbound = Vec::new();
        Header::new(Kind::FileList, packed.len() as u64)
            .write(&mut inbound)
            .unwrap();
        inbound.write_all(&packed).unwrap();
        Header::new(Kind::Complete, 0).write(&mut inbound).unwrap();

        let mut reader = Cursor::new(inbound);
        let mut outbound = Vec::new();
        run(&mut reader, &mut outbound, dir.path()).unwrap();

        let mut out_cursor = Cursor::new(outbound);
        let reply_header = Header::read(&mut out_cursor).unwrap();
        assert_eq!(reply_header.kind, Kind::FileList);
        let mut payload = vec![0u8; reply_header.data_len as usize];
        wire::read_data(&mut out_cursor, &mut payload).unwrap();
        let reply = flist::unpack_file_list(&payload).unwrap();

        let existing = reply.iter().find(|e| e.path == PathBuf::from("existing.txt")).unwrap();
        assert!(existing.mtime_sec > 0 || existing.len == 4);
        let missing = reply.iter().find(|e| e.path == PathBuf::from("missing.txt")).unwrap();
        assert_eq!(missing.mtime_sec, 0);
    }
}
