//! The "what do you already have" exchange run once, before either
//! protocol driver starts framing the main stream: the initiator packs its
//! local plan as destination-relative paths and sends it as one `FILELIST`
//! frame; the responder's [`crate::receiver::Receiver`] dispatch (see
//! `Kind::FileList` in `§4.7`) fills in local mtimes for files that already
//! exist under its destination root and echoes the list back. This module
//! owns only the initiator's half of that round trip — the responder's half
//! lives in [`crate::receiver`] because it happens inline with the rest of
//! that driver's dispatch loop.

use std::io::{Read, Write};
use std::path::PathBuf;

use flist::{FileEntry, FileList};
use wire::{Header, Kind};

use crate::Error;

/// Rewrites `plan`'s entries so [`FileEntry::path`] holds the
/// destination-relative path rather than the sender's local filesystem
/// path, matching what the responder will compare against its own
/// destination tree.
fn to_wire_plan(plan: &FileList, full_root: bool) -> FileList {
    plan.iter()
        .map(|entry| FileEntry {
            path: entry.destination_path(full_root).to_path_buf(),
            root: PathBuf::new(),
            kind: entry.kind,
            len: entry.len,
            mtime_sec: entry.mtime_sec,
            mtime_nsec: entry.mtime_nsec,
        })
        .collect()
}

/// Sends `plan` as a `FILELIST` frame and blocks for the responder's echoed
/// reply, returning the echoed list (whose `mtime_sec`/`mtime_nsec` fields
/// are zero for any entry the responder doesn't already have).
///
/// Any frame kind other than `FileList` arriving in reply is a protocol
/// error: the pre-flight exchange happens before any other message crosses
/// the wire, so the responder either hasn't started yet or something is
/// out of sync.
pub fn exchange<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    plan: &FileList,
    full_root: bool,
) -> Result<FileList, Error> {
    let wire_plan = to_wire_plan(plan, full_root);
    let packed = flist::pack_file_list(&wire_plan);
    Header::new(Kind::FileList, packed.len() as u64).write(writer)?;
    writer.write_all(&packed)?;

    let header = Header::read(reader)?;
    if header.kind != Kind::FileList {
        return Err(Error::UnexpectedKind { kind: header.kind });
    }
    let mut payload = vec![0u8; header.data_len as usize];
    wire::read_data(reader, &mut payload)?;
    Ok(flist::unpack_file_list(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn to_wire_plan_uses_destination_relative_paths() {
        let mut plan = FileList::new();
        plan.push(FileEntry {
            path: PathBuf::from("/src/a/b.txt"),
            root: PathBuf::from("/src/a"),
            kind: flist::Kind::Regular,
            len: 3,
            mtime_sec: 10,
            mtime_nsec: 0,
        });
        let wire_plan = to_wire_plan(&plan, false);
        let entry = wire_plan.iter().next().unwrap();
        assert_eq!(entry.path, PathBuf::from("b.txt"));
        assert_eq!(entry.root, PathBuf::new());
    }

    #[test]
    fn exchange_rejects_non_filelist_reply() {
        let mut plan = FileList::new();
        plan.push(FileEntry {
            path: PathBuf::from("/src/a.txt"),
            root: PathBuf::from("/src"),
            kind: flist::Kind::Regular,
            len: 1,
            mtime_sec: 1,
            mtime_nsec: 0,
        });

        let mut outbound = Vec::new();
        // Simulate a malformed peer replying with a bare COMPLETE frame.
        let mut inbound = Vec::new();
        Header::new(Kind::Complete, 0).write(&mut inbound).unwrap();
        let mut inbound = std::io::Cursor::new(inbound);

        let err = exchange(&mut inbound, &mut outbound, &plan, false).unwrap_err();
        assert!(matches!(err, Error::UnexpectedKind { kind: Kind::Complete }));
    }
}
