#![deny(unsafe_code)]

//! # Overview
//!
//! Three things a transfer needs before a single byte crosses the wire:
//! a depth-first walk of the source paths into a [`FileList`], a
//! length-prefixed wire encoding of that list for the pre-flight exchange,
//! and a checkpoint log the sender can replay to skip files a prior,
//! interrupted run already completed.
//!
//! # Design
//!
//! Grounded in the original `file_object_t`/`file_LL` pair (`files.h`):
//! a file's on-disk kind, size, and mtime captured once at `stat` time, and
//! an append-only, forward-traversed list of them. [`Walker`] replaces the
//! original's `lsdir`/`build_filelist`/`build_full_filelist` trio with one
//! iterative depth-first walk, mirroring the teacher's `FileListBuilder`
//! pattern of returning an iterator of `Result<Entry, Error>` rather than
//! building the whole tree before the caller sees an error.
//!
//! The checkpoint log format is unchanged from the original: one
//! `<path> <mtime-sec>\n` line per completed regular file, append-only. A
//! malformed trailing line (the last line of a log truncated mid-write)
//! ends parsing instead of failing the whole read.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use core::CheckpointPolicy;

/// What a directory-walk observation turned out to be, captured once at
/// `stat` time and never re-derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Unknown,
}

impl Kind {
    fn to_wire(self) -> u8 {
        match self {
            Kind::Regular => 0,
            Kind::Directory => 1,
            Kind::Symlink => 2,
            Kind::BlockDevice => 3,
            Kind::CharDevice => 4,
            Kind::Fifo => 5,
            Kind::Socket => 6,
            Kind::Unknown => 7,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, FlistError> {
        Ok(match byte {
            0 => Kind::Regular,
            1 => Kind::Directory,
            2 => Kind::Symlink,
            3 => Kind::BlockDevice,
            4 => Kind::CharDevice,
            5 => Kind::Fifo,
            6 => Kind::Socket,
            7 => Kind::Unknown,
            other => return Err(FlistError::InvalidKind(other)),
        })
    }

    #[cfg(unix)]
    fn classify(file_type: fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_dir() {
            Kind::Directory
        } else if file_type.is_symlink() {
            Kind::Symlink
        } else if file_type.is_file() {
            Kind::Regular
        } else if file_type.is_block_device() {
            Kind::BlockDevice
        } else if file_type.is_char_device() {
            Kind::CharDevice
        } else if file_type.is_fifo() {
            Kind::Fifo
        } else if file_type.is_socket() {
            Kind::Socket
        } else {
            Kind::Unknown
        }
    }

    #[cfg(not(unix))]
    fn classify(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            Kind::Directory
        } else if file_type.is_symlink() {
            Kind::Symlink
        } else if file_type.is_file() {
            Kind::Regular
        } else {
            Kind::Unknown
        }
    }
}

/// One observed filesystem entry: its path, the root it was walked from,
/// its kind, size (meaningful for regular files only), and modification
/// time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub root: PathBuf,
    pub kind: Kind,
    pub len: u64,
    pub mtime_sec: u32,
    pub mtime_nsec: u64,
}

impl FileEntry {
    fn from_metadata(path: PathBuf, root: PathBuf, metadata: &fs::Metadata) -> Self {
        let (mtime_sec, mtime_nsec) = platform::mtime_of(metadata);
        let kind = Kind::classify(metadata.file_type());
        let len = if kind == Kind::Regular { metadata.len() } else { 0 };
        Self {
            path,
            root,
            kind,
            len,
            mtime_sec,
            mtime_nsec,
        }
    }

    /// The path to send on the wire and to recreate under the destination
    /// root: relative to [`FileEntry::root`], unless `full_root` bypasses
    /// relative-path derivation and the absolute path is sent as-is.
    #[must_use]
    pub fn destination_path(&self, full_root: bool) -> &Path {
        if full_root {
            return &self.path;
        }
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }
}

/// An ordered, append-only, forward-traversed sequence of [`FileEntry`].
/// Used both as the local transfer plan and as the decoded pre-flight
/// manifest received from a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileList {
    entries: Vec<FileEntry>,
}

impl FileList {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: FileEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter()
    }

    /// True if an entry with this exact path already appears in the list;
    /// used to match a local candidate against a peer's pre-flight list.
    #[must_use]
    pub fn contains_path(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }
}

impl FromIterator<FileEntry> for FileList {
    fn from_iter<T: IntoIterator<Item = FileEntry>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Errors raised while walking, packing, or checkpointing a file list.
#[derive(Debug, thiserror::Error)]
pub enum FlistError {
    #[error("failed to read directory entry under {path}: {source}")]
    ReadDir { path: String, #[source] source: io::Error },
    #[error("failed to stat {path}: {source}")]
    Stat { path: String, #[source] source: io::Error },
    #[error("unexpected end of file-list data")]
    UnexpectedEof,
    #[error("file-list path is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid file kind byte {0} in packed file list")]
    InvalidKind(u8),
    #[error("failed to open checkpoint log {path}: {source}")]
    OpenCheckpoint { path: String, #[source] source: io::Error },
    #[error("failed to write checkpoint log entry: {0}")]
    WriteCheckpoint(#[source] io::Error),
}

/// Depth-first walk over a set of top-level paths, skipping `.`/`..` and
/// descending into directories in place. Non-regular, non-directory
/// entries (symlinks, devices, fifos, sockets) are still yielded, kind
/// intact, so the caller decides whether to send them.
///
/// A directory's children are read and pushed onto the walk stack the
/// moment the directory itself is visited, so the iterator never holds a
/// live `ReadDir` handle across `next()` calls.
pub struct Walker {
    roots: std::vec::IntoIter<PathBuf>,
    stack: Vec<(PathBuf, PathBuf)>,
}

impl Walker {
    #[must_use]
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots: Vec<PathBuf> = paths.into_iter().collect();
        Self {
            roots: roots.into_iter(),
            stack: Vec::new(),
        }
    }

    fn visit(&mut self, path: PathBuf, root: PathBuf) -> Result<FileEntry, FlistError> {
        let metadata = fs::symlink_metadata(&path).map_err(|source| FlistError::Stat {
            path: path.display().to_string(),
            source,
        })?;

        if metadata.is_dir() {
            let read_dir = fs::read_dir(&path).map_err(|source| FlistError::ReadDir {
                path: path.display().to_string(),
                source,
            })?;
            let mut children = Vec::new();
            for item in read_dir {
                let item = item.map_err(|source| FlistError::ReadDir {
                    path: path.display().to_string(),
                    source,
                })?;
                let name = item.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                children.push(item.path());
            }
            // Push in reverse so the stack (LIFO) yields children in the
            // order `read_dir` produced them.
            for child in children.into_iter().rev() {
                self.stack.push((child, root.clone()));
            }
        }

        Ok(FileEntry::from_metadata(path, root, &metadata))
    }
}

impl Iterator for Walker {
    type Item = Result<FileEntry, FlistError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((path, root)) = self.stack.pop() {
            return Some(self.visit(path, root));
        }

        let path = self.roots.next()?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Some(self.visit(path, root))
    }
}

/// Packs a [`FileList`] into the length-prefixed wire encoding used for the
/// pre-flight manifest exchange: a 4-byte entry count, then per entry a
/// 4-byte path length + UTF-8 path bytes, 4-byte root length + UTF-8 root
/// bytes, a 1-byte kind, an 8-byte size, a 4-byte mtime-seconds, and an
/// 8-byte mtime-nanoseconds, all little-endian.
#[must_use]
pub fn pack_file_list(list: &FileList) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(list.len() as u32).to_le_bytes());
    for entry in list.iter() {
        pack_entry(&mut out, entry);
    }
    out
}

fn pack_entry(out: &mut Vec<u8>, entry: &FileEntry) {
    let path = entry.path.to_string_lossy();
    let root = entry.root.to_string_lossy();
    out.extend_from_slice(&(path.len() as u32).to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(&(root.len() as u32).to_le_bytes());
    out.extend_from_slice(root.as_bytes());
    out.push(entry.kind.to_wire());
    out.extend_from_slice(&entry.len.to_le_bytes());
    out.extend_from_slice(&entry.mtime_sec.to_le_bytes());
    out.extend_from_slice(&entry.mtime_nsec.to_le_bytes());
}

/// Decodes a [`FileList`] from the encoding [`pack_file_list`] produces.
pub fn unpack_file_list(data: &[u8]) -> Result<FileList, FlistError> {
    let mut cursor = Cursor { data, pos: 0 };
    let count = cursor.read_u32()?;
    let mut list = FileList::new();
    for _ in 0..count {
        list.push(unpack_entry(&mut cursor)?);
    }
    Ok(list)
}

fn unpack_entry(cursor: &mut Cursor<'_>) -> Result<FileEntry, FlistError> {
    let path_len = cursor.read_u32()? as usize;
    let path = cursor.read_utf8(path_len)?;
    let root_len = cursor.read_u32()? as usize;
    let root = cursor.read_utf8(root_len)?;
    let kind = Kind::from_wire(cursor.read_u8()?)?;
    let len = cursor.read_u64()?;
    let mtime_sec = cursor.read_u32()?;
    let mtime_nsec = cursor.read_u64()?;
    Ok(FileEntry {
        path: PathBuf::from(path),
        root: PathBuf::from(root),
        kind,
        len,
        mtime_sec,
        mtime_nsec,
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FlistError> {
        let end = self.pos.checked_add(n).ok_or(FlistError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(FlistError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, FlistError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FlistError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64, FlistError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, FlistError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FlistError::InvalidUtf8)
    }
}

/// A path-to-mtime mapping loaded from a prior transfer's checkpoint log,
/// used to skip files already completed and unmodified since.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    completed: HashMap<PathBuf, u32>,
}

impl CheckpointSet {
    /// Reads a checkpoint log written by [`CheckpointLog::record`]. Lines
    /// are `<path> <mtime-sec>`; the first line that doesn't parse ends
    /// reading (a truncated final line from a crashed prior run), rather
    /// than failing the whole restart.
    pub fn read(path: &Path) -> Result<Self, FlistError> {
        let file = fs::File::open(path).map_err(|source| FlistError::OpenCheckpoint {
            path: path.display().to_string(),
            source,
        })?;
        let mut completed = HashMap::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let Some((path_part, mtime_part)) = line.rsplit_once(' ') else {
                break;
            };
            let Ok(mtime_sec) = mtime_part.parse::<u32>() else {
                break;
            };
            completed.insert(PathBuf::from(path_part), mtime_sec);
        }
        Ok(Self { completed })
    }

    /// Whether `entry` should be skipped as already transferred, per
    /// `policy`.
    #[must_use]
    pub fn is_completed(&self, entry: &FileEntry, policy: CheckpointPolicy) -> bool {
        match self.completed.get(&entry.path) {
            None => false,
            Some(_) if policy == CheckpointPolicy::IgnoreMtime => true,
            Some(&mtime_sec) => mtime_sec == entry.mtime_sec,
        }
    }
}

/// An append-only checkpoint log the sender writes one line to per
/// completed regular file.
pub struct CheckpointLog {
    file: fs::File,
}

impl CheckpointLog {
    pub fn open(path: &Path) -> Result<Self, FlistError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| FlistError::OpenCheckpoint {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }

    pub fn record(&mut self, entry: &FileEntry) -> Result<(), FlistError> {
        let line = format!("{} {}\n", entry.path.display(), entry.mtime_sec);
        self.file
            .write_all(line.as_bytes())
            .map_err(FlistError::WriteCheckpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walker_emits_root_and_nested_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"hi").unwrap();
        fs::write(root.join("sub/b.txt"), b"bye").unwrap();

        let entries: Vec<_> = Walker::new([root.clone()])
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        let paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains(&root));
        assert!(paths.contains(&root.join("a.txt")));
        assert!(paths.contains(&root.join("sub")));
        assert!(paths.contains(&root.join("sub/b.txt")));
    }

    #[test]
    fn walker_keeps_top_level_directory_name_in_destination_path() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("d");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("x"), b"abc").unwrap();
        fs::write(root.join("sub/y"), b"").unwrap();

        let entries: Vec<_> = Walker::new([root.clone()])
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        let by_path: HashMap<_, _> = entries.iter().map(|e| (e.path.clone(), e)).collect();
        assert_eq!(
            by_path[&root].destination_path(false),
            Path::new("d")
        );
        assert_eq!(
            by_path[&root.join("x")].destination_path(false),
            Path::new("d/x")
        );
        assert_eq!(
            by_path[&root.join("sub")].destination_path(false),
            Path::new("d/sub")
        );
        assert_eq!(
            by_path[&root.join("sub/y")].destination_path(false),
            Path::new("d/sub/y")
        );
    }

    #[test]
    fn pack_and_unpack_round_trip() {
        let mut list = FileList::new();
        list.push(FileEntry {
            path: PathBuf::from("/data/a/b.txt"),
            root: PathBuf::from("/data/a"),
            kind: Kind::Regular,
            len: 42,
            mtime_sec: 100,
            mtime_nsec: 7,
        });
        list.push(FileEntry {
            path: PathBuf::from("/data/a/sub"),
            root: PathBuf::from("/data/a"),
            kind: Kind::Directory,
            len: 0,
            mtime_sec: 50,
            mtime_nsec: 0,
        });

        let packed = pack_file_list(&list);
        let unpacked = unpack_file_list(&packed).unwrap();
        assert_eq!(unpacked, list);
    }

    #[test]
    fn unpack_rejects_truncated_data() {
        let err = unpack_file_list(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FlistError::UnexpectedEof));
    }

    #[test]
    fn checkpoint_set_skips_matching_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("log");
        fs::write(&log_path, "/data/a.txt 100\n/data/b.txt 200\n").unwrap();

        let set = CheckpointSet::read(&log_path).unwrap();
        let entry = FileEntry {
            path: PathBuf::from("/data/a.txt"),
            root: PathBuf::from("/data"),
            kind: Kind::Regular,
            len: 1,
            mtime_sec: 100,
            mtime_nsec: 0,
        };
        assert!(set.is_completed(&entry, CheckpointPolicy::RequireMatchingMtime));

        let modified = FileEntry { mtime_sec: 101, ..entry };
        assert!(!set.is_completed(&modified, CheckpointPolicy::RequireMatchingMtime));
        assert!(set.is_completed(&modified, CheckpointPolicy::IgnoreMtime));
    }

    #[test]
    fn checkpoint_set_stops_at_malformed_trailing_line() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("log");
        fs::write(&log_path, "/data/a.txt 100\ngarbage-line\n").unwrap();

        let set = CheckpointSet::read(&log_path).unwrap();
        assert_eq!(set.completed.len(), 1);
    }

    #[test]
    fn checkpoint_log_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("log");
        let mut log = CheckpointLog::open(&log_path).unwrap();
        log.record(&FileEntry {
            path: PathBuf::from("/data/a.txt"),
            root: PathBuf::from("/data"),
            kind: Kind::Regular,
            len: 1,
            mtime_sec: 5,
            mtime_nsec: 0,
        })
        .unwrap();
        drop(log);

        let contents = fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "/data/a.txt 5\n");
    }

    #[test]
    fn destination_path_strips_root_unless_full_root() {
        let entry = FileEntry {
            path: PathBuf::from("/data/a/sub/b.txt"),
            root: PathBuf::from("/data/a"),
            kind: Kind::Regular,
            len: 1,
            mtime_sec: 0,
            mtime_nsec: 0,
        };
        assert_eq!(entry.destination_path(false), Path::new("sub/b.txt"));
        assert_eq!(entry.destination_path(true), Path::new("/data/a/sub/b.txt"));
    }
}
