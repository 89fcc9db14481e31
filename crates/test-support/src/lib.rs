#![deny(unsafe_code)]

//! # Overview
//!
//! Fixtures shared by more than one crate's test suite: a temp-directory
//! tree builder, an in-process duplex byte channel standing in for the
//! local pipe between the protocol driver and the transport thread pair,
//! and a loopback TCP pair standing in for the reliable-UDP transport
//! socket — the same substitution `transport`'s own tests already make,
//! lifted here so `session` and `cli` integration tests can reuse it
//! instead of each re-deriving their own loopback helper.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Builds a directory tree under a fresh temp dir from `(relative_path,
/// contents)` pairs, creating parent directories as needed.
pub fn temp_tree(files: &[(&str, &[u8])]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    for (relative, contents) in files {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent directory");
        }
        std::fs::write(&path, contents).expect("failed to write fixture file");
    }
    dir
}

/// Returns `true` if every file in `files` exists under `root` with the
/// given contents.
pub fn assert_tree_matches(root: &Path, files: &[(&str, &[u8])]) {
    for (relative, expected) in files {
        let path = root.join(relative);
        let actual = std::fs::read(&path)
            .unwrap_or_else(|err| panic!("expected {} to exist: {err}", path.display()));
        assert_eq!(actual, *expected, "contents mismatch for {}", path.display());
    }
}

/// An in-process full-duplex byte channel, standing in for one of the
/// local pipes between a protocol driver and a transport thread.
pub fn duplex_pair() -> io::Result<(UnixStream, UnixStream)> {
    UnixStream::pair()
}

/// A loopback TCP connection, standing in for the reliable-UDP transport
/// socket in tests that need a real `Read + Write + Send` stream rather
/// than an in-memory buffer.
pub fn loopback_tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind loopback listener");
    let addr = listener.local_addr().expect("failed to read loopback address");
    let client = std::thread::spawn(move || TcpStream::connect(addr).expect("failed to connect loopback client"));
    let (server, _) = listener.accept().expect("failed to accept loopback connection");
    (server, client.join().expect("loopback connect thread panicked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn temp_tree_writes_nested_files() {
        let dir = temp_tree(&[("a.txt", b"hello"), ("sub/b.txt", b"world")]);
        assert_tree_matches(dir.path(), &[("a.txt", b"hello"), ("sub/b.txt", b"world")]);
    }

    #[test]
    fn duplex_pair_round_trips_bytes() {
        let (mut a, mut b) = duplex_pair().unwrap();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn loopback_tcp_pair_connects() {
        let (mut server, mut client) = loopback_tcp_pair();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
