#![deny(unsafe_code)]

//! # Overview
//!
//! Shared, dependency-light types used across the udxfer workspace so that
//! no crate reaches for process-wide mutable state: the [`Config`] record
//! built once by the CLI layer and threaded through the session
//! orchestrator, the transport thread pair, and both protocol drivers; the
//! [`Role`] a peer plays in a given transfer; the closed [`CipherSuite`]
//! set; and the process [`ExitCode`] values the binary returns.
//!
//! # Design
//!
//! This mirrors the teacher workspace's `client::config`/`exit_code`
//! split: configuration is data, not a singleton, and every exit code the
//! binary can produce has a name here rather than a bare integer scattered
//! through the call graph.

use std::num::NonZeroU8;
use std::path::PathBuf;
use std::time::Duration;

/// Which side of the handshake a peer plays.
///
/// The initiator spawns the remote peer over the bootstrap channel and
/// generates the session key (if encryption is enabled); the responder is
/// the spawned side and reads the key back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Spawned the peer and drives the file walk and sender protocol.
    Initiator,
    /// Was spawned, listens for the incoming transport, drives the
    /// receiver protocol.
    Responder,
}

/// The closed set of symmetric cipher suites the crypto pipeline supports.
///
/// Suite and key length must match between peers; this is enforced at
/// session setup, not negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// AES-128 in CFB mode.
    Aes128Cfb,
    /// AES-192 in CFB mode.
    Aes192Cfb,
    /// AES-256 in CFB mode.
    Aes256Cfb,
    /// AES-128 in CTR mode.
    Aes128Ctr,
    /// AES-192 in CTR mode.
    Aes192Ctr,
    /// AES-256 in CTR mode.
    Aes256Ctr,
    /// Triple-DES in CFB mode.
    TripleDesCfb,
    /// Blowfish in CFB mode.
    BlowfishCfb,
}

impl CipherSuite {
    /// Key length this suite requires, in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Cfb | CipherSuite::Aes128Ctr => 16,
            CipherSuite::Aes192Cfb | CipherSuite::Aes192Ctr => 24,
            CipherSuite::Aes256Cfb | CipherSuite::Aes256Ctr => 32,
            CipherSuite::TripleDesCfb => 24,
            CipherSuite::BlowfishCfb => 16,
        }
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::Aes128Cfb
    }
}

/// Encryption settings, or their absence.
#[derive(Debug, Clone, Default)]
pub enum Encryption {
    /// No crypto pipeline; frames move in the clear.
    #[default]
    Disabled,
    /// Crypto pipeline enabled with the given suite and worker count.
    Enabled {
        /// Cipher suite both peers must agree on.
        suite: CipherSuite,
        /// Number of crypto worker threads (1-32).
        workers: NonZeroU8,
    },
}

/// How the receiver should treat an entry already recorded in its
/// checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointPolicy {
    /// Skip a file only if its checkpointed mtime still matches the
    /// sender's observed mtime.
    #[default]
    RequireMatchingMtime,
    /// Skip any checkpointed file regardless of mtime.
    IgnoreMtime,
}

/// Explicit, immutable configuration for one transfer, built once by the
/// CLI layer and passed by reference to every other crate. No crate other
/// than `cli`/`session` should construct one of these from the environment
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// This peer's role in the handshake.
    pub role: Role,
    /// Top-level source paths (initiator) or the destination root
    /// (responder).
    pub paths: Vec<PathBuf>,
    /// Transport port to bind (`responder`) or connect to (`initiator`).
    pub port: u16,
    /// Encryption settings.
    pub encryption: Encryption,
    /// Checkpoint log path, if resuming/recording one.
    pub checkpoint_log: Option<PathBuf>,
    /// Checkpoint comparison policy.
    pub checkpoint_policy: CheckpointPolicy,
    /// Watchdog timeout; `None` disables the watchdog entirely.
    pub timeout: Option<Duration>,
    /// Send absolute paths instead of paths relative to each root.
    pub full_root: bool,
    /// Send character devices and FIFOs instead of skipping them.
    pub all_files: bool,
    /// Suppress warning-level diagnostics.
    pub quiet: bool,
    /// Remote shell command used to spawn the peer (e.g. `"ssh"`).
    pub remote_shell: String,
}

/// Exit code returned when argument parsing or validation fails.
pub const EXIT_USAGE_ERROR: i32 = 1;
/// Exit code returned when the transfer itself fails unrecoverably.
pub const EXIT_TRANSFER_FAILED: i32 = 1;
/// Exit code returned on success.
pub const EXIT_SUCCESS: i32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_suite_key_lengths_match_named_algorithms() {
        assert_eq!(CipherSuite::Aes128Cfb.key_len(), 16);
        assert_eq!(CipherSuite::Aes192Ctr.key_len(), 24);
        assert_eq!(CipherSuite::Aes256Cfb.key_len(), 32);
        assert_eq!(CipherSuite::TripleDesCfb.key_len(), 24);
        assert_eq!(CipherSuite::BlowfishCfb.key_len(), 16);
    }

    #[test]
    fn default_encryption_is_disabled() {
        assert!(matches!(Encryption::default(), Encryption::Disabled));
    }
}
