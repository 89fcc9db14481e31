#![deny(unsafe_code)]

//! # Overview
//!
//! The `udxfer` command line: `udxfer source_dir... -r host:dest` to send,
//! `udxfer -l [dest_dir]` to listen. Parses flags with `clap`, builds a
//! [`core::Config`], and hands off to [`session::run_initiator`] or
//! [`session::run_responder`].
//!
//! # Design
//!
//! Grounded in `parcel.cpp`'s `parse_options`/`usage` for the flag surface
//! (`-l [dest_dir]`, `-r host:dest`, `-k log`, `-n`, `-p port`, verbosity
//! flags, `--full-root`) and in the teacher workspace's `bin/oc-rsync`
//! for the "thin binary, `run` takes args + stdio handles, returns an
//! exit code" shape — kept here as the boundary between parsed arguments
//! and [`session`]'s orchestration rather than split across a separate
//! binary crate, since this tool has one binary and no daemon mode.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use core::{CheckpointPolicy, CipherSuite, Config, Encryption, Role};

/// Parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "udxfer",
    version,
    about = "High-throughput bulk file transfer over a reliable transport"
)]
struct Args {
    /// Source paths to send. Ignored (and may be omitted) in listen mode.
    paths: Vec<PathBuf>,

    /// Listen for an incoming transfer and write underneath `DEST_DIR`
    /// (`.` if omitted).
    #[arg(short = 'l', value_name = "DEST_DIR", num_args = 0..=1, default_missing_value = ".")]
    listen: Option<PathBuf>,

    /// Initiate a transfer to `host:dest`.
    #[arg(short = 'r', value_name = "HOST:DEST")]
    remote: Option<String>,

    /// Restart from, and append to, a checkpoint log.
    #[arg(short = 'k', value_name = "LOG")]
    checkpoint_log: Option<PathBuf>,

    /// Enable the crypto pipeline.
    #[arg(short = 'n')]
    encrypt: bool,

    /// Number of crypto worker threads (1-32).
    #[arg(long, value_name = "N", default_value_t = 1)]
    crypto_threads: u8,

    /// Cipher suite when encryption is enabled.
    #[arg(long, value_name = "SUITE", default_value = "aes128")]
    cipher: String,

    /// Transport port.
    #[arg(short = 'p', default_value_t = 9000)]
    port: u16,

    /// Increase verbosity (-v info, -vv debug).
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Suppress warning-level diagnostics.
    #[arg(long)]
    quiet: bool,

    /// Log output format.
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    log_format: String,

    /// Send absolute paths instead of root-relative ones.
    #[arg(long)]
    full_root: bool,

    /// Send character devices and FIFOs instead of skipping them.
    #[arg(long)]
    all_files: bool,

    /// Watchdog timeout in seconds; 0 disables it.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    timeout: u64,

    /// Remote shell command used to spawn the peer.
    #[arg(long, value_name = "SHELL", default_value = "ssh")]
    rsh: String,
}

/// Errors surfaced while parsing arguments or building a [`Config`] from
/// them, before any transfer begins.
#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    #[error("unrecognized cipher suite {0:?}")]
    UnknownCipher(String),
    #[error("--crypto-threads must be between 1 and 32, got {0}")]
    CryptoThreadsOutOfRange(u8),
    #[error("either -l (listen) or -r host:dest (remote) must be given")]
    NoRole,
    #[error("-r host:dest must contain a ':' separating host and destination")]
    MalformedRemote(String),
}

fn parse_cipher(name: &str) -> Result<CipherSuite, ArgsError> {
    match name {
        "aes128" => Ok(CipherSuite::Aes128Cfb),
        "aes192" => Ok(CipherSuite::Aes192Cfb),
        "aes256" => Ok(CipherSuite::Aes256Cfb),
        "aes128-ctr" => Ok(CipherSuite::Aes128Ctr),
        "aes192-ctr" => Ok(CipherSuite::Aes192Ctr),
        "aes256-ctr" => Ok(CipherSuite::Aes256Ctr),
        "3des" => Ok(CipherSuite::TripleDesCfb),
        "blowfish" => Ok(CipherSuite::BlowfishCfb),
        other => Err(ArgsError::UnknownCipher(other.to_string())),
    }
}

fn verbosity_of(args: &Args) -> logging::Verbosity {
    if args.quiet {
        logging::Verbosity::Quiet
    } else {
        match args.verbose {
            0 => logging::Verbosity::Normal,
            1 => logging::Verbosity::Verbose,
            _ => logging::Verbosity::Debug,
        }
    }
}

fn log_format_of(args: &Args) -> logging::LogFormat {
    match args.log_format.as_str() {
        "json" => logging::LogFormat::Json,
        _ => logging::LogFormat::Text,
    }
}

/// Everything [`run`] needs beyond a bare [`Config`]: the role-specific
/// bits a `Config` alone can't carry (the remote host, for an initiator).
struct Invocation {
    config: Config,
    host: Option<String>,
}

fn build_invocation(args: &Args) -> Result<Invocation, ArgsError> {
    if args.crypto_threads == 0 || args.crypto_threads > 32 {
        return Err(ArgsError::CryptoThreadsOutOfRange(args.crypto_threads));
    }

    let encryption = if args.encrypt {
        let suite = parse_cipher(&args.cipher)?;
        let workers = std::num::NonZeroU8::new(args.crypto_threads)
            .ok_or(ArgsError::CryptoThreadsOutOfRange(args.crypto_threads))?;
        Encryption::Enabled { suite, workers }
    } else {
        Encryption::Disabled
    };

    let timeout = if args.timeout == 0 {
        None
    } else {
        Some(std::time::Duration::from_secs(args.timeout))
    };

    let (role, paths, host) = match (&args.listen, &args.remote) {
        (Some(dest_dir), None) => (Role::Responder, vec![dest_dir.clone()], None),
        (None, Some(spec)) => {
            let (_, host, dest) =
                session::remote_shell::parse_host_path(spec).ok_or_else(|| ArgsError::MalformedRemote(spec.clone()))?;
            let mut paths = args.paths.clone();
            paths.push(PathBuf::from(dest));
            (Role::Initiator, paths, Some(host.to_string()))
        }
        _ => return Err(ArgsError::NoRole),
    };

    let config = Config {
        role,
        paths,
        port: args.port,
        encryption,
        checkpoint_log: args.checkpoint_log.clone(),
        checkpoint_policy: CheckpointPolicy::RequireMatchingMtime,
        timeout,
        full_root: args.full_root,
        all_files: args.all_files,
        quiet: args.quiet,
        remote_shell: args.rsh.clone(),
    };

    Ok(Invocation { config, host })
}

/// Parses `args`, configures logging, and runs the transfer. Returns the
/// process exit code.
pub fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let parsed = match Args::try_parse_from(args) {
        Ok(a) => a,
        Err(err) => {
            let _ = err.print();
            return core::EXIT_USAGE_ERROR;
        }
    };

    logging::init(verbosity_of(&parsed), log_format_of(&parsed));

    let invocation = match build_invocation(&parsed) {
        Ok(inv) => inv,
        Err(err) => {
            tracing::error!(error = %err, "invalid arguments");
            return core::EXIT_USAGE_ERROR;
        }
    };

    match try_run(invocation, &parsed.paths) {
        Ok(()) => core::EXIT_SUCCESS,
        Err(err) if err.downcast_ref::<MissingHost>().is_some() => {
            tracing::error!("missing remote host for initiator role");
            core::EXIT_USAGE_ERROR
        }
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "transfer failed");
            core::EXIT_TRANSFER_FAILED
        }
    }
}

/// Marks a [`try_run`] failure that should map to [`core::EXIT_USAGE_ERROR`]
/// rather than [`core::EXIT_TRANSFER_FAILED`]: the one case where a
/// missing flag is only caught once the role is known, after
/// [`build_invocation`] has already succeeded.
#[derive(Debug, thiserror::Error)]
#[error("missing remote host for initiator role")]
struct MissingHost;

/// Loads the checkpoint state for a `-k <log>` sender run: an existing
/// log is parsed into a [`flist::CheckpointSet`] to skip already-completed
/// files, and the same path is (re)opened in append mode so newly
/// completed files get recorded. No `-k` flag means no checkpointing at
/// all, not an error.
fn load_checkpoint(
    path: &PathBuf,
) -> Result<(flist::CheckpointSet, flist::CheckpointLog), flist::FlistError> {
    let set = if path.exists() {
        flist::CheckpointSet::read(path)?
    } else {
        flist::CheckpointSet::default()
    };
    let log = flist::CheckpointLog::open(path)?;
    Ok((set, log))
}

/// Drives the transfer for a parsed [`Invocation`], attaching [`anyhow`]
/// context at each fallible step so [`run`]'s top-level error log prints
/// the whole chain (e.g. "transfer failed: failed to open checkpoint log
/// /var/log/udxfer.log: permission denied") instead of just the innermost
/// message.
fn try_run(invocation: Invocation, source_paths: &[PathBuf]) -> Result<()> {
    let Invocation { config, host } = invocation;

    match config.role {
        Role::Responder => {
            let dest = config.paths.first().cloned().unwrap_or_else(|| PathBuf::from("."));
            session::run_responder(&config, &dest).context("responder transfer failed")
        }
        Role::Initiator => {
            let host = host.ok_or(MissingHost)?;
            let dest = config.paths.last().cloned().unwrap_or_default();
            let plan = build_plan(source_paths, &config).context("failed to walk source paths")?;

            let loaded = config
                .checkpoint_log
                .as_ref()
                .map(|path| load_checkpoint(path).with_context(|| format!("failed to open checkpoint log {}", path.display())))
                .transpose()?;
            let (checkpoint, mut checkpoint_log) = match loaded {
                Some((set, log)) => (Some(set), Some(log)),
                None => (None, None),
            };
            let opts = engine::sender::SendOptions {
                full_root: config.full_root,
                all_files: config.all_files,
                checkpoint_policy: config.checkpoint_policy,
                checkpoint: checkpoint.as_ref(),
                checkpoint_log: checkpoint_log.as_mut(),
                remote_has: None,
            };
            let remote_args = vec!["-l".to_string(), dest.display().to_string()];
            session::run_initiator(&config, &host, "udxfer", &remote_args, &plan, opts)
                .context("initiator transfer failed")
        }
    }
}

fn build_plan(source_paths: &[PathBuf], _config: &Config) -> Result<flist::FileList, flist::FlistError> {
    let mut plan = flist::FileList::new();
    for entry in flist::Walker::new(source_paths.iter().cloned()) {
        plan.push(entry?);
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_mode_defaults_destination_to_cwd() {
        let args = Args::try_parse_from(["udxfer", "-l"]).unwrap();
        let invocation = build_invocation(&args).unwrap();
        assert_eq!(invocation.config.role, Role::Responder);
        assert_eq!(invocation.config.paths, vec![PathBuf::from(".")]);
    }

    #[test]
    fn remote_mode_requires_a_colon_separated_spec() {
        let args = Args::try_parse_from(["udxfer", "src", "-r", "nocolon"]).unwrap();
        let err = build_invocation(&args).unwrap_err();
        assert!(matches!(err, ArgsError::MalformedRemote(_)));
    }

    #[test]
    fn remote_mode_parses_host_and_appends_destination() {
        let args = Args::try_parse_from(["udxfer", "src", "-r", "example.com:/data"]).unwrap();
        let invocation = build_invocation(&args).unwrap();
        assert_eq!(invocation.config.role, Role::Initiator);
        assert_eq!(invocation.host.as_deref(), Some("example.com"));
        assert_eq!(invocation.config.paths.last(), Some(&PathBuf::from("/data")));
    }

    #[test]
    fn neither_listen_nor_remote_is_a_usage_error() {
        let args = Args::try_parse_from(["udxfer", "src"]).unwrap();
        let err = build_invocation(&args).unwrap_err();
        assert!(matches!(err, ArgsError::NoRole));
    }

    #[test]
    fn crypto_threads_out_of_range_is_rejected() {
        let args = Args::try_parse_from(["udxfer", "-l", "-n", "--crypto-threads", "0"]).unwrap();
        let err = build_invocation(&args).unwrap_err();
        assert!(matches!(err, ArgsError::CryptoThreadsOutOfRange(0)));
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        let args = Args::try_parse_from(["udxfer", "-l", "-n", "--cipher", "rot13"]).unwrap();
        let err = build_invocation(&args).unwrap_err();
        assert!(matches!(err, ArgsError::UnknownCipher(ref s) if s == "rot13"));
    }

    #[test]
    fn load_checkpoint_starts_empty_when_log_does_not_exist_yet() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("fresh.log");
        let (set, mut log) = load_checkpoint(&log_path).unwrap();
        assert!(!set.is_completed(
            &flist::FileEntry {
                path: PathBuf::from("a.txt"),
                root: PathBuf::new(),
                kind: flist::Kind::Regular,
                len: 0,
                mtime_sec: 1,
                mtime_nsec: 0,
            },
            CheckpointPolicy::RequireMatchingMtime,
        ));
        log.record(&flist::FileEntry {
            path: PathBuf::from("a.txt"),
            root: PathBuf::new(),
            kind: flist::Kind::Regular,
            len: 0,
            mtime_sec: 1,
            mtime_nsec: 0,
        })
        .unwrap();
        assert!(log_path.exists());
    }

    #[test]
    fn load_checkpoint_picks_up_entries_from_a_prior_run() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("resume.log");
        std::fs::write(&log_path, "a.txt 42\n").unwrap();

        let (set, _log) = load_checkpoint(&log_path).unwrap();
        assert!(set.is_completed(
            &flist::FileEntry {
                path: PathBuf::from("a.txt"),
                root: PathBuf::new(),
                kind: flist::Kind::Regular,
                len: 0,
                mtime_sec: 42,
                mtime_nsec: 0,
            },
            CheckpointPolicy::RequireMatchingMtime,
        ));
    }

    #[test]
    fn build_plan_walks_a_temp_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let config = Config {
            role: Role::Initiator,
            paths: vec![],
            port: 9000,
            encryption: Encryption::Disabled,
            checkpoint_log: None,
            checkpoint_policy: CheckpointPolicy::RequireMatchingMtime,
            timeout: None,
            full_root: false,
            all_files: false,
            quiet: false,
            remote_shell: "ssh".to_string(),
        };
        let plan = build_plan(&[dir.path().to_path_buf()], &config).unwrap();
        assert!(plan.iter().any(|e| e.path.ends_with("a.txt")));
    }
}
