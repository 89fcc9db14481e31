//! Remote shell command construction and host:path URI parsing.
//!
//! Parses the `--rsh` flag's command string the way a shell would (quoted
//! arguments, backslash escapes) and builds the full argv used to spawn the
//! peer over it.
//!
//! # Upstream reference
//!
//! Grounded directly on the teacher workspace's `core::remote_shell`
//! module (`RemoteShell::new`/`build_command`, `parse_shell_command`,
//! `parse_ssh_uri`), trimmed of `SshConfig` — this tool exposes one `--rsh`
//! string, not the individual per-flag SSH options the teacher's broader
//! CLI surface accepts.

use std::borrow::Cow;

/// A parsed remote-shell command: the program to run and its fixed
/// arguments, before the host and peer invocation are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShell {
    program: String,
    args: Vec<String>,
}

impl RemoteShell {
    /// Parses a command string such as `"ssh -p 2222 -o StrictHostKeyChecking=no"`.
    pub fn new(command: &str) -> Self {
        let parts = parse_shell_command(command);
        if parts.is_empty() {
            return Self::default();
        }
        Self {
            program: parts[0].clone(),
            args: parts[1..].to_vec(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Builds the full command line to spawn the peer: the shell program
    /// and its fixed arguments, the target host, the remote binary, and
    /// that binary's own arguments.
    pub fn build_command(&self, host: &str, remote_binary: &str, remote_args: &[String]) -> Vec<String> {
        let mut command = Vec::with_capacity(2 + self.args.len() + 1 + remote_args.len());
        command.push(self.program.clone());
        command.extend(self.args.iter().cloned());
        command.push(host.to_string());
        command.push(remote_binary.to_string());
        command.extend(remote_args.iter().cloned());
        command
    }
}

impl Default for RemoteShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            args: Vec::new(),
        }
    }
}

/// Splits a command string into program + arguments, honoring single/double
/// quotes and backslash escapes the way a POSIX shell would.
pub fn parse_shell_command(command: &str) -> Vec<String> {
    let command = command.trim();
    if command.is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut escaped = false;

    for ch in command.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if in_single_quote => current.push(ch),
            '\\' => escaped = true,
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            c if c.is_whitespace() && !in_single_quote && !in_double_quote => {
                if !current.is_empty() {
                    parts.push(current.clone());
                    current.clear();
                }
            }
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Splits a `-r` argument of the form `user@host:path` or `host:path` into
/// its optional user, host, and path components. Returns `None` for a
/// string with no `:` (a purely local path).
pub fn parse_host_path(spec: &str) -> Option<(Option<&str>, &str, &str)> {
    let colon_pos = spec.find(':')?;
    let host_part = &spec[..colon_pos];
    let path_part = &spec[colon_pos + 1..];

    Some(match host_part.find('@') {
        Some(at_pos) => (Some(&host_part[..at_pos]), &host_part[at_pos + 1..], path_part),
        None => (None, host_part, path_part),
    })
}

/// Whether a shell argument needs quoting to survive a round trip through
/// a shell unmodified.
pub fn needs_quoting(arg: &str) -> bool {
    if arg.is_empty() {
        return true;
    }
    const SPECIAL_CHARS: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];
    arg.chars().any(|c| SPECIAL_CHARS.contains(&c))
}

/// Quotes `arg` for a shell command line only if it needs it.
pub fn quote_shell_arg(arg: &str) -> Cow<'_, str> {
    if !needs_quoting(arg) {
        return Cow::Borrowed(arg);
    }
    let quoted = arg.replace('\'', r"'\''");
    Cow::Owned(format!("'{quoted}'"))
}
