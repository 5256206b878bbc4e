//! ssh / sshpass invocation contract
//!
//! Every channel to the remote host is an `ssh` child process. Agent
//! channels run with `-T` so no PTY corrupts the binary protocol and use
//! `exec` so killing the process group reaches the remote interpreter;
//! one-shot enumeration commands keep the same option set minus `-T`.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Result;
use tokio::process::Command;

use crate::error::TransferError;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub password: Option<String>,
    pub compression: bool,
}

// AES-GCM first for throughput on AES-NI hosts, CTR as the fallback pair.
const CIPHERS: &str = "aes128-gcm@openssh.com,aes256-gcm@openssh.com,aes128-ctr,aes256-ctr";

/// Common `ssh` argv up to (not including) the remote command.
/// `tty` is always disabled for agent channels; one-shot commands leave the
/// default behavior in place.
pub fn build_argv(cfg: &SshConfig, disable_tty: bool) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if disable_tty {
        argv.push("-T".into());
    }
    argv.push("-p".into());
    argv.push(cfg.port.to_string());
    for opt in [
        format!("Ciphers={CIPHERS}"),
        "IPQoS=throughput".into(),
        "ServerAliveInterval=60".into(),
        "StrictHostKeyChecking=accept-new".into(),
    ] {
        argv.push("-o".into());
        argv.push(opt);
    }
    if cfg.compression {
        argv.push("-C".into());
    }
    if let Some(key) = &cfg.identity {
        argv.push("-i".into());
        argv.push(key.to_string_lossy().into_owned());
    }
    argv.push(format!("{}@{}", cfg.user, cfg.host));
    argv
}

/// Build the command for an agent channel running `remote_cmd`.
pub fn agent_command(cfg: &SshConfig, remote_cmd: &str) -> Result<Command> {
    let mut argv = build_argv(cfg, true);
    argv.push(remote_cmd.to_string());
    let mut cmd = wrap_password(cfg, argv)?;
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// Build the command for a one-shot remote shell command.
pub fn oneshot_command(cfg: &SshConfig, remote_cmd: &str) -> Result<Command> {
    let mut argv = build_argv(cfg, false);
    argv.push(remote_cmd.to_string());
    let mut cmd = wrap_password(cfg, argv)?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    Ok(cmd)
}

fn wrap_password(cfg: &SshConfig, ssh_argv: Vec<String>) -> Result<Command> {
    match &cfg.password {
        Some(pw) => {
            let sshpass = locate_in(std::env::var_os("PATH").as_deref(), "sshpass")
                .ok_or_else(|| {
                    TransferError::Auth(
                        "password authentication requires sshpass, which was not found in PATH"
                            .into(),
                    )
                })?;
            let mut cmd = Command::new(sshpass);
            cmd.arg("-p").arg(pw).arg("ssh").args(&ssh_argv);
            Ok(cmd)
        }
        None => {
            let mut cmd = Command::new("ssh");
            cmd.args(&ssh_argv);
            Ok(cmd)
        }
    }
}

fn locate_in(path_var: Option<&OsStr>, bin: &str) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_var?) {
        let cand = dir.join(bin);
        if cand.is_file() {
            return Some(cand);
        }
    }
    None
}

/// POSIX single-quote escaping for paths embedded in one-shot commands.
/// Paths on the agent wire are length-prefixed and never pass through here.
pub fn sh_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SshConfig {
        SshConfig {
            user: "deploy".into(),
            host: "build-3".into(),
            port: 2222,
            identity: None,
            password: None,
            compression: false,
        }
    }

    #[test]
    fn agent_argv_shape() {
        let argv = build_argv(&cfg(), true);
        assert_eq!(argv[0], "-T");
        assert_eq!(argv[1], "-p");
        assert_eq!(argv[2], "2222");
        assert!(argv.iter().any(|a| a.starts_with("Ciphers=aes128-gcm")));
        assert!(argv.contains(&"IPQoS=throughput".to_string()));
        assert!(argv.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert_eq!(argv.last().unwrap(), "deploy@build-3");
    }

    #[test]
    fn oneshot_argv_keeps_tty_default() {
        let argv = build_argv(&cfg(), false);
        assert!(!argv.contains(&"-T".to_string()));
    }

    #[test]
    fn compression_and_identity_flags() {
        let mut c = cfg();
        c.compression = true;
        c.identity = Some(PathBuf::from("/home/deploy/.ssh/id_ed25519"));
        let argv = build_argv(&c, true);
        assert!(argv.contains(&"-C".to_string()));
        let i = argv.iter().position(|a| a == "-i").unwrap();
        assert_eq!(argv[i + 1], "/home/deploy/.ssh/id_ed25519");
    }

    #[test]
    fn quote_survives_awkward_paths() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("with space"), "'with space'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote("naïve-ütf8"), "'naïve-ütf8'");
    }

    #[test]
    fn locate_misses_on_empty_path() {
        assert!(locate_in(Some(OsStr::new("")), "sshpass-definitely-missing").is_none());
        assert!(locate_in(None, "sshpass").is_none());
    }
}
