//! Source argument parsing for `[user@]host:path` triples

use anyhow::{bail, Result};

use crate::error::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl RemoteSource {
    /// `user@host`, the endpoint identity all sources of one transfer share.
    pub fn endpoint(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Shell wildcards are expanded remotely before enumeration.
    pub fn is_wildcard(&self) -> bool {
        self.path.contains('*') || self.path.contains('?')
    }
}

/// Parse one source argument. The user part is optional and defaults to the
/// invoking user (falling back to `root`).
///
/// The user ends at the first `@` and may contain `:`; the host then runs
/// to the next `:` and the rest is the path. When that shape does not hold
/// (no `@`, empty user, or nothing host-like after the `@`), the whole
/// prefix up to the first `:` is the host, `@`s included.
pub fn parse_source(input: &str) -> Result<RemoteSource> {
    if let Some((user, rest)) = input.split_once('@') {
        if !user.is_empty() {
            if let Some((host, path)) = rest.split_once(':') {
                if !host.is_empty() && !path.is_empty() {
                    return Ok(RemoteSource {
                        user: user.to_string(),
                        host: host.to_string(),
                        path: path.to_string(),
                    });
                }
            }
        }
    }
    match input.split_once(':') {
        Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(RemoteSource {
            user: default_user(),
            host: host.to_string(),
            path: path.to_string(),
        }),
        _ => Err(TransferError::Parse(input.to_string()).into()),
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

/// All sources of a transfer must point at the same `user@host`; mixed
/// endpoints are fatal before any network activity.
pub fn ensure_same_endpoint(sources: &[RemoteSource]) -> Result<()> {
    let Some(first) = sources.first() else {
        bail!("at least one source is required");
    };
    for s in &sources[1..] {
        if s.user != first.user || s.host != first.host {
            bail!(
                "all sources must share one user@host: '{}' does not match '{}'",
                s.endpoint(),
                first.endpoint()
            );
        }
    }
    Ok(())
}

/// Guardrail for the destination argument: anything that parses like a
/// remote triple is refused so a typo cannot scatter files onto the remote.
pub fn looks_remote(dest: &str) -> bool {
    parse_source(dest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_triple() {
        let s = parse_source("deploy@build-3:/srv/artifacts").unwrap();
        assert_eq!(s.user, "deploy");
        assert_eq!(s.host, "build-3");
        assert_eq!(s.path, "/srv/artifacts");
        assert!(!s.is_wildcard());
    }

    #[test]
    fn user_defaults_when_omitted() {
        let s = parse_source("build-3:/srv/data").unwrap();
        assert_eq!(s.host, "build-3");
        assert!(!s.user.is_empty());
    }

    #[test]
    fn path_keeps_embedded_colons() {
        let s = parse_source("h:/srv/odd:name").unwrap();
        assert_eq!(s.path, "/srv/odd:name");

        let s = parse_source("a@b:c@d:e").unwrap();
        assert_eq!(s.user, "a");
        assert_eq!(s.host, "b");
        assert_eq!(s.path, "c@d:e");
    }

    #[test]
    fn user_segment_may_contain_colon() {
        // The user runs to the first '@' even across a ':'; the host is
        // what follows, up to the next ':'.
        let s = parse_source("a:b@host:path").unwrap();
        assert_eq!(s.user, "a:b");
        assert_eq!(s.host, "host");
        assert_eq!(s.path, "path");
    }

    #[test]
    fn unusable_user_segment_falls_back_to_host() {
        // No user before the '@': the prefix up to the first ':' is the
        // host, '@' and all.
        let s = parse_source("@host:/x").unwrap();
        assert_eq!(s.host, "@host");
        assert_eq!(s.path, "/x");

        // Nothing host-like between '@' and ':': same fallback.
        let s = parse_source("user@:/x").unwrap();
        assert_eq!(s.host, "user@");
        assert_eq!(s.path, "/x");
    }

    #[test]
    fn wildcard_detection() {
        assert!(parse_source("h:/var/log/*.log").unwrap().is_wildcard());
        assert!(parse_source("h:/var/log/app.?").unwrap().is_wildcard());
        assert!(!parse_source("h:/var/log/app.log").unwrap().is_wildcard());
    }

    #[test]
    fn rejects_malformed_inputs() {
        for bad in ["no-colon-here", ":path-only", "host:", "user@host:"] {
            let err = parse_source(bad).unwrap_err();
            assert!(err.to_string().contains(bad), "error should name '{bad}'");
        }
    }

    #[test]
    fn endpoint_mismatch_is_fatal() {
        let a = parse_source("alice@h1:/a").unwrap();
        let b = parse_source("alice@h2:/b").unwrap();
        assert!(ensure_same_endpoint(&[a.clone()]).is_ok());
        let err = ensure_same_endpoint(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("alice@h2"));
    }

    #[test]
    fn destination_guardrail() {
        assert!(looks_remote("host:/tmp/x"));
        assert!(looks_remote("user@host:dir"));
        assert!(!looks_remote("./out"));
        assert!(!looks_remote("/tmp/dest"));
    }
}
