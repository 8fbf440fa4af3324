//! Claude subprocess plumbing: binary resolution, the reduced-privilege
//! credential, and the allow-listed environment handed to every invocation.

pub mod stream;

use std::path::PathBuf;

use tracing::{info, warn};

/// Hard wall-clock budget for a single assistant turn.
pub const TURN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Resolve the claude binary path: `$CLAUDE_PATH`, falling back to
/// `~/.local/bin/claude`, with symlinks resolved.
pub fn resolve_binary() -> PathBuf {
    let path = match std::env::var("CLAUDE_PATH") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => crate::config::home_dir().join(".local/bin/claude"),
    };
    std::fs::canonicalize(&path).unwrap_or(path)
}

/// Uid/gid pair the assistant subprocess is started under when the bridge
/// runs with an unprivileged claude user configured.
#[derive(Debug, Clone, Copy)]
pub struct RunAsUser {
    pub uid: u32,
    pub gid: u32,
}

/// Look up the unprivileged subprocess user named by `$CLAUDE_RUN_AS_USER`
/// (default `pai`). Returns `None` — and the subprocess runs as the current
/// user — when the account does not exist.
pub fn lookup_run_as_user() -> Option<RunAsUser> {
    let name = match std::env::var("CLAUDE_RUN_AS_USER") {
        Ok(u) if !u.is_empty() => u,
        _ => "pai".to_string(),
    };
    match lookup_user(&name) {
        Some(user) => {
            info!(user = %name, uid = user.uid, gid = user.gid, "claude subprocesses will run unprivileged");
            Some(user)
        }
        None => {
            warn!(user = %name, "user not found, claude will run as the current user");
            None
        }
    }
}

#[cfg(unix)]
fn lookup_user(name: &str) -> Option<RunAsUser> {
    let cname = std::ffi::CString::new(name).ok()?;
    // getpwnam is only called during startup, before any threads race on it
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let pw = unsafe { &*pw };
    Some(RunAsUser {
        uid: pw.pw_uid,
        gid: pw.pw_gid,
    })
}

#[cfg(not(unix))]
fn lookup_user(_name: &str) -> Option<RunAsUser> {
    None
}

// Environment variables forwarded to claude subprocesses. Everything else —
// TELEGRAM_BOT_TOKEN in particular — is deliberately excluded. This is an
// inclusion list: new bridge-owned secrets stay out by default.
const ENV_EXACT: &[&str] = &[
    "PATH",
    "LANG",
    "TERM",
    "SHELL",
    "USER",
    "LOGNAME",
    "PAI_DIR",
    "CLAUDE_PATH",
    "CLAUDE_USER_HOME",
    "CLAUDE_RUN_AS_USER",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "GH_TOKEN",
    "DO_TOKEN",
    "GOOGLE_API_KEY",
    "GOOGLE_APPLICATION_CREDENTIALS",
];

const ENV_PREFIXES: &[&str] = &["LC_", "XDG_", "CLAUDE_CODE_EXPERIMENTAL_"];

fn env_allowed(key: &str) -> bool {
    ENV_EXACT.contains(&key) || ENV_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Build the minimal environment for a claude subprocess.
///
/// When running under the reduced-privilege credential, `HOME` is overridden
/// to that user's home directory (`$CLAUDE_USER_HOME`, default `/home/pai`);
/// otherwise the parent's `HOME` is preserved.
pub fn subprocess_env(reduced: bool) -> Vec<(String, String)> {
    let mut env = filter_env(std::env::vars());

    if reduced {
        let home = match std::env::var("CLAUDE_USER_HOME") {
            Ok(h) if !h.is_empty() => h,
            _ => "/home/pai".to_string(),
        };
        env.push(("HOME".to_string(), home));
    } else if let Ok(home) = std::env::var("HOME")
        && !home.is_empty()
    {
        env.push(("HOME".to_string(), home));
    }

    env
}

fn filter_env(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    vars.filter(|(key, _)| env_allowed(key)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_keeps_known_keys() {
        assert!(env_allowed("PATH"));
        assert!(env_allowed("LC_ALL"));
        assert!(env_allowed("XDG_DATA_HOME"));
        assert!(env_allowed("CLAUDE_CODE_OAUTH_TOKEN"));
        assert!(env_allowed("CLAUDE_CODE_EXPERIMENTAL_FOO"));
    }

    #[test]
    fn allowlist_drops_bridge_secrets() {
        assert!(!env_allowed("TELEGRAM_BOT_TOKEN"));
        assert!(!env_allowed("ELEVENLABS_API_KEY"));
        assert!(!env_allowed("HOME"));
        assert!(!env_allowed("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn filter_env_applies_allowlist() {
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("TELEGRAM_BOT_TOKEN".to_string(), "secret".to_string()),
            ("LC_CTYPE".to_string(), "en_US.UTF-8".to_string()),
        ];
        let env = filter_env(vars.into_iter());
        assert_eq!(env.len(), 2);
        assert!(env.iter().all(|(k, _)| k != "TELEGRAM_BOT_TOKEN"));
    }
}
