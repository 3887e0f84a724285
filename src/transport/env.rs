//! Environment filtering for stdio servers.
//!
//! A spawned MCP server inherits only an allow-list of safe variables, never
//! the daemon's full environment: anything smelling of credentials (`*KEY*`,
//! `*TOKEN*`, ...) stays out. Server-specific `env` entries overlay last and
//! win, including over allow-listed variables.

use std::collections::BTreeMap;

/// Variables an MCP server inherits by default.
///
/// Matches what desktop MCP hosts empirically pass through, plus locale.
const ALLOWED_ENV_VARS: &[&str] = &[
    "HOME",
    "LOGNAME",
    "PATH",
    "SHELL",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "TZ",
    // Windows equivalents
    "PATHEXT",
    "USERNAME",
    "USERPROFILE",
    "TEMP",
    "TMP",
];

/// Name patterns that are never inherited, even if someone grows the
/// allow-list carelessly.
const SENSITIVE_PATTERNS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

fn is_allowed(name: &str) -> bool {
    ALLOWED_ENV_VARS.contains(&name) || name.starts_with("LC_")
}

fn looks_sensitive(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_PATTERNS.iter().any(|p| upper.contains(p))
}

/// Build the environment for a stdio server: filtered process env with the
/// server's own `env` map overlaid.
pub fn filtered_environment(overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars()
        .filter(|(name, _)| is_allowed(name) && !looks_sensitive(name))
        .collect();
    for (name, value) in overlay {
        env.insert(name.clone(), value.clone());
    }
    env
}

/// Wrap a server command in a login shell so the child sees the user's PATH.
///
/// macOS GUI-launched daemons inherit a minimal PATH; the login shell fixes
/// that at the cost of running the user's profile scripts. On Windows the
/// equivalent is `cmd.exe /c`.
pub fn login_shell_invocation(command: &str, args: &[String]) -> (String, Vec<String>) {
    let command_line = shell_join(command, args);
    if cfg!(windows) {
        ("cmd.exe".to_string(), vec!["/c".to_string(), command_line])
    } else {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        (
            shell,
            vec!["-l".to_string(), "-c".to_string(), command_line],
        )
    }
}

fn shell_join(command: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(command));
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        word.to_string()
    } else {
        // POSIX single-quote escaping: close, escaped quote, reopen.
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
