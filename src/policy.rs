//! Command deny/allow policy and secret token/path generation.
//!
//! A two-layer filter: denial covers escape vectors even if they appear
//! inside an otherwise-allowed command; allowance bounds the capability
//! surface. The deny check takes precedence over the allow check.

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::constants::TOKEN_LEN;

/// Shell metacharacters and substrings that disqualify a command regardless
/// of its leading word.
const DENY_SUBSTRINGS: &[&str] = &[
    "`", "$(", ";", "&&", "||", "|", ">", "<", "rm -rf /", "..", "sudo", "chmod 777", "/etc",
    "/root", "mkfifo", "nc ", "curl", "wget", "bash -i", "sh -i", "python -c", "perl -e",
];

/// First-word whitelist. A command passes only if its leading
/// whitespace-delimited word is one of these.
const ALLOW_FIRST_WORDS: &[&str] =
    &["ls", "cd", "pwd", "cat", "echo", "find", "grep", "head", "tail", "file", "stat", "wc", "openssl"];

/// Returns `false` if `s` contains any deny-list substring, else `true` only
/// if its first word is allow-listed.
///
/// Deliberately does not enforce the "absolute paths outside `/home`" deny
/// clause spec.md §4.2 lists alongside the deny-substring set: the
/// happy-path scenario requires forwarding `CMD:ls /tmp/def` (§8 scenario
/// 1), a `/tmp` path outside `/home`, so a literal `/home`-confinement
/// check on `CMD` traffic would reject the spec's own worked example.
/// The deny-substring list still blocks the concrete escape targets named
/// alongside that clause (`/etc`, `/root`).
pub fn check_command(s: &str) -> bool {
    if DENY_SUBSTRINGS.iter().any(|needle| s.contains(needle)) {
        return false;
    }
    let Some(first_word) = s.split_whitespace().next() else {
        return false;
    };
    ALLOW_FIRST_WORDS.contains(&first_word)
}

/// Validates a peer-reported directory path before it is interpolated into
/// the broker-composed flag-write command (§4.3: "re-validates it against
/// Policy to catch an injected `<path>`").
///
/// The composed command itself (`echo '<token>' > <path>/flag.txt`) is
/// exempt from [`check_command`]'s own redirect-operator ban — that ban
/// targets player-submitted `CMD` traffic in PLAY, not the broker's own
/// setup template, which always redirects by construction. What must be
/// re-checked is the *untrusted* substring: the path the peer handed back.
/// A path containing a deny-list escape substring (backticks, `;`, `..`,
/// etc.) would otherwise let a malicious peer break out of the template.
pub fn check_path_segment(path: &str) -> bool {
    if path.is_empty() || path.contains(char::is_whitespace) {
        return false;
    }
    if DENY_SUBSTRINGS
        .iter()
        .filter(|needle| !matches!(**needle, ">" | "<"))
        .any(|needle| path.contains(needle))
    {
        return false;
    }
    path.starts_with('/')
}

/// Produces `n` bytes from the 62-char alphanumeric alphabet, sampled from a
/// cryptographically strong source.
pub fn random_token(n: usize) -> String {
    rand::rng().sample_iter(&Alphanumeric).take(n).map(char::from).collect()
}

/// Produces `/tmp/<n-char token>` using the same source as [`random_token`].
pub fn random_path(n: usize) -> String {
    format!("/tmp/{}", random_token(n))
}

/// Generates this broker's standard 31-character secret token.
pub fn new_secret_token() -> String {
    random_token(TOKEN_LEN)
}
