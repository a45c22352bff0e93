//! Pure, stateless command classification and heartbeat text generation.
//!
//! Grounded in the same register as the teacher's `process::validate_command`
//! (`src/process.rs`): a handful of compiled token tables checked against a
//! trimmed, lower-cased command string, with no shared state and no async.
//! See spec §4.4.

use std::time::Duration;

use crate::config::SessionConfig;

const LONG_RUNNING_TOKENS: &[&str] = &[
    "!analyze",
    "!heap",
    "!poolused",
    "!verifier",
    "!locks",
    "!deadlock",
    "!process",
    "!thread",
    "!handle",
    "!vm",
    "!vadump",
    "!memusage",
];

const COMPLEX_TOKENS: &[&str] = &[
    "!stack",
    "!clrstack",
    "!dumpheap",
    "!gcroot",
    "!finalizequeue",
    "!syncblk",
    "!threads",
    "!runaway",
    "!address",
    "!peb",
    "!teb",
];

const SIMPLE_PREFIXES: &[&str] = &["k", "lm", "r"];

/// Classify `text` into a timeout bucket for `config`, per spec §4.4.
#[must_use]
pub fn classify(text: &str, config: &SessionConfig) -> Duration {
    let normalized = text.trim().to_lowercase();

    if LONG_RUNNING_TOKENS.iter().any(|t| normalized.contains(t)) {
        return config.long_running_timeout;
    }
    if COMPLEX_TOKENS.iter().any(|t| normalized.contains(t)) {
        return config.complex_timeout;
    }
    if normalized.len() < 10
        && (SIMPLE_PREFIXES.iter().any(|p| normalized.starts_with(p)) || normalized == "version")
    {
        return config.simple_timeout;
    }
    config.default_timeout
}

/// Staged, family-specific progress phrase for a command that has been
/// executing for `elapsed`. Matching is case-insensitive substring; falls
/// back to a generic phrase for unrecognized families.
#[must_use]
pub fn heartbeat_text(text: &str, elapsed: Duration) -> String {
    let normalized = text.trim().to_lowercase();
    let mins = elapsed.as_secs_f64() / 60.0;

    if normalized.contains("!analyze") {
        return staged(mins, "initializing", "analyzing", "symbol resolution", "deep analysis");
    }
    if normalized.contains("!heap") {
        return staged(mins, "walking heap", "scanning allocations", "aggregating statistics", "deep heap analysis");
    }
    if normalized.contains("!process") {
        return staged(mins, "enumerating processes", "inspecting process state", "walking handle table", "deep process analysis");
    }
    if normalized.contains("!dumpheap") {
        return staged(mins, "walking managed heap", "aggregating object types", "resolving gc roots", "deep heap dump");
    }
    if normalized.contains("!locks") || normalized.contains("!handle") {
        return staged(mins, "enumerating locks", "checking ownership", "detecting contention", "deep lock analysis");
    }

    staged(mins, "starting", "running", "still running", "taking longer than expected")
}

fn staged(mins: f64, m0: &str, m2: &str, m5: &str, m10: &str) -> String {
    if mins < 2.0 {
        m0.to_string()
    } else if mins < 5.0 {
        m2.to_string()
    } else if mins < 10.0 {
        m5.to_string()
    } else {
        m10.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SessionConfig {
        SessionConfig::new("s1")
    }

    #[test]
    fn long_running_tokens_win_over_complex() {
        let cfg = cfg();
        assert_eq!(classify("!analyze -v", &cfg), cfg.long_running_timeout);
        assert_eq!(classify("!HEAP -s", &cfg), cfg.long_running_timeout);
    }

    #[test]
    fn complex_tokens_classified() {
        let cfg = cfg();
        assert_eq!(classify("!clrstack -a", &cfg), cfg.complex_timeout);
        assert_eq!(classify("!DumpHeap -stat", &cfg), cfg.complex_timeout);
    }

    #[test]
    fn short_simple_prefixes_classified() {
        let cfg = cfg();
        assert_eq!(classify("k", &cfg), cfg.simple_timeout);
        assert_eq!(classify("lm", &cfg), cfg.simple_timeout);
        assert_eq!(classify("r", &cfg), cfg.simple_timeout);
        assert_eq!(classify("version", &cfg), cfg.simple_timeout);
    }

    #[test]
    fn long_simple_looking_text_falls_through_to_default() {
        let cfg = cfg();
        // starts with "k" but length >= 10, so not "simple".
        assert_eq!(classify("kb 20 extra", &cfg), cfg.default_timeout);
    }

    #[test]
    fn unmatched_text_is_default() {
        let cfg = cfg();
        assert_eq!(classify("bp foo!bar", &cfg), cfg.default_timeout);
    }

    #[test]
    fn heartbeat_text_stages_by_elapsed() {
        assert_eq!(heartbeat_text("!analyze -v", Duration::from_secs(30)), "initializing");
        assert_eq!(heartbeat_text("!analyze -v", Duration::from_secs(150)), "analyzing");
        assert_eq!(heartbeat_text("!analyze -v", Duration::from_secs(360)), "symbol resolution");
        assert_eq!(heartbeat_text("!analyze -v", Duration::from_secs(700)), "deep analysis");
    }

    #[test]
    fn heartbeat_text_falls_back_for_unknown_family() {
        assert_eq!(heartbeat_text("bp foo!bar", Duration::from_secs(1)), "starting");
    }
}
