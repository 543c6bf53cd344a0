//! Dockerignore-style file exclusion rules.
//!
//! Patterns are matched against forward-slash paths relative to the sync
//! root. `?` and `*` stop at path separators; `**` crosses them. A leading
//! `/` is stripped since all paths are already relative. Negation rules
//! (`!pattern`) are rejected up front.

use glob::{MatchOptions, Pattern};

use crate::error::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled set of exclusion rules.
///
/// Matching is deterministic: the same `(path, patterns)` input always
/// yields the same answer. Pass `None` where a matcher is optional; an
/// absent matcher ignores nothing.
#[derive(Debug, Clone, Default)]
pub struct FileIgnores {
    patterns: Vec<Pattern>,
    rules: Vec<String>,
}

impl FileIgnores {
    /// Compiles `rules` into a matcher.
    ///
    /// Fails with [`Error::Unsupported`] on negation rules and on malformed
    /// glob patterns.
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(rules.len());
        let mut kept = Vec::with_capacity(rules.len());
        for rule in rules {
            let rule = rule.as_ref();
            if let Some(rest) = rule.strip_prefix('!') {
                return Err(Error::Unsupported(format!(
                    "exception rules are not supported (pattern: !{rest})"
                )));
            }
            let normalized = rule.strip_prefix('/').unwrap_or(rule);
            let pattern = Pattern::new(normalized).map_err(|e| {
                Error::Unsupported(format!("bad ignore pattern {rule:?}: {e}"))
            })?;
            patterns.push(pattern);
            kept.push(rule.to_string());
        }
        Ok(Self {
            patterns,
            rules: kept,
        })
    }

    /// Tests whether the forward-slash relative `path` is excluded.
    pub fn ignored(&self, path: &str) -> bool {
        self.matches_any(path)
    }

    /// Tests `path` against the pattern set without the exclusion framing;
    /// conditional build commands reuse the same matching rules.
    pub fn matches_any(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    /// The rules this matcher was built from, as given.
    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Tests `path` against an optional matcher; `None` ignores nothing.
pub fn is_ignored(ignores: Option<&FileIgnores>, path: &str) -> bool {
    ignores.map(|i| i.ignored(path)).unwrap_or(false)
}

/// Parses `.dockerignore` file contents into a rule list.
///
/// One pattern per line; `#` comments and blank lines are dropped and
/// surrounding whitespace is trimmed. Negation rules are rejected here so
/// the failure points at the file rather than at a later walk.
pub fn parse_dockerignore(content: &str) -> Result<Vec<String>> {
    let rules: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    // Compile once to validate; the caller builds its own matcher.
    FileIgnores::new(&rules)?;
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignores(rules: &[&str]) -> FileIgnores {
        FileIgnores::new(rules).unwrap()
    }

    #[test]
    fn plain_name_matches_only_that_path() {
        let m = ignores(&["node_modules"]);
        assert!(m.ignored("node_modules"));
        assert!(!m.ignored("node_modules/react"));
        assert!(!m.ignored("src/node_modules"));
    }

    #[test]
    fn single_star_stops_at_separators() {
        let m = ignores(&["*.log"]);
        assert!(m.ignored("debug.log"));
        assert!(!m.ignored("logs/debug.log"));
    }

    #[test]
    fn double_star_crosses_directories() {
        let m = ignores(&["**/*.log", "target/**"]);
        assert!(m.ignored("debug.log"));
        assert!(m.ignored("a/b/c/debug.log"));
        assert!(m.ignored("target/debug/build"));
        assert!(!m.ignored("src/main.rs"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let m = ignores(&["a?.txt"]);
        assert!(m.ignored("ab.txt"));
        assert!(!m.ignored("abc.txt"));
        assert!(!m.ignored("a/x.txt"));
    }

    #[test]
    fn leading_slash_is_stripped() {
        let m = ignores(&["/vendor"]);
        assert!(m.ignored("vendor"));
    }

    #[test]
    fn negation_rules_are_rejected() {
        let err = FileIgnores::new(&["!keep.txt"]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn absent_matcher_ignores_nothing() {
        assert!(!is_ignored(None, "anything/at/all"));
    }

    #[test]
    fn dockerignore_parser_strips_comments_and_blanks() {
        let rules = parse_dockerignore("# build output\n\ntarget/**\n  .git\n").unwrap();
        assert_eq!(rules, vec!["target/**".to_string(), ".git".to_string()]);
    }

    #[test]
    fn dockerignore_parser_rejects_negations() {
        assert!(parse_dockerignore("target\n!target/keep\n").is_err());
    }

    #[test]
    fn matching_is_deterministic() {
        let m = ignores(&["**/*.tmp"]);
        for _ in 0..3 {
            assert!(m.ignored("deep/nested/file.tmp"));
            assert!(!m.ignored("deep/nested/file.rs"));
        }
    }
}
