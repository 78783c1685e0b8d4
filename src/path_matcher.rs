//! Compiles and evaluates path-pattern globs against repository file paths.
//!
//! A path pattern is a variant of glob, carried over verbatim from the teacher's doc
//! comments on `list_files`/`get_files` (`src/services/content.rs`):
//!   * `"/**"` - find all files recursively
//!   * `"*.json"` - find all JSON files recursively
//!   * `"/foo/*.json"` - find all JSON files under the directory /foo
//!   * `"/*/foo.txt"` - find all files named foo.txt at the second depth level
//!   * `"*.json,/bar/*.txt"` - use comma to specify more than one pattern;
//!     a file matches if any pattern matches.
//!
//! `?` matches any single non-`/` character, `*` matches a run of non-`/` characters, and
//! `**` matches a run of any characters including `/`. A pattern with no leading `/` is
//! rooted at `/` (actually anchored as `/**/pattern`, matching any depth).

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Matches exactly this path segment.
    Literal(String),
    /// A single path segment containing `?`/`*` wildcards, pre-split into literal runs
    /// and wildcard markers so evaluation never re-parses the glyph.
    Wild(Vec<WildPart>),
    /// `**`: matches zero or more path segments.
    DoubleStar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WildPart {
    Literal(String),
    AnyChar,
    AnyRun,
}

/// A single compiled glob (one side of a comma-separated union).
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledPattern {
    segments: Vec<Segment>,
}

/// A compiled, possibly comma-separated union of path patterns. Compile once per watch or
/// per `find`/`diff` call and reuse across repeated `matches()` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatcher {
    patterns: Vec<CompiledPattern>,
}

impl PathMatcher {
    /// Compiles `pattern`. The empty pattern matches nothing; `/**` matches every path.
    pub fn compile(pattern: &str) -> Self {
        let patterns = pattern
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(CompiledPattern::compile)
            .collect();
        PathMatcher { patterns }
    }

    /// `true` if `path` matches any of the compiled patterns.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    /// `true` if this matcher can never match anything (empty pattern, or a union of only
    /// empty/whitespace clauses).
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The pattern `/**`, which matches every path.
    pub fn match_all() -> Self {
        PathMatcher::compile("/**")
    }
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Self {
        let anchored = if pattern.starts_with('/') {
            pattern.to_string()
        } else if pattern.starts_with("**") {
            format!("/{}", pattern)
        } else {
            format!("/**/{}", pattern)
        };

        let segments = anchored
            .split('/')
            .filter(|s| !s.is_empty())
            .map(Segment::compile)
            .collect();

        CompiledPattern { segments }
    }

    fn matches(&self, path: &str) -> bool {
        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&self.segments, &path_segments)
    }
}

impl Segment {
    fn compile(segment: &str) -> Self {
        if segment == "**" {
            return Segment::DoubleStar;
        }
        if !segment.contains('*') && !segment.contains('?') {
            return Segment::Literal(segment.to_string());
        }

        let mut parts = Vec::new();
        let mut literal = String::new();
        for c in segment.chars() {
            match c {
                '*' => {
                    if !literal.is_empty() {
                        parts.push(WildPart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(WildPart::AnyRun);
                }
                '?' => {
                    if !literal.is_empty() {
                        parts.push(WildPart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(WildPart::AnyChar);
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(WildPart::Literal(literal));
        }
        Segment::Wild(parts)
    }

    fn matches_segment(&self, segment: &str) -> bool {
        match self {
            Segment::Literal(lit) => lit == segment,
            Segment::Wild(parts) => wild_match(parts, segment),
            Segment::DoubleStar => unreachable!("DoubleStar is handled by match_segments"),
        }
    }
}

/// Matches a `**`-containing sequence of pattern segments against a sequence of path
/// segments via straightforward backtracking recursion: O(|path| * |pattern|) in the
/// worst case, acceptable since patterns are compiled once and paths are short (<=4096
/// bytes, <=255 bytes/segment per the data model).
fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::DoubleStar) => {
            let rest = &pattern[1..];
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some(seg) => match path.first() {
            Some(head) if seg.matches_segment(head) => match_segments(&pattern[1..], &path[1..]),
            _ => false,
        },
    }
}

fn wild_match(parts: &[WildPart], segment: &str) -> bool {
    fn go(parts: &[WildPart], s: &str) -> bool {
        match parts.first() {
            None => s.is_empty(),
            Some(WildPart::Literal(lit)) => {
                s.starts_with(lit.as_str()) && go(&parts[1..], &s[lit.len()..])
            }
            Some(WildPart::AnyChar) => {
                let mut chars = s.chars();
                match chars.next() {
                    Some(_) => go(&parts[1..], chars.as_str()),
                    None => false,
                }
            }
            Some(WildPart::AnyRun) => {
                // Try the longest match first, shrinking; any split point may work.
                for (idx, _) in s.char_indices().rev().chain(std::iter::once((s.len(), ' '))) {
                    if go(&parts[1..], &s[idx..]) {
                        return true;
                    }
                }
                go(&parts[1..], s)
            }
        }
    }
    go(parts, segment)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_pattern_matches_nothing() {
        let m = PathMatcher::compile("");
        assert!(!m.matches("/a.json"));
        assert!(!m.matches("/"));
    }

    #[test]
    fn match_all() {
        let m = PathMatcher::match_all();
        assert!(m.matches("/a.json"));
        assert!(m.matches("/a/b/c.txt"));
    }

    #[test]
    fn rooted_star_json() {
        let m = PathMatcher::compile("*.json");
        assert!(m.matches("/a.json"));
        assert!(m.matches("/foo/bar.json"));
        assert!(!m.matches("/a.txt"));
    }

    #[test]
    fn directory_scoped_star() {
        let m = PathMatcher::compile("/foo/*.json");
        assert!(m.matches("/foo/bar.json"));
        assert!(!m.matches("/foo/baz/bar.json"));
        assert!(!m.matches("/bar.json"));
    }

    #[test]
    fn second_depth_literal() {
        let m = PathMatcher::compile("/*/foo.txt");
        assert!(m.matches("/a/foo.txt"));
        assert!(!m.matches("/a/b/foo.txt"));
        assert!(!m.matches("/foo.txt"));
    }

    #[test]
    fn union_of_patterns() {
        let m = PathMatcher::compile("*.json,/bar/*.txt");
        assert!(m.matches("/a.json"));
        assert!(m.matches("/bar/c.txt"));
        assert!(!m.matches("/bar/sub/c.txt"));
        assert!(!m.matches("/a.yaml"));
    }

    #[test]
    fn question_mark_single_char() {
        let m = PathMatcher::compile("/a?.json");
        assert!(m.matches("/ab.json"));
        assert!(!m.matches("/abc.json"));
    }

    #[test]
    fn double_star_recursive() {
        let m = PathMatcher::compile("/test/**");
        assert!(m.matches("/test/a.json"));
        assert!(m.matches("/test/nested/deep/a.json"));
        assert!(!m.matches("/other/a.json"));
    }
}
