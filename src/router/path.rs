//! Path patterns and path normalisation.
//!
//! Three pattern styles are supported. All of them match a *prefix* of the
//! request path, and literal and parameterised patterns only stop on a segment
//! boundary:
//!
//! | Pattern          | Matches                          | Captured params        |
//! |------------------|----------------------------------|------------------------|
//! | `/users`         | `/users`, `/users/`, `/users/7`  | *(none)*               |
//! | `/users/:id`     | `/users/42`, `/users/42/posts`   | `id → "42"`            |
//! | regex `/f(\d+)`  | `/f12`, `/f12/x`                 | `param0 → "12"`        |
//!
//! A trailing `*` (`/files/*`) is accepted for readability and means the same as
//! `/files`.

use regex::Regex;

use super::RouterError;

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

/// Compiled representation of a route's path criterion.
#[derive(Debug, Clone)]
pub(crate) enum PathPattern {
    // Literal prefix, without trailing slash (except the root `/`).
    Prefix(String),
    // Segment-wise prefix where some segments are named captures.
    Parameterized { raw: String, segments: Vec<Segment> },
    // Anchored regex; must match at the start of the path.
    Regex { raw: String, regex: Regex },
}

/// Outcome of a successful path match.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PathMatch {
    pub params: Vec<(String, String)>,
    // Bytes of the path consumed by the pattern; `path[matched_len..]` is
    // either empty or starts with `/` for literal and parameterised patterns.
    pub matched_len: usize,
}

impl PathPattern {
    /// Parse a literal or parameterised pattern.
    ///
    /// A trailing `*` and then a trailing `/` (other than on the root `/`) are
    /// stripped before classification, so `/users/*`, `/users/` and `/users`
    /// compile to identical patterns. A missing leading `/` is supplied.
    pub fn parse(pattern: &str) -> Self {
        let mut trimmed = pattern.strip_suffix('*').unwrap_or(pattern);
        if trimmed.len() > 1 {
            trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        }
        let trimmed = if trimmed.starts_with('/') {
            trimmed.to_owned()
        } else {
            format!("/{trimmed}")
        };

        if trimmed.contains("/:") {
            let segments = trimmed
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) if !name.is_empty() => Segment::Parameter(name.to_owned()),
                    _ => Segment::Static(s.to_owned()),
                })
                .collect();
            return PathPattern::Parameterized {
                raw: trimmed,
                segments,
            };
        }

        PathPattern::Prefix(trimmed)
    }

    /// Compile a regex pattern, anchoring it to the start of the path.
    pub fn regex(pattern: &str) -> Result<Self, RouterError> {
        let regex = Regex::new(&format!("^(?:{pattern})")).map_err(|source| {
            RouterError::InvalidRegex {
                pattern: pattern.to_owned(),
                source,
            }
        })?;
        Ok(PathPattern::Regex {
            raw: pattern.to_owned(),
            regex,
        })
    }

    /// The pattern as configured (after trailing `*` / `/` stripping).
    pub fn as_str(&self) -> &str {
        match self {
            PathPattern::Prefix(p) => p,
            PathPattern::Parameterized { raw, .. } | PathPattern::Regex { raw, .. } => raw,
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, PathPattern::Regex { .. })
    }

    // Try to match a prefix of `path`, returning the captures and the consumed length.
    pub fn matches(&self, path: &str) -> Option<PathMatch> {
        match self {
            PathPattern::Prefix(prefix) => {
                if prefix == "/" {
                    return Some(PathMatch::default());
                }
                let rest = path.strip_prefix(prefix.as_str())?;
                if rest.is_empty() || rest.starts_with('/') {
                    Some(PathMatch {
                        params: Vec::new(),
                        matched_len: prefix.len(),
                    })
                } else {
                    None
                }
            }
            PathPattern::Parameterized { segments, .. } => {
                let mut params = Vec::new();
                let mut pos = 0;

                for seg in segments {
                    let after_slash = path[pos..].strip_prefix('/')?;
                    let start = path.len() - after_slash.len();
                    let end = after_slash
                        .find('/')
                        .map_or(path.len(), |i| start + i);
                    let value = &path[start..end];
                    if value.is_empty() {
                        return None;
                    }
                    match seg {
                        Segment::Static(s) => {
                            if s != value {
                                return None;
                            }
                        }
                        Segment::Parameter(name) => {
                            params.push((name.clone(), value.to_owned()));
                        }
                    }
                    pos = end;
                }

                Some(PathMatch {
                    params,
                    matched_len: pos,
                })
            }
            PathPattern::Regex { regex, .. } => {
                let caps = regex.captures(path)?;
                let whole = caps.get(0)?;
                let mut params = Vec::new();
                for (i, name) in regex.capture_names().enumerate().skip(1) {
                    if let Some(m) = caps.get(i) {
                        let key = match name {
                            Some(n) => n.to_owned(),
                            None => format!("param{}", i - 1),
                        };
                        params.push((key, m.as_str().to_owned()));
                    }
                }
                Some(PathMatch {
                    params,
                    matched_len: whole.end(),
                })
            }
        }
    }
}

/// Normalise a request path.
///
/// Guarantees a leading `/`, collapses repeated slashes and resolves `.` and `..`
/// segments (never climbing above the root). A trailing slash is preserved.
///
/// ```
/// use switchyard::router::normalize_path;
///
/// assert_eq!(normalize_path("//a/./b/../c/"), "/a/c/");
/// assert_eq!(normalize_path("/../x"), "/x");
/// assert_eq!(normalize_path(""), "/");
/// ```
pub fn normalize_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    for segment in &stack {
        out.push('/');
        out.push_str(segment);
    }
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if out.is_empty() || trailing {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(p: &str) -> PathPattern {
        PathPattern::parse(p)
    }

    // ── PathPattern::parse ────────────────────────────────────────────────────

    #[test]
    fn parse_root() {
        assert!(matches!(parse("/"), PathPattern::Prefix(s) if s == "/"));
        assert!(matches!(parse("/*"), PathPattern::Prefix(s) if s == "/"));
    }

    #[test]
    fn parse_trailing_slash_and_star_stripped() {
        assert!(matches!(parse("/users/"), PathPattern::Prefix(s) if s == "/users"));
        assert!(matches!(parse("/files/*"), PathPattern::Prefix(s) if s == "/files"));
    }

    #[test]
    fn parse_parameterized() {
        match parse("/users/:id/posts/:post_id") {
            PathPattern::Parameterized { segments, .. } => {
                assert_eq!(segments.len(), 4);
                assert!(matches!(&segments[0], Segment::Static(s) if s == "users"));
                assert!(matches!(&segments[1], Segment::Parameter(s) if s == "id"));
                assert!(matches!(&segments[3], Segment::Parameter(s) if s == "post_id"));
            }
            other => panic!("expected Parameterized, got {other:?}"),
        }
    }

    #[test]
    fn parse_supplies_leading_slash() {
        assert!(matches!(parse("users"), PathPattern::Prefix(s) if s == "/users"));
        assert!(matches!(parse(""), PathPattern::Prefix(s) if s == "/"));
    }

    #[test]
    fn bare_colon_is_a_literal_segment() {
        match parse("/a/:/:id") {
            PathPattern::Parameterized { segments, .. } => {
                assert!(matches!(&segments[1], Segment::Static(s) if s == ":"));
                assert!(matches!(&segments[2], Segment::Parameter(s) if s == "id"));
            }
            other => panic!("expected Parameterized, got {other:?}"),
        }
    }

    #[test]
    fn regex_rejects_invalid() {
        assert!(matches!(
            PathPattern::regex("/a(("),
            Err(RouterError::InvalidRegex { .. })
        ));
    }

    // ── PathPattern::matches ──────────────────────────────────────────────────

    #[test]
    fn prefix_matches_on_segment_boundary() {
        let pat = parse("/a");
        assert_eq!(pat.matches("/a").unwrap().matched_len, 2);
        assert_eq!(pat.matches("/a/").unwrap().matched_len, 2);
        assert_eq!(pat.matches("/a/b/c").unwrap().matched_len, 2);
        assert!(pat.matches("/ab").is_none());
        assert!(pat.matches("/").is_none());
    }

    #[test]
    fn root_prefix_matches_everything() {
        let pat = parse("/");
        assert_eq!(pat.matches("/anything/at/all").unwrap().matched_len, 0);
    }

    #[test]
    fn param_extracts_values() {
        let pat = parse("/users/:id/posts/:post_id");
        let m = pat.matches("/users/7/posts/99/comments").unwrap();
        assert_eq!(
            m.params,
            vec![
                ("id".to_owned(), "7".to_owned()),
                ("post_id".to_owned(), "99".to_owned())
            ]
        );
        assert_eq!(m.matched_len, "/users/7/posts/99".len());
    }

    #[test]
    fn param_requires_every_segment() {
        let pat = parse("/users/:id");
        assert!(pat.matches("/users").is_none());
        assert!(pat.matches("/users/").is_none());
        assert!(pat.matches("/posts/42").is_none());
    }

    #[test]
    fn regex_matches_prefix_and_captures() {
        let pat = PathPattern::regex(r"/f(\d+)").unwrap();
        let m = pat.matches("/f12/rest").unwrap();
        assert_eq!(m.params, vec![("param0".to_owned(), "12".to_owned())]);
        assert_eq!(m.matched_len, 4);
        assert!(pat.matches("/x/f12").is_none());
    }

    #[test]
    fn regex_named_groups_use_their_names() {
        let pat = PathPattern::regex(r"/v(?P<version>\d)/(\w+)").unwrap();
        let m = pat.matches("/v2/items").unwrap();
        assert_eq!(
            m.params,
            vec![
                ("version".to_owned(), "2".to_owned()),
                ("param1".to_owned(), "items".to_owned())
            ]
        );
    }

    // ── normalize_path ────────────────────────────────────────────────────────

    #[test]
    fn normalize_collapses_and_resolves() {
        assert_eq!(normalize_path("/a//b"), "/a/b");
        assert_eq!(normalize_path("/a/b/.."), "/a/");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }
}
