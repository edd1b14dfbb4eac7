//! Media types and `Accept` header negotiation.
//!
//! Routes declare what they consume and produce as [`MediaType`]s. Request
//! `Content-Type` values are checked against the consumed set with
//! [`MediaType::accepts`]; `Accept` headers are parsed into ranges ordered by
//! preference with [`parse_accept`] and resolved against the produced set with
//! [`negotiate`].

use std::cmp::Ordering;
use std::fmt;

/// A parsed `type/subtype; key=value` media type or media range.
///
/// Type, subtype and parameter names are lower-cased; the quality factor `q`
/// is split out of the parameter list and defaults to `1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaType {
    kind: String,
    subtype: String,
    params: Vec<(String, String)>,
    quality: f32,
}

impl MediaType {
    /// Parses a single media type. Returns `None` for empty or malformed input.
    ///
    /// A bare `*` is accepted as `*/*`, as some clients send it.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let essence = parts.next()?.trim();
        if essence.is_empty() {
            return None;
        }

        let (kind, subtype) = match essence.split_once('/') {
            Some((k, s)) => (k.trim(), s.trim()),
            None if essence == "*" => ("*", "*"),
            None => return None,
        };
        if kind.is_empty() || subtype.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut quality = 1.0;
        for param in parts {
            let Some((name, value)) = param.split_once('=') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            if name == "q" {
                quality = value.parse::<f32>().unwrap_or(1.0).clamp(0.0, 1.0);
            } else {
                params.push((name, value.to_owned()));
            }
        }

        Some(Self {
            kind: kind.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params,
            quality,
        })
    }

    /// The top-level type, e.g. `text`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The subtype, e.g. `html`.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// The quality factor of this range (`1.0` when absent).
    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// Value of the named parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `type/subtype` without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.kind, self.subtype)
    }

    /// Returns `true` when this type, used as a range, accepts `other`.
    ///
    /// `*` matches any type or subtype. Parameters declared on the range must be
    /// present with the same value on `other`; extra parameters on `other` are
    /// ignored.
    pub fn accepts(&self, other: &MediaType) -> bool {
        let kind_ok = self.kind == "*" || self.kind == other.kind;
        let subtype_ok = self.subtype == "*" || self.subtype == other.subtype;
        kind_ok
            && subtype_ok
            && self
                .params
                .iter()
                .all(|(k, v)| other.param(k).is_some_and(|ov| ov.eq_ignore_ascii_case(v)))
    }

    // 3 for a concrete type with parameters, down to 0 for `*/*`.
    fn specificity(&self) -> u8 {
        match (self.kind.as_str(), self.subtype.as_str()) {
            ("*", _) => 0,
            (_, "*") => 1,
            _ if self.params.is_empty() => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        for (k, v) in &self.params {
            write!(f, ";{k}={v}")?;
        }
        Ok(())
    }
}

/// Parses an `Accept` header into ranges, most preferred first.
///
/// Ordering is by quality (descending), then specificity (descending), then the
/// order the client listed them. Ranges with `q=0` are dropped.
pub fn parse_accept(header: &str) -> Vec<MediaType> {
    let mut ranges: Vec<MediaType> = header
        .split(',')
        .filter_map(MediaType::parse)
        .filter(|range| range.quality > 0.0)
        .collect();

    // `sort_by` is stable, so client order survives ties.
    ranges.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.specificity().cmp(&a.specificity()))
    });
    ranges
}

/// Picks the produced type to answer with.
///
/// Walks the client's ranges in preference order and returns the first
/// `produces` entry (in declaration order) accepted by the current range.
/// Returns `None` when nothing the route produces is acceptable.
pub fn negotiate<'a>(accepted: &[MediaType], produces: &'a [MediaType]) -> Option<&'a MediaType> {
    accepted
        .iter()
        .find_map(|range| produces.iter().find(|p| range.accepts(p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mt(raw: &str) -> MediaType {
        MediaType::parse(raw).unwrap()
    }

    #[test]
    fn parse_lowercases_and_splits_quality() {
        let m = mt("Text/HTML; Level=1; q=0.5");
        assert_eq!(m.essence(), "text/html");
        assert_eq!(m.param("level"), Some("1"));
        assert!((m.quality() - 0.5).abs() < f32::EPSILON);
        assert_eq!(m.to_string(), "text/html;level=1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(MediaType::parse("").is_none());
        assert!(MediaType::parse("texthtml").is_none());
        assert!(MediaType::parse("text/").is_none());
        assert_eq!(mt("*").essence(), "*/*");
    }

    #[test]
    fn wildcard_ranges_accept_concrete_types() {
        assert!(mt("*/*").accepts(&mt("application/json")));
        assert!(mt("text/*").accepts(&mt("text/plain")));
        assert!(!mt("text/*").accepts(&mt("application/json")));
        assert!(mt("text/plain").accepts(&mt("text/plain; charset=utf-8")));
        assert!(!mt("text/plain; charset=utf-8").accepts(&mt("text/plain")));
    }

    #[test]
    fn accept_sorted_by_quality_then_specificity() {
        let ranges = parse_accept("*/*;q=0.1, text/*, text/html, application/json;q=0.9");
        let order: Vec<String> = ranges.iter().map(MediaType::essence).collect();
        assert_eq!(order, vec!["text/html", "text/*", "application/json", "*/*"]);
    }

    #[test]
    fn zero_quality_ranges_are_dropped() {
        let ranges = parse_accept("text/html;q=0, application/json");
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].essence(), "application/json");
    }

    #[test]
    fn negotiate_prefers_client_priority() {
        let produces = vec![mt("application/json"), mt("text/html")];
        let accepted = parse_accept("text/html, application/json;q=0.5");
        assert_eq!(negotiate(&accepted, &produces).unwrap().essence(), "text/html");
    }

    #[test]
    fn negotiate_tie_goes_to_route_declaration_order() {
        let produces = vec![mt("application/xml"), mt("application/json")];
        let accepted = parse_accept("application/*");
        assert_eq!(
            negotiate(&accepted, &produces).unwrap().essence(),
            "application/xml"
        );
    }

    #[test]
    fn negotiate_none_when_unacceptable() {
        let produces = vec![mt("application/json")];
        let accepted = parse_accept("text/html");
        assert!(negotiate(&accepted, &produces).is_none());
    }
}
