//! Cookie value object.
//!
//! Only the minimal codec the router needs is implemented: reading the
//! `name=value` pairs of a `Cookie` request header and rendering a
//! `Set-Cookie` header value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `SameSite` attribute of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// An HTTP cookie.
///
/// Cookies read from the request start out unchanged; any setter marks the
/// cookie as changed so the context knows to emit a `Set-Cookie` header for it.
///
/// ```
/// use switchyard::http::Cookie;
///
/// let mut cookie = Cookie::new("theme", "dark");
/// cookie.set_path("/").set_http_only(true).set_max_age(3600);
/// assert_eq!(cookie.encode(), "theme=dark; Path=/; Max-Age=3600; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: Option<String>,
    path: Option<String>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
    changed: bool,
}

impl Cookie {
    /// Creates a new cookie. New cookies count as changed.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
            changed: true,
        }
    }

    /// Parses the pairs of a `Cookie` request header.
    ///
    /// Malformed pairs (no `=` or empty name) are skipped. Returned cookies are
    /// not marked as changed.
    pub fn parse_header(header: &str) -> Vec<Cookie> {
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
                cookie.changed = false;
                Some(cookie)
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn max_age(&self) -> Option<i64> {
        self.max_age
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    pub fn same_site(&self) -> Option<SameSite> {
        self.same_site
    }

    /// `true` if the cookie must be sent back in a `Set-Cookie` header.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_value(&mut self, value: impl Into<String>) -> &mut Self {
        self.value = value.into();
        self.changed = true;
        self
    }

    pub fn set_domain(&mut self, domain: impl Into<String>) -> &mut Self {
        self.domain = Some(domain.into());
        self.changed = true;
        self
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.path = Some(path.into());
        self.changed = true;
        self
    }

    /// Sets `Max-Age` in seconds. Zero or a negative value expires the cookie.
    pub fn set_max_age(&mut self, seconds: i64) -> &mut Self {
        self.max_age = Some(seconds);
        self.changed = true;
        self
    }

    pub fn set_secure(&mut self, secure: bool) -> &mut Self {
        self.secure = secure;
        self.changed = true;
        self
    }

    pub fn set_http_only(&mut self, http_only: bool) -> &mut Self {
        self.http_only = http_only;
        self.changed = true;
        self
    }

    pub fn set_same_site(&mut self, same_site: Option<SameSite>) -> &mut Self {
        self.same_site = same_site;
        self.changed = true;
        self
    }

    /// Renders the `Set-Cookie` header value.
    pub fn encode(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age.max(0)));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        out
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
