//! Wildcard watch patterns
//!
//! A pattern is a URL or host with `*` standing for any run of characters.
//! A leading `!` turns it into an exclusion. Matching is anchored to the whole
//! candidate and case-insensitive.

use crate::error::ConfigError;
use regex::{Regex, RegexBuilder};
use std::fmt;

/// One compiled entry of a watch set
#[derive(Debug, Clone)]
pub struct WatchPattern {
    /// Pattern text as declared, without the `!` prefix
    source: String,
    regex: Regex,
    exclude: bool,
}

impl WatchPattern {
    /// Compile a configuration string such as `!https://*.example.com/*`
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let trimmed = pattern.trim();
        let (exclude, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };

        if body.is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }

        Self::compile(body, exclude).map_err(|reason| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        })
    }

    pub(crate) fn compile(body: &str, exclude: bool) -> Result<Self, String> {
        let regex = RegexBuilder::new(&wildcard_to_regex(body))
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string())?;

        Ok(Self {
            source: body.to_string(),
            regex,
            exclude,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    /// Declared pattern text, without the `!` prefix
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Host portion of the pattern plus whether the pattern reaches past the
    /// host (i.e. it is scoped to a path narrower than "everything").
    pub(crate) fn host_part(&self) -> (String, bool) {
        let without_scheme = match self.source.find("://") {
            Some(idx) => &self.source[idx + 3..],
            None => self.source.as_str(),
        };

        let (authority, path) = match without_scheme.find('/') {
            Some(idx) => (&without_scheme[..idx], &without_scheme[idx..]),
            None => (without_scheme, ""),
        };

        let host = match authority.rfind(':') {
            // keep bracketed IPv6 literals intact
            Some(idx) if !authority[idx..].contains(']') => &authority[..idx],
            _ => authority,
        };

        let path_scoped = !matches!(path, "" | "/" | "/*" | "*");
        (host.to_string(), path_scoped)
    }
}

impl fmt::Display for WatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclude {
            write!(f, "!{}", self.source)
        } else {
            f.write_str(&self.source)
        }
    }
}

/// `*` becomes `.*`, everything else is literal, anchored at both ends
pub(crate) fn wildcard_to_regex(pattern: &str) -> String {
    let escaped = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    format!("^{escaped}$")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_translation() {
        assert_eq!(wildcard_to_regex("a*b"), "^a.*b$");
        assert_eq!(
            wildcard_to_regex("https://x.com/?q=1"),
            r"^https://x\.com/\?q=1$"
        );
        assert_eq!(wildcard_to_regex("*"), "^.*$");
    }

    #[test]
    fn test_match_is_anchored_and_case_insensitive() {
        let pattern = WatchPattern::parse("https://API.example.com/*").unwrap();
        assert!(pattern.is_match("https://api.example.com/users"));
        assert!(!pattern.is_match("xhttps://api.example.com/users"));
        assert!(!pattern.is_match("https://api.example.com"));
        assert!(!pattern.is_exclude());
    }

    #[test]
    fn test_exclusion_prefix() {
        let pattern = WatchPattern::parse("!https://api.example.com/admin/*").unwrap();
        assert!(pattern.is_exclude());
        assert_eq!(pattern.source(), "https://api.example.com/admin/*");
        assert_eq!(pattern.to_string(), "!https://api.example.com/admin/*");
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(
            WatchPattern::parse("!"),
            Err(ConfigError::InvalidPattern { .. })
        ));
        assert!(WatchPattern::parse("   ").is_err());
    }

    #[test]
    fn test_host_part() {
        let p = WatchPattern::parse("https://*.example.com:8443/api/*").unwrap();
        assert_eq!(p.host_part(), ("*.example.com".to_string(), true));

        let p = WatchPattern::parse("https://example.com/*").unwrap();
        assert_eq!(p.host_part(), ("example.com".to_string(), false));

        let p = WatchPattern::parse("example.org").unwrap();
        assert_eq!(p.host_part(), ("example.org".to_string(), false));

        let p = WatchPattern::parse("http://[::1]:8080/*").unwrap();
        assert_eq!(p.host_part(), ("[::1]".to_string(), false));
    }
}
