//! Ordered watch sets with first-match-wins evaluation

use super::pattern::WatchPattern;
use crate::error::ConfigError;

/// Result of evaluating a candidate against a watch set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// No pattern matched
    NotWatched,
    /// The first matching pattern is an inclusion
    Included,
    /// The first matching pattern is an exclusion
    Excluded,
}

impl MatchOutcome {
    pub fn is_included(self) -> bool {
        matches!(self, MatchOutcome::Included)
    }
}

/// Ordered list of watch patterns. Built once at startup and never mutated
/// while the proxy is serving.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    patterns: Vec<WatchPattern>,
}

impl WatchSet {
    pub fn new(patterns: Vec<WatchPattern>) -> Self {
        Self { patterns }
    }

    /// Compile configuration strings in declaration order
    pub fn parse<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| WatchPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// The first pattern matching `candidate` decides; later ones are never consulted.
    pub fn evaluate(&self, candidate: &str) -> MatchOutcome {
        match self.patterns.iter().find(|p| p.is_match(candidate)) {
            Some(p) if p.is_exclude() => MatchOutcome::Excluded,
            Some(_) => MatchOutcome::Included,
            None => MatchOutcome::NotWatched,
        }
    }

    pub fn is_watched(&self, candidate: &str) -> bool {
        self.evaluate(candidate).is_included()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn patterns(&self) -> &[WatchPattern] {
        &self.patterns
    }

    /// Append patterns that are not already present, preserving order
    pub fn merge(&mut self, other: &WatchSet) {
        for pattern in &other.patterns {
            let present = self.patterns.iter().any(|p| {
                p.is_exclude() == pattern.is_exclude()
                    && p.source().eq_ignore_ascii_case(pattern.source())
            });
            if !present {
                self.patterns.push(pattern.clone());
            }
        }
    }

    /// Derive the host-only set used for tunnel decisions.
    ///
    /// Scheme, path and port are stripped from every pattern. Exclusions scoped
    /// to a path cannot be expressed at host level and are left to the full-URL
    /// set; host-wide exclusions are kept in place.
    pub fn hosts(&self) -> WatchSet {
        let mut hosts: Vec<WatchPattern> = Vec::new();

        for pattern in &self.patterns {
            let (host, path_scoped) = pattern.host_part();
            if host.is_empty() || (pattern.is_exclude() && path_scoped) {
                continue;
            }

            let duplicate = hosts.iter().any(|h| {
                h.is_exclude() == pattern.is_exclude() && h.source().eq_ignore_ascii_case(&host)
            });
            if duplicate {
                continue;
            }

            // host text was extracted from an already valid pattern
            if let Ok(compiled) = WatchPattern::compile(&host, pattern.is_exclude()) {
                hosts.push(compiled);
            }
        }

        WatchSet { patterns: hosts }
    }
}
