//! Request header filter

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// One `{name, value?}` rule. An absent or empty value means presence only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl HeaderRule {
    pub fn presence(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn containing(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    fn matches(&self, headers: &HeaderMap) -> bool {
        let mut values = headers.get_all(self.name.as_str()).iter().peekable();
        if values.peek().is_none() {
            return false;
        }

        let needle = match self.value.as_deref() {
            None | Some("") => return true,
            Some(v) => v.to_lowercase(),
        };

        values.any(|v| {
            String::from_utf8_lossy(v.as_bytes())
                .to_lowercase()
                .contains(&needle)
        })
    }
}

/// Any-rule-matches filter over request headers. No rules means every request passes.
#[derive(Debug, Clone, Default)]
pub struct HeaderFilter {
    rules: Vec<HeaderRule>,
}

impl HeaderFilter {
    pub fn new(rules: Vec<HeaderRule>) -> Self {
        Self { rules }
    }

    pub fn includes(&self, headers: &HeaderMap) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(headers))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_presence_rule() {
        let filter = HeaderFilter::new(vec![HeaderRule::containing("X-Test", "")]);
        assert!(filter.includes(&headers(&[("x-test", "anything")])));
        assert!(!filter.includes(&headers(&[("x-other", "anything")])));
    }

    #[test]
    fn test_value_rule_is_case_insensitive_substring() {
        let filter = HeaderFilter::new(vec![HeaderRule::containing("user-agent", "CURL")]);
        assert!(filter.includes(&headers(&[("user-agent", "curl/8.4.0")])));
        assert!(!filter.includes(&headers(&[("user-agent", "Mozilla/5.0")])));
    }

    #[test]
    fn test_any_rule_suffices() {
        let filter = HeaderFilter::new(vec![
            HeaderRule::containing("x-a", "one"),
            HeaderRule::presence("x-b"),
        ]);
        assert!(filter.includes(&headers(&[("x-b", "")])));
        assert!(!filter.includes(&headers(&[("x-a", "two")])));
    }

    #[test]
    fn test_empty_filter_passes() {
        assert!(HeaderFilter::default().includes(&HeaderMap::new()));
    }
}
