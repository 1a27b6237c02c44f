use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A domain matcher backed by a glob pattern.
///
/// Domains and patterns are compared lowercase and without the trailing dot.
/// Dots are translated to `/` before globbing so that `*` cannot cross label
/// boundaries; a leading `.` is shorthand for the domain itself plus all of
/// its subdomains (`.example.com` behaves like `**.example.com`).
#[derive(Clone)]
pub struct DomainPattern {
    inner: glob::Pattern,
    original: String,
}

impl DomainPattern {
    pub fn new(pattern: &str) -> Result<Self, glob::PatternError> {
        let normalized = pattern.trim_end_matches('.').to_ascii_lowercase();
        let globbable = match normalized.strip_prefix('.') {
            Some(rest) => format!("**/{rest}"),
            None => normalized.clone(),
        };

        Ok(Self {
            inner: glob::Pattern::new(&globbable.replace('.', "/"))?,
            original: pattern.to_string(),
        })
    }

    pub fn matches(&self, domain: &str) -> bool {
        let candidate = domain
            .trim_end_matches('.')
            .to_ascii_lowercase()
            .replace('.', "/");

        // `**/example/com` must also match the bare root domain.
        if let Some(rem) = self.inner.as_str().strip_prefix("**/")
            && candidate == rem
        {
            return true;
        }

        self.inner.matches_with(
            &candidate,
            glob::MatchOptions {
                case_sensitive: false,
                require_literal_separator: true,
                require_literal_leading_dot: false,
            },
        )
    }

    /// Whether this pattern can only ever match one exact domain.
    pub fn is_literal(&self) -> bool {
        !self.original.starts_with('.') && !self.original.contains(['*', '?'])
    }
}

impl fmt::Debug for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DomainPattern").field(&self.original).finish()
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.original.fmt(f)
    }
}

impl PartialEq for DomainPattern {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl Eq for DomainPattern {}

impl FromStr for DomainPattern {
    type Err = glob::PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for DomainPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

impl<'de> Deserialize<'de> for DomainPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("example.com", "example.com"; "literal")]
    #[test_case("example.com", "EXAMPLE.COM"; "case insensitive")]
    #[test_case("example.com", "example.com."; "trailing dot on candidate")]
    #[test_case("example.com.", "example.com"; "trailing dot on pattern")]
    #[test_case(".example.com", "example.com"; "leading dot matches root")]
    #[test_case(".example.com", "foo.example.com"; "leading dot matches subdomain")]
    #[test_case(".example.com", "a.b.example.com"; "leading dot matches deep subdomain")]
    #[test_case("*.example.com", "foo.example.com"; "single star one level")]
    #[test_case("f??.example.com", "foo.example.com"; "question marks")]
    fn matches(pattern: &str, domain: &str) {
        assert!(DomainPattern::new(pattern).unwrap().matches(domain));
    }

    #[test_case("example.com", "foo.example.com"; "literal does not match subdomain")]
    #[test_case("*.example.com", "a.b.example.com"; "single star does not cross labels")]
    #[test_case("*com", "foo.com"; "star does not match dot")]
    #[test_case(".example.com", "badexample.com"; "leading dot requires label boundary")]
    fn does_not_match(pattern: &str, domain: &str) {
        assert!(!DomainPattern::new(pattern).unwrap().matches(domain));
    }

    #[test]
    fn literal_detection() {
        assert!(DomainPattern::new("example.com").unwrap().is_literal());
        assert!(!DomainPattern::new(".example.com").unwrap().is_literal());
        assert!(!DomainPattern::new("*.example.com").unwrap().is_literal());
    }
}
