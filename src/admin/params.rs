//! Typed parsing of admin-protocol parameters.
//!
//! Requests look like `command:key=value;key=value`. Keys are
//! case-sensitive. Every accessor enforces a per-key length budget and
//! reports `Missing`, `TooLong`, or `Malformed` — the request is rejected
//! before any state is touched.

use crate::error::ParamError;

/// Longest accepted namespace name.
pub const MAX_NAMESPACE_LEN: usize = 31;

/// Parsed `key=value;...` parameter list.
#[derive(Debug, Default)]
pub struct Params<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Params<'a> {
    /// Parse a raw parameter string. An empty string parses to an empty
    /// list; a token with no `=` is kept with an empty value so accessors
    /// can report it malformed rather than missing.
    pub fn parse(raw: &'a str) -> Self {
        let pairs = raw
            .split(';')
            .filter(|tok| !tok.is_empty())
            .map(|tok| match tok.split_once('=') {
                Some((k, v)) => (k, v),
                None => (tok, ""),
            })
            .collect();
        Self { pairs }
    }

    /// Number of parameters supplied.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no parameters were supplied.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Raw value of a key, if present.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// Optional string value with a length budget.
    pub fn get_str(
        &self,
        key: &'static str,
        max: usize,
    ) -> Result<Option<&'a str>, ParamError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) if v.len() > max => Err(ParamError::TooLong { key, max }),
            Some(v) => Ok(Some(v)),
        }
    }

    /// Required string value with a length budget.
    pub fn require_str(&self, key: &'static str, max: usize) -> Result<&'a str, ParamError> {
        match self.get_str(key, max)? {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ParamError::Missing(key)),
        }
    }

    /// Optional unsigned integer with a length budget.
    pub fn get_u32(&self, key: &'static str, max: usize) -> Result<Option<u32>, ParamError> {
        match self.get_str(key, max)? {
            None => Ok(None),
            Some(v) => v.parse::<u32>().map(Some).map_err(|_| ParamError::Malformed {
                key,
                value: v.to_string(),
            }),
        }
    }

    /// Optional boolean: `true`/`yes`/`false`/`no`.
    pub fn get_bool(&self, key: &'static str) -> Result<Option<bool>, ParamError> {
        match self.get_str(key, 5)? {
            None => Ok(None),
            Some("true") | Some("yes") => Ok(Some(true)),
            Some("false") | Some("no") => Ok(Some(false)),
            Some(v) => Err(ParamError::Malformed {
                key,
                value: v.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let p = Params::parse("namespace=test;size=3;ignore-migrations=true");
        assert_eq!(p.len(), 3);
        assert_eq!(p.get("namespace"), Some("test"));
        assert_eq!(p.get("size"), Some("3"));
        assert_eq!(p.get("absent"), None);
    }

    #[test]
    fn test_empty_params() {
        assert!(Params::parse("").is_empty());
    }

    #[test]
    fn test_keys_case_sensitive() {
        let p = Params::parse("Namespace=test");
        assert_eq!(p.get("namespace"), None);
        assert_eq!(p.get("Namespace"), Some("test"));
    }

    #[test]
    fn test_too_long() {
        let p = Params::parse("size=1234");
        assert_eq!(
            p.get_u32("size", 3),
            Err(ParamError::TooLong { key: "size", max: 3 })
        );
    }

    #[test]
    fn test_missing_and_malformed() {
        let p = Params::parse("nodes=;size=abc");
        assert_eq!(
            p.require_str("namespace", MAX_NAMESPACE_LEN),
            Err(ParamError::Missing("namespace"))
        );
        assert_eq!(
            p.require_str("nodes", 64),
            Err(ParamError::Missing("nodes"))
        );
        assert!(matches!(
            p.get_u32("size", 3),
            Err(ParamError::Malformed { key: "size", .. })
        ));
    }

    #[test]
    fn test_bool_values() {
        let p = Params::parse("a=true;b=no;c=maybe");
        assert_eq!(p.get_bool("a"), Ok(Some(true)));
        assert_eq!(p.get_bool("b"), Ok(Some(false)));
        assert!(p.get_bool("c").is_err());
        assert_eq!(p.get_bool("d"), Ok(None));
    }
}
