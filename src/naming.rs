//! Instance naming. The instance name is the only stable identifier shared
//! between the cloud, the CI service, the keyfile store and the metrics
//! store, so everything that parses or generates one lives here.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

const SUFFIX_LEN: usize = 5;

/// Name of a managed runner instance, shaped `<prefix>-<suffix>`.
///
/// Anything in the cloud or on the CI side whose name does not parse back
/// with our prefix belongs to somebody else and must never be touched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn generate(prefix: &str) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(SUFFIX_LEN)
            .map(char::from)
            .collect();

        Self(format!("{prefix}-{suffix}"))
    }

    /// Parse a raw server or runner name, accepting it only if it belongs
    /// to `prefix`.
    pub fn parse(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix('-')?;
        if rest.is_empty() {
            return None;
        }

        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_parse_back() {
        let name = InstanceName::generate("mgr-a");
        assert!(name.as_str().starts_with("mgr-a-"));
        assert_eq!(InstanceName::parse("mgr-a", name.as_str()), Some(name));
    }

    #[test]
    fn foreign_names_are_rejected() {
        assert_eq!(InstanceName::parse("mgr-a", "mgr-b-x1y2z"), None);
        assert_eq!(InstanceName::parse("mgr-a", "mgr-a"), None);
        assert_eq!(InstanceName::parse("mgr-a", "mgr-a-"), None);
        assert_eq!(InstanceName::parse("mgr-a", "unrelated"), None);
    }

    #[test]
    fn prefix_match_is_exact_up_to_separator() {
        // "mgr-ab-xyz" must not be claimed by prefix "mgr-a".
        assert_eq!(InstanceName::parse("mgr-a", "mgr-ab-xyz"), None);
        assert!(InstanceName::parse("mgr-a", "mgr-a-xyz12").is_some());
    }

    #[test]
    fn suffixes_differ_between_generations() {
        let a = InstanceName::generate("mgr-a");
        let b = InstanceName::generate("mgr-a");
        assert_ne!(a, b);
    }
}
