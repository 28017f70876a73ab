use std::{
    net::IpAddr,
    str::FromStr,
    sync::LazyLock,
};

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{NimbusError, NimbusResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static DOMAIN_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
        .expect("domain rule pattern is valid")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The network rules of a sandbox.
///
/// Egress entries are CIDR blocks, single addresses or domain names (`*.example.com` matches
/// subdomains). A destination matched by an allow entry is always reachable, even when a deny
/// entry matches it too. Destinations matched by neither list are reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct NetworkPolicy {
    /// Destinations explicitly allowed.
    #[serde(default)]
    #[builder(default)]
    pub allow_out: Vec<String>,

    /// Destinations denied unless also allowed.
    #[serde(default)]
    #[builder(default)]
    pub deny_out: Vec<String>,

    /// Whether exposed ports are reachable without the sandbox's traffic token.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub allow_public_traffic: bool,
}

/// A parsed egress entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressRule {
    /// An address block.
    Cidr(IpNetwork),

    /// A domain name, optionally matching all subdomains.
    Domain {
        /// The domain without the wildcard.
        name: String,

        /// Whether subdomains match instead of the name itself.
        wildcard: bool,
    },
}

/// Where a guest connection is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An address.
    Ip(IpAddr),

    /// A host name.
    Host(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkPolicy {
    /// Parses every entry, failing on the first invalid one.
    pub fn validate(&self) -> NimbusResult<()> {
        for entry in self.allow_out.iter().chain(&self.deny_out) {
            EgressRule::from_str(entry)?;
        }
        Ok(())
    }

    /// Decides whether the guest may connect to `destination`.
    pub fn allows(&self, destination: &Destination) -> bool {
        let matches = |entries: &[String]| {
            entries
                .iter()
                .filter_map(|entry| EgressRule::from_str(entry).ok())
                .any(|rule| rule.matches(destination))
        };

        if matches(&self.allow_out) {
            return true;
        }

        !matches(&self.deny_out)
    }
}

impl EgressRule {
    /// Whether the rule covers `destination`.
    pub fn matches(&self, destination: &Destination) -> bool {
        match (self, destination) {
            (EgressRule::Cidr(network), Destination::Ip(ip)) => network.contains(*ip),
            (EgressRule::Domain { name, wildcard }, Destination::Host(host)) => {
                let host = host.trim_end_matches('.').to_ascii_lowercase();
                if *wildcard {
                    host.strip_suffix(name.as_str())
                        .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1)
                } else {
                    host == *name
                }
            }
            _ => false,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for NetworkPolicy {
    fn default() -> Self {
        NetworkPolicy::builder().build()
    }
}

impl FromStr for EgressRule {
    type Err = NimbusError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let entry = entry.trim();
        if let Ok(network) = IpNetwork::from_str(entry) {
            return Ok(EgressRule::Cidr(network));
        }

        let lower = entry.to_ascii_lowercase();
        if DOMAIN_RULE.is_match(&lower) && lower.chars().any(|c| c.is_ascii_alphabetic()) {
            return Ok(match lower.strip_prefix("*.") {
                Some(name) => EgressRule::Domain {
                    name: name.to_string(),
                    wildcard: true,
                },
                None => EgressRule::Domain {
                    name: lower,
                    wildcard: false,
                },
            });
        }

        Err(NimbusError::InvalidArgument(format!(
            "invalid egress rule {entry:?}: expected a CIDR block, an address or a domain"
        )))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Destination {
        Destination::Ip(s.parse().unwrap())
    }

    fn host(s: &str) -> Destination {
        Destination::Host(s.to_string())
    }

    #[test]
    fn test_allow_wins_over_deny() {
        let policy = NetworkPolicy::builder()
            .allow_out(vec!["8.8.8.8".into(), "*.github.com".into()])
            .deny_out(vec!["0.0.0.0/0".into(), "github.com".into(), "api.github.com".into()])
            .build();
        policy.validate().unwrap();

        assert!(policy.allows(&ip("8.8.8.8")));
        assert!(!policy.allows(&ip("1.1.1.1")));
        assert!(policy.allows(&host("api.github.com")));
        assert!(!policy.allows(&host("github.com")));
        assert!(policy.allows(&host("example.com")));
    }

    #[test]
    fn test_default_allows_everything() {
        let policy = NetworkPolicy::default();
        assert!(policy.allow_public_traffic);
        assert!(policy.allows(&ip("10.0.0.1")));
        assert!(policy.allows(&host("example.com")));
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        for entry in ["", "not a domain", "10.0.0.0/99", "-bad.com"] {
            let policy = NetworkPolicy::builder().deny_out(vec![entry.into()]).build();
            assert!(policy.validate().is_err(), "{entry:?} should be rejected");
        }
    }
}
