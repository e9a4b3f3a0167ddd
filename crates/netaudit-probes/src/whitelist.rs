//! Whitelist filter
//!
//! Consulted after an event is fully classified and before it is written.
//! Runs with no audit lock held and must not block.

use std::net::IpAddr;

use netaudit_core::{AddressFamily, Endpoint, WhitelistRule};

/// Decides whether a classified event is suppressed
pub trait Whitelist: Send + Sync {
    fn is_whitelisted(&self, path: &str, family: AddressFamily, dst: &Endpoint) -> bool;
}

/// Whitelist that suppresses nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowNone;

impl Whitelist for AllowNone {
    fn is_whitelisted(&self, _path: &str, _family: AddressFamily, _dst: &Endpoint) -> bool {
        false
    }
}

/// One entry: an executable, optionally narrowed to an address and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub path: String,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Rule {
    fn matches(&self, path: &str, dst: &Endpoint) -> bool {
        self.path == path
            && self.address.map_or(true, |addr| addr == dst.addr)
            && self.port.map_or(true, |port| port == dst.port)
    }
}

impl From<&WhitelistRule> for Rule {
    fn from(rule: &WhitelistRule) -> Self {
        Self {
            path: rule.path.clone(),
            address: rule.address,
            port: rule.port,
        }
    }
}

/// Fixed rule list, built once from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticWhitelist {
    rules: Vec<Rule>,
}

impl StaticWhitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: &[WhitelistRule]) -> Self {
        Self {
            rules: rules.iter().map(Rule::from).collect(),
        }
    }

    /// Suppress every event of an executable
    pub fn allow_path(mut self, path: impl Into<String>) -> Self {
        self.rules.push(Rule {
            path: path.into(),
            address: None,
            port: None,
        });
        self
    }

    /// Suppress events of an executable towards one destination
    pub fn allow_destination(
        mut self,
        path: impl Into<String>,
        address: IpAddr,
        port: Option<u16>,
    ) -> Self {
        self.rules.push(Rule {
            path: path.into(),
            address: Some(address),
            port,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Whitelist for StaticWhitelist {
    fn is_whitelisted(&self, path: &str, _family: AddressFamily, dst: &Endpoint) -> bool {
        self.rules.iter().any(|rule| rule.matches(path, dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dst(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    #[test]
    fn test_path_rule_matches_any_destination() {
        let whitelist = StaticWhitelist::new().allow_path("/usr/sbin/ntpd");
        assert!(whitelist.is_whitelisted("/usr/sbin/ntpd", AddressFamily::Inet, &dst("1.2.3.4", 123)));
        assert!(!whitelist.is_whitelisted("/usr/bin/curl", AddressFamily::Inet, &dst("1.2.3.4", 123)));
    }

    #[test]
    fn test_destination_rule() {
        let whitelist = StaticWhitelist::new().allow_destination(
            "/usr/bin/curl",
            "::1".parse().unwrap(),
            Some(8080),
        );
        assert!(whitelist.is_whitelisted("/usr/bin/curl", AddressFamily::Inet6, &dst("::1", 8080)));
        assert!(!whitelist.is_whitelisted("/usr/bin/curl", AddressFamily::Inet6, &dst("::1", 443)));
        assert!(!whitelist.is_whitelisted("/usr/bin/curl", AddressFamily::Inet6, &dst("::2", 8080)));
    }

    #[test]
    fn test_from_config_rules() {
        let rules = vec![
            WhitelistRule {
                path: "/usr/bin/git".to_string(),
                address: None,
                port: Some(22),
            },
        ];
        let whitelist = StaticWhitelist::from_rules(&rules);
        assert_eq!(whitelist.len(), 1);
        assert!(whitelist.is_whitelisted("/usr/bin/git", AddressFamily::Inet, &dst("10.1.1.1", 22)));
        assert!(!whitelist.is_whitelisted("/usr/bin/git", AddressFamily::Inet, &dst("10.1.1.1", 443)));
    }

    #[test]
    fn test_allow_none() {
        assert!(!AllowNone.is_whitelisted("/bin/sh", AddressFamily::Inet, &dst("0.0.0.0", 0)));
    }
}
