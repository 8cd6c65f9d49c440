//! Rule matching: destination address → rule name → upstream set.
//!
//! Domain names are matched by anchored case-insensitive regular
//! expressions, IPs by longest prefix over a binary radix trie. A rule named
//! `default` may carry no patterns of its own; its upstreams apply when
//! nothing else matched.

mod bitstr;
mod domain;
mod trie;

pub use bitstr::BitStr;
pub use trie::BinRadixTrie;

use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::RuleConfig;
use crate::error::{Error, Result};

use domain::DomainMatcher;

/// Name of the fallback rule.
pub const DEFAULT_RULE: &str = "default";

/// Matches an address (IP or domain name) against the configured rule set.
pub struct RuleMatcher {
    domain_matcher: DomainMatcher,
    ip_matcher: IpMatcher,
    rule_upstreams: HashMap<String, Vec<String>>,
    /// Every upstream named by any rule, in configuration order.
    pub all_upstreams: Vec<String>,
}

impl RuleMatcher {
    /// Build a matcher from rule configuration.
    pub fn new(rules: &HashMap<String, RuleConfig>) -> Result<Self> {
        let mut rule_upstreams = HashMap::new();
        let mut all_upstreams = Vec::new();
        let mut domain_rules: HashMap<String, Vec<String>> = HashMap::new();
        let mut ip_rules: HashMap<String, Vec<String>> = HashMap::new();

        for (name, rule) in rules {
            if name == DEFAULT_RULE {
                if !rule.domains.is_empty() || !rule.ips.is_empty() {
                    return Err(Error::config(format!(
                        "default rule '{name}' should not have actual rules"
                    )));
                }
            } else {
                domain_rules.insert(name.clone(), rule.domains.clone());
                ip_rules.insert(name.clone(), rule.ips.clone());
            }
            rule_upstreams.insert(name.clone(), rule.upstreams.clone());
            all_upstreams.extend(rule.upstreams.iter().cloned());
        }

        Ok(RuleMatcher {
            domain_matcher: DomainMatcher::new(&domain_rules)?,
            ip_matcher: IpMatcher::new(&ip_rules)?,
            rule_upstreams,
            all_upstreams,
        })
    }

    /// Match a domain name. Returns `(rule, upstreams)`; `("", [])` means no
    /// rule matched and no default rule exists.
    pub fn match_domain(&self, domain: &str) -> (String, Vec<String>) {
        match self.domain_matcher.matches(domain) {
            Some(rule) => (rule.to_string(), self.upstreams_of(rule)),
            None => self.default_or_empty(),
        }
    }

    /// Match an IP address by longest configured prefix.
    pub fn match_ip(&self, ip: IpAddr) -> (String, Vec<String>) {
        match self.ip_matcher.matches(ip) {
            Some(rule) => (rule.to_string(), self.upstreams_of(rule)),
            None => self.default_or_empty(),
        }
    }

    fn upstreams_of(&self, rule: &str) -> Vec<String> {
        self.rule_upstreams.get(rule).cloned().unwrap_or_default()
    }

    fn default_or_empty(&self) -> (String, Vec<String>) {
        match self.rule_upstreams.get(DEFAULT_RULE) {
            Some(ups) => (DEFAULT_RULE.to_string(), ups.clone()),
            None => (String::new(), Vec::new()),
        }
    }
}

struct IpMatcher {
    trie: BinRadixTrie<String>,
}

impl IpMatcher {
    fn new(rules: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut trie = BinRadixTrie::new();
        for (name, patterns) in rules {
            for pattern in patterns {
                let net = parse_ip_pattern(pattern)?;
                trie.insert(net, name.clone());
            }
        }
        Ok(IpMatcher { trie })
    }

    fn matches(&self, ip: IpAddr) -> Option<&str> {
        let key = BitStr::from_bytes(&to_v6_bytes(ip), 128);
        self.trie.find_prefix(&key).map(String::as_str)
    }
}

/// Parse a CIDR or bare IP into its 128-bit prefix form. IPv4 prefixes are
/// widened through the v4-mapped range.
fn parse_ip_pattern(pattern: &str) -> Result<BitStr> {
    let (ip, prefix_len) = if let Ok(net) = pattern.parse::<IpNet>() {
        (net.network(), net.prefix_len())
    } else if let Ok(ip) = pattern.parse::<IpAddr>() {
        let full = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (ip, full)
    } else {
        return Err(Error::config(format!(
            "failed to parse ip pattern: {pattern}"
        )));
    };

    let bits = match ip {
        IpAddr::V4(_) => u32::from(prefix_len) + 96,
        IpAddr::V6(_) => u32::from(prefix_len),
    };
    Ok(BitStr::from_bytes(&to_v6_bytes(ip), bits))
}

fn to_v6_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
