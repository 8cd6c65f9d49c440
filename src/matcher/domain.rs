//! Domain-name matching.
//!
//! All rules are combined into a single case-insensitive regular expression
//! in which every rule contributes one named alternative wrapping all of its
//! anchored patterns. A domain matches the rule whose named group matched
//! starting at offset 0.

use std::collections::HashMap;
use std::fmt::Write;

use regex::Regex;

use crate::error::{Error, Result};

pub(crate) struct DomainMatcher {
    pattern: Regex,
    /// rule name → capture-group index
    rule_groups: HashMap<String, usize>,
}

impl DomainMatcher {
    pub(crate) fn new(rules: &HashMap<String, Vec<String>>) -> Result<Self> {
        let with_patterns: Vec<(&String, &Vec<String>)> = rules
            .iter()
            .filter(|(_, patterns)| !patterns.is_empty())
            .collect();

        if with_patterns.is_empty() {
            return Ok(DomainMatcher {
                pattern: Regex::new("^$").expect("static pattern"),
                rule_groups: HashMap::new(),
            });
        }

        let mut expr = String::from("(?i)");
        for (i, (name, patterns)) in with_patterns.iter().enumerate() {
            if i > 0 {
                expr.push('|');
            }
            write!(expr, "(?P<{name}>").expect("write to string");
            for (j, p) in patterns.iter().enumerate() {
                if j > 0 {
                    expr.push('|');
                }
                write!(expr, "(^{p}$)").expect("write to string");
            }
            expr.push(')');
        }

        let pattern = Regex::new(&expr)
            .map_err(|e| Error::config(format!("invalid domain rule pattern: {e}")))?;

        let mut rule_groups = HashMap::new();
        for (idx, name) in pattern.capture_names().enumerate() {
            if let Some(name) = name {
                if rules.contains_key(name) {
                    rule_groups.insert(name.to_string(), idx);
                }
            }
        }

        Ok(DomainMatcher {
            pattern,
            rule_groups,
        })
    }

    /// Returns the matched rule name, if any.
    pub(crate) fn matches(&self, domain: &str) -> Option<&str> {
        let caps = self.pattern.captures(domain)?;
        for (rule, &group) in &self.rule_groups {
            if let Some(m) = caps.get(group) {
                if m.start() == 0 {
                    return Some(rule);
                }
            }
        }
        None
    }
}
