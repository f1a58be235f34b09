// src/core/policy/mod.rs

//! Access-control rules and browse filters applied to incoming discovery
//! events.

use crate::config::{BrowseFilterConfig, BrowseOrder, PolicyConfig};
use crate::core::errors::BridgeError;
use crate::core::events::ServiceMeta;
use regex::Regex;
use std::net::IpAddr;
use tracing::debug;

/// Whether a rule admits or rejects matching sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSense {
    Allow,
    Deny,
}

/// What a rule matches against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    /// A single address.
    Ip(IpAddr),
    /// A network with a prefix length.
    Net { base: IpAddr, prefix: u8 },
    /// Every source, written as `all` in the configuration.
    Any,
    /// Loopback and link-local sources, written as `@LOCAL`.
    Local,
}

/// One access-control rule.
#[derive(Debug, Clone)]
pub struct AllowRule {
    pub sense: RuleSense,
    pub kind: RuleKind,
}

impl AllowRule {
    /// Parses a configuration entry such as `192.168.0.0/24`, `10.0.0.1`,
    /// `all`, or `@LOCAL`.
    pub fn parse(sense: RuleSense, entry: &str) -> Result<Self, BridgeError> {
        let entry = entry.trim();
        let kind = if entry.eq_ignore_ascii_case("all") {
            RuleKind::Any
        } else if entry.eq_ignore_ascii_case("@local") {
            RuleKind::Local
        } else if let Some((base, prefix)) = entry.split_once('/') {
            let base: IpAddr = base
                .parse()
                .map_err(|_| BridgeError::Discovery(format!("bad network '{entry}'")))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| BridgeError::Discovery(format!("bad prefix in '{entry}'")))?;
            let max = match base {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(BridgeError::Discovery(format!(
                    "prefix /{prefix} too long in '{entry}'"
                )));
            }
            RuleKind::Net { base, prefix }
        } else {
            let ip: IpAddr = entry
                .parse()
                .map_err(|_| BridgeError::Discovery(format!("bad address '{entry}'")))?;
            RuleKind::Ip(ip)
        };
        Ok(Self { sense, kind })
    }

    fn matches(&self, addr: IpAddr) -> bool {
        match &self.kind {
            RuleKind::Any => true,
            RuleKind::Local => addr.is_loopback() || is_link_local(addr),
            RuleKind::Ip(ip) => *ip == addr,
            RuleKind::Net { base, prefix } => net_contains(*base, *prefix, addr),
        }
    }
}

fn is_link_local(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local() || v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn net_contains(base: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (base, addr) {
        (IpAddr::V4(base), IpAddr::V4(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(base) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(base), IpAddr::V6(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(base) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

/// The compiled allow/deny rule set.
#[derive(Debug, Default)]
pub struct AccessPolicy {
    order: BrowseOrder,
    allow: Vec<AllowRule>,
    deny: Vec<AllowRule>,
}

impl AccessPolicy {
    pub fn compile(config: &PolicyConfig) -> Result<Self, BridgeError> {
        let allow = config
            .allow
            .iter()
            .map(|e| AllowRule::parse(RuleSense::Allow, e))
            .collect::<Result<Vec<_>, _>>()?;
        let deny = config
            .deny
            .iter()
            .map(|e| AllowRule::parse(RuleSense::Deny, e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            order: config.browse_order,
            allow,
            deny,
        })
    }

    /// Evaluates the rule set against a source address.
    ///
    /// With no rules, everything is admitted. With only allow rules the
    /// default flips to deny; with only deny rules it stays allow. Rules are
    /// evaluated in the configured browse order, later matches winning.
    pub fn permits(&self, addr: IpAddr) -> bool {
        if self.allow.is_empty() && self.deny.is_empty() {
            return true;
        }

        let mut verdict = if !self.allow.is_empty() && self.deny.is_empty() {
            false
        } else if self.allow.is_empty() {
            true
        } else {
            // Both kinds present: the browse order decides the default.
            matches!(self.order, BrowseOrder::AllowDeny)
        };

        let passes: [&[AllowRule]; 2] = match self.order {
            BrowseOrder::AllowDeny => [&self.allow, &self.deny],
            BrowseOrder::DenyAllow => [&self.deny, &self.allow],
        };

        for rules in passes {
            for rule in rules {
                if rule.matches(addr) {
                    verdict = rule.sense == RuleSense::Allow;
                }
            }
        }

        verdict
    }
}

/// Whether a filter requires its field to match or to not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSense {
    Match,
    NotMatch,
}

/// One compiled browse filter.
#[derive(Debug)]
pub struct BrowseFilter {
    pub sense: FilterSense,
    pub field: String,
    /// Compiled pattern; absent means the field must carry the boolean TXT
    /// value `T`.
    pub regex: Option<Regex>,
}

impl BrowseFilter {
    pub fn compile(config: &BrowseFilterConfig) -> Result<Self, BridgeError> {
        let sense = match config.sense.as_str() {
            "not-match" => FilterSense::NotMatch,
            _ => FilterSense::Match,
        };
        let regex = match &config.pattern {
            Some(p) => Some(
                Regex::new(p)
                    .map_err(|e| BridgeError::Discovery(format!("bad filter pattern: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            sense,
            field: config.field.clone(),
            regex,
        })
    }

    fn field_matches(&self, meta: &ServiceMeta) -> bool {
        let value = meta.field(&self.field);
        match (&self.regex, value) {
            (Some(re), Some(v)) => re.is_match(&v),
            (Some(_), None) => false,
            // Without a pattern, the field must carry the boolean TXT truth
            // value.
            (None, Some(v)) => v == "T",
            (None, None) => false,
        }
    }
}

/// The compiled browse filter chain.
#[derive(Debug, Default)]
pub struct BrowseFilters {
    filters: Vec<BrowseFilter>,
}

impl BrowseFilters {
    pub fn compile(config: &PolicyConfig) -> Result<Self, BridgeError> {
        let filters = config
            .browse_filter
            .iter()
            .map(BrowseFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    /// Evaluates the chain; a single failed filter rejects the event.
    pub fn admits(&self, meta: &ServiceMeta) -> bool {
        for filter in &self.filters {
            let matched = filter.field_matches(meta);
            let pass = match filter.sense {
                FilterSense::Match => matched,
                FilterSense::NotMatch => !matched,
            };
            if !pass {
                debug!(
                    "Browse filter on '{}' rejected '{}'",
                    filter.field, meta.service_name
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn policy(allow: &[&str], deny: &[&str], order: BrowseOrder) -> AccessPolicy {
        let config = PolicyConfig {
            browse_order: order,
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        AccessPolicy::compile(&config).unwrap()
    }

    #[test]
    fn no_rules_allows_everything() {
        let p = policy(&[], &[], BrowseOrder::AllowDeny);
        assert!(p.permits("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn only_allow_rules_deny_by_default() {
        let p = policy(&["192.168.1.0/24"], &[], BrowseOrder::AllowDeny);
        assert!(p.permits("192.168.1.77".parse().unwrap()));
        assert!(!p.permits("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn only_deny_rules_allow_by_default() {
        let p = policy(&[], &["10.0.0.0/8"], BrowseOrder::AllowDeny);
        assert!(!p.permits("10.1.2.3".parse().unwrap()));
        assert!(p.permits("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn deny_allow_order_lets_allow_win() {
        let p = policy(&["10.0.0.5"], &["10.0.0.0/8"], BrowseOrder::DenyAllow);
        assert!(p.permits("10.0.0.5".parse().unwrap()));
        assert!(!p.permits("10.0.0.6".parse().unwrap()));
    }
}
