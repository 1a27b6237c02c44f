use crate::{DomainPattern, DstView};
use ip_network::IpNetwork;
use rangemap::RangeInclusiveSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Outcome of matching a remote endpoint against a rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EPResult {
    NoMatch,
    /// Matched a permit rule; carries the rule's description.
    Permitted(String),
    /// Matched a deny rule; carries the rule's description.
    Denied(String),
}

impl EPResult {
    pub fn is_decided(&self) -> bool {
        !matches!(self, EPResult::NoMatch)
    }
}

/// What a single endpoint rule matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointValue {
    /// Matches every remote.
    Any,
    Ip(IpAddr),
    Network(IpNetwork),
    Domain(DomainPattern),
    /// Matches when the remote is on any of the given filter lists.
    Lists(Vec<String>),
}

impl fmt::Display for EndpointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointValue::Any => write!(f, "*"),
            EndpointValue::Ip(ip) => write!(f, "{ip}"),
            EndpointValue::Network(net) => write!(f, "{net}"),
            EndpointValue::Domain(pattern) => write!(f, "{pattern}"),
            EndpointValue::Lists(ids) => write!(f, "L:{}", ids.join(",")),
        }
    }
}

/// Optional protocol/port restriction of a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortFilter {
    /// IP protocol number; `None` matches every protocol.
    pub protocol: Option<u8>,
    /// Matching ports; empty set matches every port.
    pub ports: RangeInclusiveSet<u16>,
}

impl PortFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn protocol(proto: u8) -> Self {
        Self {
            protocol: Some(proto),
            ports: RangeInclusiveSet::new(),
        }
    }

    pub fn with_ports(mut self, range: std::ops::RangeInclusive<u16>) -> Self {
        self.ports.insert(range);
        self
    }

    fn matches(&self, protocol: u8, port: u16) -> bool {
        if self.protocol.is_some_and(|p| p != protocol) {
            return false;
        }

        self.ports.is_empty() || self.ports.contains(&port)
    }
}

/// One endpoint rule: permit or deny a set of remotes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub permit: bool,
    pub value: EndpointValue,
    #[serde(default)]
    pub filter: PortFilter,
}

impl Endpoint {
    pub fn permit(value: EndpointValue) -> Self {
        Self {
            permit: true,
            value,
            filter: PortFilter::any(),
        }
    }

    pub fn deny(value: EndpointValue) -> Self {
        Self {
            permit: false,
            value,
            filter: PortFilter::any(),
        }
    }

    pub fn with_filter(mut self, filter: PortFilter) -> Self {
        self.filter = filter;
        self
    }

    fn matches(&self, dst: &DstView<'_>) -> bool {
        if !self.filter.matches(dst.protocol, dst.port) {
            return false;
        }

        match &self.value {
            EndpointValue::Any => true,
            EndpointValue::Ip(ip) => dst.ip == Some(*ip),
            EndpointValue::Network(net) => dst.ip.is_some_and(|ip| net.contains(ip)),
            EndpointValue::Domain(pattern) => {
                let direct = dst.domain.is_some_and(|d| pattern.matches(d));

                direct
                    || (dst.include_cnames
                        && dst.cnames.iter().any(|cname| pattern.matches(cname)))
            }
            EndpointValue::Lists(ids) => {
                ids.iter().any(|id| dst.lists.iter().any(|have| have == id))
            }
        }
    }

    fn describe(&self) -> String {
        let verb = if self.permit { "permitted" } else { "denied" };
        format!("{verb} by rule {}", self.value)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", if self.permit { "+" } else { "-" }, self.value)
    }
}

/// An ordered rule list; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointList {
    rules: Vec<Endpoint>,
}

impl EndpointList {
    pub fn new(rules: Vec<Endpoint>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Endpoint) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn match_dst(&self, dst: &DstView<'_>) -> EPResult {
        for rule in &self.rules {
            if rule.matches(dst) {
                return if rule.permit {
                    EPResult::Permitted(rule.describe())
                } else {
                    EPResult::Denied(rule.describe())
                };
            }
        }

        EPResult::NoMatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn dst<'a>(ip: &str, port: u16) -> DstView<'a> {
        DstView {
            ip: Some(ip.parse().unwrap()),
            protocol: 6,
            port,
            ..Default::default()
        }
    }

    #[test]
    fn first_match_wins() {
        let list = EndpointList::new(vec![
            Endpoint::deny(EndpointValue::Ip("1.2.3.4".parse().unwrap())),
            Endpoint::permit(EndpointValue::Any),
        ]);

        assert!(matches!(list.match_dst(&dst("1.2.3.4", 443)), EPResult::Denied(_)));
        assert!(matches!(list.match_dst(&dst("5.6.7.8", 443)), EPResult::Permitted(_)));
    }

    #[test]
    fn network_rules_match_contained_ips() {
        let list = EndpointList::new(vec![Endpoint::deny(EndpointValue::Network(
            "10.0.0.0/8".parse().unwrap(),
        ))]);

        assert!(list.match_dst(&dst("10.1.2.3", 80)).is_decided());
        assert_eq!(list.match_dst(&dst("11.1.2.3", 80)), EPResult::NoMatch);
    }

    #[test_case(6, 443, true; "tcp on matching port")]
    #[test_case(6, 80, false; "tcp on other port")]
    #[test_case(17, 443, false; "other protocol")]
    fn port_filter_restricts_rule(protocol: u8, port: u16, expect_match: bool) {
        let rule = Endpoint::permit(EndpointValue::Any)
            .with_filter(PortFilter::protocol(6).with_ports(443..=443));
        let list = EndpointList::new(vec![rule]);

        let view = DstView {
            ip: Some("1.1.1.1".parse().unwrap()),
            protocol,
            port,
            ..Default::default()
        };

        assert_eq!(list.match_dst(&view).is_decided(), expect_match);
    }

    #[test]
    fn domain_rules_only_see_cnames_when_enabled() {
        let list = EndpointList::new(vec![Endpoint::deny(EndpointValue::Domain(
            DomainPattern::new(".tracker.example").unwrap(),
        ))]);

        let cnames = vec!["cdn.tracker.example".to_owned()];
        let mut view = DstView {
            domain: Some("innocent.example"),
            cnames: &cnames,
            protocol: 6,
            port: 443,
            ..Default::default()
        };

        assert_eq!(list.match_dst(&view), EPResult::NoMatch);

        view.include_cnames = true;
        assert!(matches!(list.match_dst(&view), EPResult::Denied(_)));
    }

    #[test]
    fn list_rules_match_on_intersection() {
        let list = EndpointList::new(vec![Endpoint::deny(EndpointValue::Lists(vec![
            "TRC".to_owned(),
            "MAL".to_owned(),
        ]))]);

        let matched = vec!["MAL".to_owned()];
        let view = DstView {
            domain: Some("bad.example"),
            lists: &matched,
            protocol: 6,
            port: 443,
            ..Default::default()
        };

        assert!(matches!(list.match_dst(&view), EPResult::Denied(_)));
    }
}
