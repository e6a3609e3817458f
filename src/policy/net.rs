use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::SpyctlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    TCP,
    UDP,
}

/// A port or port range bound to a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortProto {
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "endPort", default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
}

impl PortProto {
    pub fn validate(&self, field: &str) -> Result<(), SpyctlError> {
        if let Some(end) = self.end_port
            && end < self.port
        {
            return Err(SpyctlError::validation(
                format!("{field}.endPort"),
                end.to_string(),
                format!("endPort must be greater than or equal to port ({})", self.port),
            ));
        }
        Ok(())
    }
}

// Sorted port-first so rule output is ordered by port, not protocol.
impl Ord for PortProto {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.port, self.end_port.unwrap_or(self.port), self.protocol).cmp(&(
            other.port,
            other.end_port.unwrap_or(other.port),
            other.protocol,
        ))
    }
}

impl PartialOrd for PortProto {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// CIDR block with optional carve-outs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<Vec<String>>,
}

/// One entry in a rule's `to`/`from` list. The wire shape is a singleton
/// map, `{ipBlock: {...}}` or `{dnsSelector: [...]}`, in both YAML and
/// JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "PeerSelectorWire", into = "PeerSelectorWire")]
pub enum PeerSelector {
    IpBlock(IpBlock),
    DnsSelector(Vec<String>),
}

// Externally tagged enums surface as `!` tags in YAML; the singleton-map
// shape needs this untagged indirection.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PeerSelectorWire {
    IpBlock {
        #[serde(rename = "ipBlock")]
        ip_block: IpBlock,
    },
    DnsSelector {
        #[serde(rename = "dnsSelector")]
        dns_selector: Vec<String>,
    },
}

impl From<PeerSelector> for PeerSelectorWire {
    fn from(peer: PeerSelector) -> Self {
        match peer {
            PeerSelector::IpBlock(ip_block) => PeerSelectorWire::IpBlock { ip_block },
            PeerSelector::DnsSelector(dns_selector) => {
                PeerSelectorWire::DnsSelector { dns_selector }
            }
        }
    }
}

impl From<PeerSelectorWire> for PeerSelector {
    fn from(wire: PeerSelectorWire) -> Self {
        match wire {
            PeerSelectorWire::IpBlock { ip_block } => PeerSelector::IpBlock(ip_block),
            PeerSelectorWire::DnsSelector { dns_selector } => {
                PeerSelector::DnsSelector(dns_selector)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    /// Wire key holding the peer list for this direction.
    pub fn peer_field(&self) -> &'static str {
        match self {
            Direction::Ingress => "from",
            Direction::Egress => "to",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Ingress => Direction::Egress,
            Direction::Egress => Direction::Ingress,
        }
    }
}

/// An allow-rule. Ingress rules carry `from`, egress rules carry `to`;
/// presence of the right key is checked at merge time, not during
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<PeerSelector>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<PeerSelector>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<String>,
    pub ports: Vec<PortProto>,
}

impl NetworkRule {
    /// Peer list for the given direction, or a validation error if the
    /// rule carries the opposite direction's key, with or without the
    /// right one.
    pub fn peers(&self, direction: Direction) -> Result<&[PeerSelector], SpyctlError> {
        let (want, wrong) = match direction {
            Direction::Ingress => (self.from.as_deref(), self.to.is_some()),
            Direction::Egress => (self.to.as_deref(), self.from.is_some()),
        };
        let opposite = direction.opposite().peer_field();
        if wrong {
            return Err(SpyctlError::validation(
                format!("networkPolicy.{}", direction.as_str()),
                opposite,
                format!("rule must not carry the '{opposite}' field"),
            ));
        }
        want.ok_or_else(|| {
            SpyctlError::validation(
                format!("networkPolicy.{}", direction.as_str()),
                "",
                format!("rule is missing the '{}' field", direction.peer_field()),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub ingress: Vec<NetworkRule>,
    #[serde(default)]
    pub egress: Vec<NetworkRule>,
}

impl NetworkPolicy {
    pub fn rules(&self, direction: Direction) -> &[NetworkRule] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }
}

/// Parsed, normalized CIDR. Used as an exact-match dedup and sort key;
/// no subnet arithmetic happens during merging.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cidr {
    pub v6: bool,
    pub addr: u128,
    pub prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`. Rejects missing or out-of-range prefix
    /// lengths and networks with host bits set.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let Some((addr_part, prefix_part)) = trimmed.split_once('/') else {
            return Err("missing '/prefix' length".to_string());
        };
        let prefix: u8 = prefix_part
            .parse()
            .map_err(|_| "invalid prefix length".to_string())?;
        if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
            if prefix > 32 {
                return Err("IPv4 prefix length must be <= 32".to_string());
            }
            let addr = u32::from(v4);
            if addr & !v4_mask(prefix) != 0 {
                return Err("network has host bits set".to_string());
            }
            Ok(Cidr {
                v6: false,
                addr: addr as u128,
                prefix,
            })
        } else if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
            if prefix > 128 {
                return Err("IPv6 prefix length must be <= 128".to_string());
            }
            let addr = u128::from(v6);
            if addr & !v6_mask(prefix) != 0 {
                return Err("network has host bits set".to_string());
            }
            Ok(Cidr {
                v6: true,
                addr,
                prefix,
            })
        } else {
            Err("invalid network address".to_string())
        }
    }

    /// True if `other` lies entirely within this network. Only used to
    /// validate `except` blocks against their outer CIDR.
    pub fn contains(&self, other: &Cidr) -> bool {
        if self.v6 != other.v6 || other.prefix < self.prefix {
            return false;
        }
        let mask = if self.v6 {
            v6_mask(self.prefix)
        } else {
            v4_mask(self.prefix) as u128
        };
        other.addr & mask == self.addr
    }

    /// Canonical string form.
    pub fn normalized(&self) -> String {
        if self.v6 {
            format!("{}/{}", Ipv6Addr::from(self.addr), self.prefix)
        } else {
            format!("{}/{}", Ipv4Addr::from(self.addr as u32), self.prefix)
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("192.168.1.0/24", "192.168.1.0/24")]
    #[case(" 10.0.0.0/8 ", "10.0.0.0/8")]
    #[case("0.0.0.0/0", "0.0.0.0/0")]
    #[case("192.168.1.7/32", "192.168.1.7/32")]
    #[case("2001:db8::/32", "2001:db8::/32")]
    fn parse_valid_cidrs(#[case] raw: &str, #[case] normalized: &str) {
        let cidr = Cidr::parse(raw).unwrap();
        assert_eq!(cidr.normalized(), normalized);
    }

    #[rstest]
    #[case("192.168.1.0", "missing")]
    #[case("192.168.1.0/33", "prefix")]
    #[case("192.168.1.1/24", "host bits")]
    #[case("2001:db8::1/32", "host bits")]
    #[case("not-a-network/8", "invalid network")]
    #[case("10.0.0.0/abc", "prefix")]
    fn parse_invalid_cidrs(#[case] raw: &str, #[case] reason_fragment: &str) {
        let err = Cidr::parse(raw).unwrap_err();
        assert!(
            err.contains(reason_fragment),
            "'{err}' should mention '{reason_fragment}'"
        );
    }

    #[rstest]
    #[case("10.0.0.0/8", "10.1.0.0/16", true)]
    #[case("10.0.0.0/8", "10.0.0.1/32", true)]
    #[case("10.0.0.0/8", "11.0.0.0/16", false)]
    #[case("10.1.0.0/16", "10.0.0.0/8", false)]
    #[case("10.0.0.0/8", "2001:db8::/32", false)]
    fn cidr_containment(#[case] outer: &str, #[case] inner: &str, #[case] expected: bool) {
        let outer = Cidr::parse(outer).unwrap();
        let inner = Cidr::parse(inner).unwrap();
        assert_eq!(outer.contains(&inner), expected);
    }

    #[test]
    fn cidr_sorts_v4_before_v6() {
        let mut cidrs = vec![
            Cidr::parse("2001:db8::/32").unwrap(),
            Cidr::parse("192.168.0.0/16").unwrap(),
            Cidr::parse("10.0.0.0/8").unwrap(),
        ];
        cidrs.sort();
        let rendered: Vec<String> = cidrs.iter().map(Cidr::normalized).collect();
        assert_eq!(rendered, ["10.0.0.0/8", "192.168.0.0/16", "2001:db8::/32"]);
    }

    #[test]
    fn ports_order_by_port_not_protocol() {
        let mut ports = vec![
            PortProto {
                protocol: Protocol::UDP,
                port: 53,
                end_port: None,
            },
            PortProto {
                protocol: Protocol::TCP,
                port: 443,
                end_port: None,
            },
            PortProto {
                protocol: Protocol::TCP,
                port: 53,
                end_port: None,
            },
        ];
        ports.sort();
        assert_eq!(ports[0].port, 53);
        assert_eq!(ports[0].protocol, Protocol::TCP);
        assert_eq!(ports[2].port, 443);
    }

    #[test]
    fn port_range_validation() {
        let bad = PortProto {
            protocol: Protocol::TCP,
            port: 8080,
            end_port: Some(80),
        };
        assert!(bad.validate("networkPolicy.egress.ports").is_err());
        let good = PortProto {
            protocol: Protocol::TCP,
            port: 80,
            end_port: Some(8080),
        };
        assert!(good.validate("networkPolicy.egress.ports").is_ok());
    }

    #[test]
    fn peer_selector_wire_shape() {
        let peer = PeerSelector::IpBlock(IpBlock {
            cidr: "10.0.0.0/8".to_string(),
            except: None,
        });
        // singleton map, never a YAML `!` tag
        let yaml = serde_yaml::to_string(&peer).unwrap();
        assert_eq!(yaml, "ipBlock:\n  cidr: 10.0.0.0/8\n");
        let back: PeerSelector = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, peer);

        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, r#"{"ipBlock":{"cidr":"10.0.0.0/8"}}"#);

        let dns: PeerSelector =
            serde_yaml::from_str("dnsSelector:\n- mongodb.rsvp.svc.cluster.local\n").unwrap();
        assert_eq!(
            dns,
            PeerSelector::DnsSelector(vec!["mongodb.rsvp.svc.cluster.local".to_string()])
        );
        let yaml = serde_yaml::to_string(&dns).unwrap();
        assert_eq!(yaml, "dnsSelector:\n- mongodb.rsvp.svc.cluster.local\n");
    }

    #[test]
    fn rule_direction_mismatch_is_rejected() {
        let rule = NetworkRule {
            from: None,
            to: Some(vec![]),
            processes: vec![],
            ports: vec![],
        };
        assert!(rule.peers(Direction::Egress).is_ok());
        assert!(rule.peers(Direction::Ingress).is_err());
    }

    #[test]
    fn rule_with_both_direction_keys_is_rejected() {
        let rule = NetworkRule {
            from: Some(vec![]),
            to: Some(vec![]),
            processes: vec![],
            ports: vec![],
        };
        let err = rule.peers(Direction::Ingress).unwrap_err();
        match err {
            SpyctlError::Validation { field, value, .. } => {
                assert_eq!(field, "networkPolicy.ingress");
                assert_eq!(value, "to");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(rule.peers(Direction::Egress).is_err());
    }
}
