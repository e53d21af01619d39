//! Host allowlist policy and secret substitution table.
//!
//! The engine is a pure function from `(host, destination IP)` to a
//! [`Verdict`]; it holds no per-connection state and is immutable after
//! construction, so the datapath reads it lock-free behind an `Arc`.
//!
//! # Pattern grammar
//!
//! - `host.example.com`   exact match (case-insensitive)
//! - `*`                  any host
//! - `*.example.com`      any subdomain (`a.example.com`, `a.b.example.com`,
//!   but not `example.com` itself)
//! - `api-*.example.com`  wildcard within the leftmost label
//!   (`api-v1.example.com`, but not `api-v1.x.example.com`)
//!
//! IP literals match only themselves. When several patterns match, the most
//! specific (longest literal text) wins; all matches allow, so the tie-break
//! only affects the reported reason.

use crate::api::{NetworkConfig, Secret};
use std::net::IpAddr;

/// A parsed allowed-host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `*` — every host.
    Any,
    /// Literal host or IP.
    Exact(String),
    /// `*.suffix` — any subdomain of `suffix`.
    Subdomain(String),
    /// `prefix-*.suffix` — wildcard confined to the leftmost label.
    LabelGlob { prefix: String, suffix: String },
}

impl HostPattern {
    /// Parse a pattern string, rejecting anything outside the grammar.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err("empty pattern".to_string());
        }
        let stars = pattern.matches('*').count();
        if stars > 1 {
            return Err("at most one wildcard is allowed".to_string());
        }
        if stars == 0 {
            return Ok(HostPattern::Exact(pattern));
        }
        if pattern == "*" {
            return Ok(HostPattern::Any);
        }
        if let Some(suffix) = pattern.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                return Err("wildcard suffix must be a literal domain".to_string());
            }
            return Ok(HostPattern::Subdomain(suffix.to_string()));
        }
        // prefix-*.suffix: the star stays inside the leftmost label.
        let star = pattern.find('*').unwrap();
        let (prefix, rest) = pattern.split_at(star);
        let rest = &rest[1..];
        let suffix = rest
            .strip_prefix('.')
            .ok_or_else(|| "wildcard must end a label (prefix-*.suffix)".to_string())?;
        if prefix.is_empty() || prefix.contains('.') || suffix.is_empty() {
            return Err("wildcard must stay within the leftmost label".to_string());
        }
        Ok(HostPattern::LabelGlob {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Whether `host` (already lowercased) matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Exact(exact) => host == exact,
            HostPattern::Subdomain(suffix) => {
                host.len() > suffix.len() + 1
                    && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            }
            HostPattern::LabelGlob { prefix, suffix } => {
                let Some(rest) = host.strip_prefix(prefix.as_str()) else {
                    return false;
                };
                let Some(label_rest) = rest.strip_suffix(suffix.as_str()) else {
                    return false;
                };
                let Some(label_rest) = label_rest.strip_suffix('.') else {
                    return false;
                };
                !label_rest.contains('.')
            }
        }
    }

    /// Literal character count, used for longest-match-first tie-breaks.
    fn specificity(&self) -> usize {
        match self {
            HostPattern::Any => 0,
            HostPattern::Exact(e) => e.len(),
            HostPattern::Subdomain(s) => s.len(),
            HostPattern::LabelGlob { prefix, suffix } => prefix.len() + suffix.len(),
        }
    }
}

/// Why a verdict allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictReason {
    /// Matched an allowed-host pattern.
    Allowlisted,
    /// No pattern matched.
    NotAllowlisted,
    /// Destination is in a private/reserved range and blocking is on.
    PrivateIp,
}

impl VerdictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictReason::Allowlisted => "allowlisted",
            VerdictReason::NotAllowlisted => "not-allowlisted",
            VerdictReason::PrivateIp => "private-ip",
        }
    }
}

/// Result of one policy evaluation, cached per connection by callers.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub allow: bool,
    pub reason: VerdictReason,
    /// `(placeholder, value)` pairs applicable to this host.
    pub substitutions: Vec<(String, String)>,
}

struct SecretEntry {
    placeholder: String,
    value: String,
    patterns: Vec<HostPattern>,
}

/// Stateless allow/deny engine plus the substitution table.
pub struct PolicyEngine {
    patterns: Vec<HostPattern>,
    block_private_ips: bool,
    secrets: Vec<SecretEntry>,
}

impl PolicyEngine {
    /// Build the engine from validated network configuration.
    ///
    /// Patterns that fail to parse are skipped here; [`crate::api::Config::validate`]
    /// rejects them before a sandbox is created.
    pub fn new(config: &NetworkConfig) -> Self {
        let patterns = config
            .allowed_hosts
            .iter()
            .filter_map(|p| HostPattern::parse(p).ok())
            .collect();
        let secrets = config
            .secrets
            .values()
            .map(|s: &Secret| SecretEntry {
                placeholder: s.placeholder.clone(),
                value: s.value.clone(),
                patterns: s
                    .hosts
                    .iter()
                    .filter_map(|p| HostPattern::parse(p).ok())
                    .collect(),
            })
            .collect();
        Self {
            patterns,
            block_private_ips: config.block_private_ips,
            secrets,
        }
    }

    /// Evaluate a named host, optionally with its resolved address.
    pub fn evaluate(&self, host: &str, ip: Option<IpAddr>) -> Verdict {
        let host = host.to_lowercase();

        if self.block_private_ips {
            let literal_ip = host.parse::<IpAddr>().ok();
            if let Some(ip) = ip.or(literal_ip) {
                if is_private(ip) {
                    return Verdict {
                        allow: false,
                        reason: VerdictReason::PrivateIp,
                        substitutions: Vec::new(),
                    };
                }
            }
        }

        let matched = self
            .patterns
            .iter()
            .filter(|p| p.matches(&host))
            .max_by_key(|p| p.specificity());

        match matched {
            Some(_) => Verdict {
                allow: true,
                reason: VerdictReason::Allowlisted,
                substitutions: self.substitutions_for(&host),
            },
            None => Verdict {
                allow: false,
                reason: VerdictReason::NotAllowlisted,
                substitutions: Vec::new(),
            },
        }
    }

    /// Evaluate a bare destination address (flows with no hostname, e.g.
    /// guest TCP to ports other than 80/443).
    pub fn evaluate_ip(&self, ip: IpAddr) -> Verdict {
        self.evaluate(&ip.to_string(), Some(ip))
    }

    /// Substitution set for an effective host: the sandbox secret table
    /// intersected with the host's matching patterns.
    pub fn substitutions_for(&self, host: &str) -> Vec<(String, String)> {
        let host = host.to_lowercase();
        self.secrets
            .iter()
            .filter(|s| s.patterns.iter().any(|p| p.matches(&host)))
            .map(|s| (s.placeholder.clone(), s.value.clone()))
            .collect()
    }

    pub fn block_private_ips(&self) -> bool {
        self.block_private_ips
    }
}

/// RFC1918, loopback, link-local, and CGNAT (100.64/10) ranges.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fe80::/10 link-local, fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn engine(hosts: &[&str]) -> PolicyEngine {
        PolicyEngine::new(&NetworkConfig {
            allowed_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            block_private_ips: true,
            secrets: HashMap::new(),
        })
    }

    #[test]
    fn test_pattern_parse_grammar() {
        assert_eq!(HostPattern::parse("*").unwrap(), HostPattern::Any);
        assert_eq!(
            HostPattern::parse("Example.COM").unwrap(),
            HostPattern::Exact("example.com".to_string())
        );
        assert_eq!(
            HostPattern::parse("*.example.com").unwrap(),
            HostPattern::Subdomain("example.com".to_string())
        );
        assert!(matches!(
            HostPattern::parse("api-*.example.com").unwrap(),
            HostPattern::LabelGlob { .. }
        ));

        assert!(HostPattern::parse("").is_err());
        assert!(HostPattern::parse("a*b*.com").is_err());
        assert!(HostPattern::parse("api.*-x.com").is_err());
        assert!(HostPattern::parse("*example.com").is_err());
    }

    #[test]
    fn test_subdomain_matching() {
        let p = HostPattern::parse("*.example.com").unwrap();
        assert!(p.matches("api.example.com"));
        assert!(p.matches("a.b.example.com"));
        assert!(!p.matches("example.com"));
        assert!(!p.matches("fakeexample.com"));
    }

    #[test]
    fn test_label_glob_matching() {
        let p = HostPattern::parse("api-*.example.com").unwrap();
        assert!(p.matches("api-v1.example.com"));
        assert!(p.matches("api-prod.example.com"));
        // The wildcard never crosses a dot boundary mid-pattern.
        assert!(!p.matches("api-v1.x.example.com"));
        assert!(!p.matches("api.example.com"));
        assert!(!p.matches("xapi-v1.example.com"));
    }

    #[test]
    fn test_allowlisted_host() {
        let engine = engine(&["example.com", "*.trusted.io"]);
        let verdict = engine.evaluate("example.com", None);
        assert!(verdict.allow);
        assert_eq!(verdict.reason, VerdictReason::Allowlisted);

        assert!(engine.evaluate("api.trusted.io", None).allow);
        assert!(!engine.evaluate("other.com", None).allow);
    }

    #[test]
    fn test_case_insensitive() {
        let engine = engine(&["Example.COM"]);
        assert!(engine.evaluate("EXAMPLE.com", None).allow);
    }

    #[test]
    fn test_denied_reason() {
        let engine = engine(&["example.com"]);
        let verdict = engine.evaluate("blocked.test", None);
        assert!(!verdict.allow);
        assert_eq!(verdict.reason, VerdictReason::NotAllowlisted);
    }

    #[test]
    fn test_private_ip_denied_even_when_allowlisted() {
        let engine = engine(&["*"]);
        let verdict = engine.evaluate("10.1.2.3", None);
        assert!(!verdict.allow);
        assert_eq!(verdict.reason, VerdictReason::PrivateIp);

        let verdict = engine.evaluate("example.com", Some("192.168.1.1".parse().unwrap()));
        assert_eq!(verdict.reason, VerdictReason::PrivateIp);
    }

    #[test]
    fn test_private_ip_allowed_when_blocking_off() {
        let engine = PolicyEngine::new(&NetworkConfig {
            allowed_hosts: vec!["*".to_string()],
            block_private_ips: false,
            secrets: HashMap::new(),
        });
        assert!(engine.evaluate("10.1.2.3", None).allow);
    }

    #[test]
    fn test_cgnat_and_link_local() {
        assert!(is_private("100.64.0.1".parse().unwrap()));
        assert!(is_private("100.127.255.1".parse().unwrap()));
        assert!(!is_private("100.128.0.1".parse().unwrap()));
        assert!(is_private("169.254.0.5".parse().unwrap()));
        assert!(is_private("127.0.0.1".parse().unwrap()));
        assert!(!is_private("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_ip_literal_matches_only_itself() {
        let engine = engine(&["93.184.216.34"]);
        assert!(engine.evaluate("93.184.216.34", None).allow);
        assert!(!engine.evaluate("93.184.216.35", None).allow);
    }

    #[test]
    fn test_substitutions_intersect_host() {
        let mut secrets = HashMap::new();
        secrets.insert(
            "TOKEN".to_string(),
            Secret {
                value: "supersecret".to_string(),
                placeholder: "MLSK_TOKEN_abc".to_string(),
                hosts: vec!["api.example.com".to_string()],
            },
        );
        secrets.insert(
            "OTHER".to_string(),
            Secret {
                value: "other-value".to_string(),
                placeholder: "MLSK_OTHER_def".to_string(),
                hosts: vec!["*.internal.io".to_string()],
            },
        );
        let engine = PolicyEngine::new(&NetworkConfig {
            allowed_hosts: vec!["*".to_string()],
            block_private_ips: true,
            secrets,
        });

        let verdict = engine.evaluate("api.example.com", None);
        assert_eq!(
            verdict.substitutions,
            vec![("MLSK_TOKEN_abc".to_string(), "supersecret".to_string())]
        );

        // A host outside the secret's host_set gets no substitutions (P2).
        assert!(engine.evaluate("other.example.com", None).substitutions.is_empty());
    }

    #[test]
    fn test_longest_match_wins() {
        // Both patterns match; the exact one is more specific. All matches
        // allow, so this exercises the tie-break path for stability.
        let engine = engine(&["*.example.com", "api.example.com"]);
        assert!(engine.evaluate("api.example.com", None).allow);
    }
}
