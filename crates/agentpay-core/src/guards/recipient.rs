//! Recipient allow/deny lists.

use regex::Regex;

use super::{GuardContext, GuardDecision, GuardToken};
use crate::error::Error;

/// Whether a match admits or blocks the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecipientMode {
    /// Only matching recipients are allowed.
    Whitelist,
    /// Matching recipients are blocked.
    Blacklist,
}

/// Recipient filter over exact addresses, URL domain substrings, and
/// regex patterns, evaluated in that order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientGuard {
    /// List semantics.
    pub mode: RecipientMode,
    /// Exact recipient strings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    /// Substrings matched against the host of URL recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Regex patterns matched against the whole recipient.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

/// Host part of a URL recipient, when it is one.
fn url_host(recipient: &str) -> Option<&str> {
    let rest = recipient.strip_prefix("https://").or_else(|| recipient.strip_prefix("http://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

impl RecipientGuard {
    /// A whitelist over exact addresses.
    pub fn whitelist(addresses: Vec<String>) -> Self {
        Self { mode: RecipientMode::Whitelist, addresses, domains: Vec::new(), patterns: Vec::new() }
    }

    /// A blacklist over exact addresses.
    pub fn blacklist(addresses: Vec<String>) -> Self {
        Self { mode: RecipientMode::Blacklist, addresses, domains: Vec::new(), patterns: Vec::new() }
    }

    /// Reject unparseable regex patterns up front.
    pub fn validate(&self) -> Result<(), Error> {
        for pattern in &self.patterns {
            Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("bad recipient pattern {pattern:?}: {e}")))?;
        }
        Ok(())
    }

    /// Exact match first, then domain, then pattern.
    fn matches(&self, recipient: &str) -> bool {
        if self.addresses.iter().any(|a| a == recipient) {
            return true;
        }
        if let Some(host) = url_host(recipient) {
            if self.domains.iter().any(|d| host.contains(d.as_str())) {
                return true;
            }
        }
        self.patterns.iter().any(|p| Regex::new(p).is_ok_and(|re| re.is_match(recipient)))
    }

    fn decide(&self, recipient: &str) -> GuardDecision {
        let matched = self.matches(recipient);
        match (self.mode, matched) {
            (RecipientMode::Whitelist, true) | (RecipientMode::Blacklist, false) => {
                GuardDecision::allow()
            }
            (RecipientMode::Whitelist, false) => {
                GuardDecision::block(format!("recipient {recipient} is not whitelisted"))
            }
            (RecipientMode::Blacklist, true) => {
                GuardDecision::block(format!("recipient {recipient} is blacklisted"))
            }
        }
    }

    /// List check, for simulation.
    pub fn check(&self, ctx: &GuardContext) -> GuardDecision {
        self.decide(&ctx.recipient)
    }

    /// List check as a reservation; nothing is counted.
    pub fn reserve(&self, ctx: &GuardContext) -> Result<GuardToken, Error> {
        let decision = self.decide(&ctx.recipient);
        if decision.allowed {
            Ok(GuardToken::Stateless)
        } else {
            Err(Error::GuardBlocked {
                guard: "recipient".to_owned(),
                reason: decision.reason.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Amount;

    fn ctx(recipient: &str) -> Result<GuardContext, Box<dyn std::error::Error>> {
        Ok(GuardContext {
            wallet_id: "w-1".to_owned(),
            wallet_set_id: None,
            recipient: recipient.to_owned(),
            amount: Amount::parse("1")?,
            purpose: None,
        })
    }

    const ADDR: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn whitelist_admits_only_matches() -> Result<(), Box<dyn std::error::Error>> {
        let guard = RecipientGuard::whitelist(vec![ADDR.to_owned()]);
        assert!(guard.check(&ctx(ADDR)?).allowed);
        assert!(!guard.check(&ctx("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")?).allowed);
        Ok(())
    }

    #[test]
    fn blacklist_blocks_matches() -> Result<(), Box<dyn std::error::Error>> {
        let guard = RecipientGuard::blacklist(vec![ADDR.to_owned()]);
        assert!(!guard.check(&ctx(ADDR)?).allowed);
        assert!(guard.check(&ctx("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")?).allowed);
        Ok(())
    }

    #[test]
    fn domains_match_url_hosts_only() -> Result<(), Box<dyn std::error::Error>> {
        let guard = RecipientGuard {
            mode: RecipientMode::Whitelist,
            addresses: Vec::new(),
            domains: vec!["example.com".to_owned()],
            patterns: Vec::new(),
        };
        assert!(guard.check(&ctx("https://api.example.com/tool?q=1")?).allowed);
        assert!(!guard.check(&ctx("https://example.org/example.com")?).allowed);
        Ok(())
    }

    #[test]
    fn patterns_match_whole_recipient() -> Result<(), Box<dyn std::error::Error>> {
        let guard = RecipientGuard {
            mode: RecipientMode::Blacklist,
            addresses: Vec::new(),
            domains: Vec::new(),
            patterns: vec!["^0xdead".to_owned()],
        };
        assert!(!guard.check(&ctx("0xdeadaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")?).allowed);
        assert!(guard.check(&ctx(ADDR)?).allowed);
        Ok(())
    }

    #[test]
    fn bad_patterns_fail_validation() {
        let guard = RecipientGuard {
            mode: RecipientMode::Whitelist,
            addresses: Vec::new(),
            domains: Vec::new(),
            patterns: vec!["[unclosed".to_owned()],
        };
        assert!(guard.validate().is_err());
    }
}
