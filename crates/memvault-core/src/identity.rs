//! Identities and the credentials they present.
//!
//! Identities are configured in the policy document, never self-registered.
//! Each has a class (what it may do) and a trust tier (how much risk its
//! tokens carry).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Identity class. Selects the [`ClassPolicy`](crate::policy::ClassPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityClass {
    Primary,
    Persona,
    Plugin,
    External,
    System,
}

impl IdentityClass {
    pub const ALL: [Self; 5] = [
        Self::Primary,
        Self::Persona,
        Self::Plugin,
        Self::External,
        Self::System,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Persona => "persona",
            Self::Plugin => "plugin",
            Self::External => "external",
            Self::System => "system",
        }
    }
}

impl fmt::Display for IdentityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown identity class '{s}'"))
    }
}

/// How far an identity is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Untrusted,
    Basic,
    Trusted,
    Core,
}

impl TrustTier {
    #[must_use]
    pub fn risk(self) -> RiskLevel {
        match self {
            Self::Untrusted => RiskLevel::High,
            Self::Basic => RiskLevel::Elevated,
            Self::Trusted | Self::Core => RiskLevel::Low,
        }
    }
}

/// Risk carried by an identity's tokens; tightens TTL and usage at issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
}

/// A configured principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub class: IdentityClass,
    pub trust_tier: TrustTier,
    /// Hex SHA-256 of the identity's credential secret.
    pub secret_hash: String,
}

/// What a caller presents to obtain a token.
#[derive(Clone)]
pub struct Credentials {
    identity: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn trust_tiers_map_to_risk() {
        assert_eq!(TrustTier::Untrusted.risk(), RiskLevel::High);
        assert_eq!(TrustTier::Basic.risk(), RiskLevel::Elevated);
        assert_eq!(TrustTier::Trusted.risk(), RiskLevel::Low);
        assert_eq!(TrustTier::Core.risk(), RiskLevel::Low);
    }

    #[test]
    fn class_names_roundtrip() {
        for class in IdentityClass::ALL {
            assert_eq!(class.as_str().parse::<IdentityClass>().unwrap(), class);
        }
        assert!("admin".parse::<IdentityClass>().is_err());
        assert_eq!(
            serde_json::to_string(&IdentityClass::External).unwrap(),
            "\"external\""
        );
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("plugin-7", "s3cret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("plugin-7"));
        assert!(!rendered.contains("s3cret"));
    }
}
