//! Per-user client identity

use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;

/// Canonical per-user key, `n<user_id>`
///
/// Used verbatim as the PKI common name, the WireGuard peer tag, the Xray
/// user email and the artifact directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn from_user_id(user_id: i64) -> Self {
        Self(format!("n{}", user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric user id this identity was derived from
    pub fn user_id(&self) -> Option<i64> {
        self.0.strip_prefix('n')?.parse().ok()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClientIdentity {
    type Err = ProvisionError;

    /// Accepts `n<digits>` or a bare user id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('n').unwrap_or(s);
        digits
            .parse::<i64>()
            .map(Self::from_user_id)
            .map_err(|_| ProvisionError::Parse(format!("Invalid client identity: {:?}", s)))
    }
}
