//! Organization identity
//!
//! The tenant key binding a master record to its instance and its channel.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::{MasterError, MasterResult};

fn organization_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,62}$").expect("static pattern is valid")
    })
}

/// Validated organization name.
///
/// Usable as a DNS label fragment and as a certificate `O=` attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Organization(String);

impl Organization {
    /// Validate and wrap an organization name.
    pub fn new(name: impl Into<String>) -> MasterResult<Self> {
        let name = name.into();
        if organization_pattern().is_match(&name) {
            Ok(Self(name))
        } else {
            Err(MasterError::InvalidOrganization(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Organization {
    type Error = MasterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Organization> for String {
    fn from(org: Organization) -> Self {
        org.0
    }
}

impl AsRef<str> for Organization {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
