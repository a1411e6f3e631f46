//! Device identity: the 15-digit vendor-assigned identifier.
//!
//! Treated as an opaque string everywhere, but construction enforces the
//! exactly-15-ASCII-digits rule so a validated `Identity` can be trusted by
//! the connection table and the command router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity must be exactly 15 digits, got {0} characters")]
    Length(usize),
    #[error("identity contains a non-digit character")]
    NonDigit,
}

/// A validated 15-digit device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 15 {
            return Err(IdentityError::Length(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdentityError::NonDigit);
        }
        Ok(Identity(s.to_owned()))
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> String {
        id.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identity() {
        assert!("123456789012345".parse::<Identity>().is_ok());
    }

    #[test]
    fn fourteen_digits_rejected() {
        assert_eq!(
            "12345678901234".parse::<Identity>().unwrap_err(),
            IdentityError::Length(14)
        );
    }

    #[test]
    fn sixteen_digits_rejected() {
        assert_eq!(
            "1234567890123456".parse::<Identity>().unwrap_err(),
            IdentityError::Length(16)
        );
    }

    #[test]
    fn letters_rejected() {
        assert_eq!(
            "12345678901234a".parse::<Identity>().unwrap_err(),
            IdentityError::NonDigit
        );
    }
}
