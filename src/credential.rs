//! Provider credential validation.
//!
//! A credential is accepted when it is 32 to 64 characters drawn from
//! `[A-Za-z0-9_-]`. The check is purely about shape: whether the provider
//! actually accepts the key is only known at the first external call.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static CREDENTIAL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{32,64}$").expect("credential pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Please add your OpenAI API key to continue.")]
    Empty,
    #[error("Please enter the correct API key.")]
    MalformedFormat,
}

/// A credential that passed [`validate_credential`].
///
/// The secret is only reachable through [`ValidCredential::expose`]; `Debug`
/// prints a redacted form so the key never ends up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidCredential(String);

impl ValidCredential {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Last four characters, for log lines and UI hints.
    pub fn hint(&self) -> String {
        // ASCII-only by construction, so byte slicing is safe.
        let start = self.0.len().saturating_sub(4);
        format!("…{}", &self.0[start..])
    }
}

impl fmt::Debug for ValidCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValidCredential").field(&self.hint()).finish()
    }
}

/// Check the shape of a user-supplied credential.
///
/// `None` and the empty string are [`CredentialError::Empty`]; anything else
/// that does not match the pattern is [`CredentialError::MalformedFormat`].
/// Surrounding whitespace is not trimmed: a pasted key with a trailing space
/// is malformed.
pub fn validate_credential(input: Option<&str>) -> Result<ValidCredential, CredentialError> {
    let input = match input {
        None | Some("") => return Err(CredentialError::Empty),
        Some(s) => s,
    };

    if CREDENTIAL_PATTERN.is_match(input) {
        Ok(ValidCredential(input.to_string()))
    } else {
        Err(CredentialError::MalformedFormat)
    }
}
