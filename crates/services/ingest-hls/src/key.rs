//! Session key derivation and validation
//!
//! Every capture session is identified by the pair (user id, challenge number).
//! The key is rendered as `{user}_{challenge}` and is used verbatim as the
//! session's directory name, so both components are restricted to a
//! filesystem-safe alphabet.
//!
//! # Format
//!
//! ```text
//! user=u1, challenge=5  ->  u1_5
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite identity of a capture session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive a key from a user id and a challenge number
    ///
    /// # Errors
    ///
    /// Returns an error if either component is empty, too long, or contains
    /// characters outside `[A-Za-z0-9_-]`.
    pub fn new(user_id: &str, challenge_num: &str) -> Result<Self, KeyError> {
        validate_component("userId", user_id)?;
        validate_component("challengeNum", challenge_num)?;
        Ok(Self(format!("{}_{}", user_id, challenge_num)))
    }

    /// Key as a string slice (also the session directory name)
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

const MAX_COMPONENT_LEN: usize = 64;

fn validate_component(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        return Err(KeyError::Empty(field));
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(KeyError::TooLong(field));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(KeyError::InvalidCharacter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Errors that can occur when deriving a session key
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum KeyError {
    #[error("Missing required parameter: {0}")]
    Empty(&'static str),

    #[error("Parameter {0} exceeds 64 characters")]
    TooLong(&'static str),

    #[error("Parameter {field} contains unsupported characters: {value:?}")]
    InvalidCharacter { field: &'static str, value: String },
}
