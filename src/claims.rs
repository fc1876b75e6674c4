//! Plain `{type, value}` claim pairs.
//!
//! The broker never stores a framework-native "security principal" type in
//! the cache — only this shape, so every cache entry round-trips cleanly
//! through JSON. `NameIdentifier` is the claim type that carries the
//! resolved local user id (or, failing resolution, the raw upstream sub).

use serde::{Deserialize, Serialize};

pub const NAME_IDENTIFIER: &str = "NameIdentifier";
pub const EMAIL: &str = "Email";
pub const NAME: &str = "Name";
pub const GIVEN_NAME: &str = "GivenName";
pub const SURNAME: &str = "Surname";
pub const PICTURE: &str = "picture";
pub const PROVIDER: &str = "provider";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// A list of claims with lookup-by-type and in-place replace helpers, since
/// the callback handler needs to find and overwrite `NameIdentifier`
/// without disturbing the rest of the set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimSet(pub Vec<Claim>);

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, claim_type: impl Into<String>, value: impl Into<String>) {
        self.0.push(Claim::new(claim_type, value));
    }

    pub fn get(&self, claim_type: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|c| c.claim_type == claim_type)
            .map(|c| c.value.as_str())
    }

    /// Replaces the value of the first claim of `claim_type`, or appends a
    /// new one if none exists yet.
    pub fn set(&mut self, claim_type: &str, value: impl Into<String>) {
        if let Some(existing) = self.0.iter_mut().find(|c| c.claim_type == claim_type) {
            existing.value = value.into();
        } else {
            self.push(claim_type.to_string(), value);
        }
    }
}
