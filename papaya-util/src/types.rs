use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::Deref;

// Tokens only show a short prefix when debug-printed so they can be traced
// without leaking into logs.
fn redact(token: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let prefix: String = token.chars().take(4).collect();
    write!(f, "{prefix}***")
}

/// Bearer token used to authenticate with the management REST API.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct BearerToken(String);

impl Deref for BearerToken {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        redact(&self.0, f)
    }
}

impl Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BearerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BearerToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Per-device access token. It is the only identity the device presents
/// when publishing telemetry.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl Deref for AccessToken {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        redact(&self.0, f)
    }
}

impl Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AccessToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AccessToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<AccessToken> for String {
    fn from(value: AccessToken) -> Self {
        value.0
    }
}
