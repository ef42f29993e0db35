//! Credential values for outbound connections
//!
//! A [`Secret`] never prints its value through `Debug`, and resolves the
//! `env:VAR` and `{env.VAR}` indirections used in configuration files.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A bind credential or keystore password.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a literal value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Whether the configured value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve environment indirections and return the plain value.
    ///
    /// - `env:VAR`: the whole value comes from `VAR`
    /// - `{env.VAR}`: each placeholder is replaced in place
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a referenced variable is not set.
    pub fn expose(&self) -> Result<String> {
        if let Some(var) = self.0.strip_prefix("env:") {
            return std::env::var(var)
                .map_err(|_| Error::Config(format!("Environment variable '{var}' is not set")));
        }

        let mut resolved = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find("{env.") {
            resolved.push_str(&rest[..start]);
            let after = &rest[start + 5..];
            let Some(end) = after.find('}') else {
                resolved.push_str(&rest[start..]);
                return Ok(resolved);
            };
            let var = &after[..end];
            let value = std::env::var(var)
                .map_err(|_| Error::Config(format!("Environment variable '{var}' is not set")))?;
            resolved.push_str(&value);
            rest = &after[end + 1..];
        }
        resolved.push_str(rest);
        Ok(resolved)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}
