//! Identifiers for upstream sources and clients

use std::hash::{Hash, Hasher};

use url::Url;

/// Upstream source identifier
///
/// The raw URL string a client asked for. Two identifiers are the same
/// source only when the strings match exactly.
#[derive(Debug, Clone)]
pub struct SourceId {
    raw: String,
    url: Url,
}

impl SourceId {
    /// Validate and wrap a source identifier
    ///
    /// Accepts a non-empty absolute URL without whitespace.
    pub fn parse(raw: &str) -> Result<Self, InvalidSourceId> {
        if raw.is_empty() {
            return Err(InvalidSourceId::new(raw, "identifier is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(InvalidSourceId::new(raw, "identifier contains whitespace"));
        }

        let url = Url::parse(raw).map_err(|e| InvalidSourceId::new(raw, e.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            url,
        })
    }

    /// The identifier as received
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed form of the identifier
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URL scheme, e.g. `rtsp`
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }
}

impl PartialEq for SourceId {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for SourceId {}

impl Hash for SourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for SourceId {
    type Err = InvalidSourceId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Rejected source identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid source identifier {input:?}: {reason}")]
pub struct InvalidSourceId {
    pub input: String,
    pub reason: String,
}

impl InvalidSourceId {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.chars().take(256).collect(),
            reason: reason.into(),
        }
    }
}

/// Process-unique client connection id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
