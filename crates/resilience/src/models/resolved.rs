use std::fmt;

use super::types::{Payload, ProviderId};

/// Where a resolved value came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceTag {
    /// Served by this provider, live or from its cache.
    Provider(ProviderId),
    /// Every provider failed and the capability's configured default was used.
    Default,
}

impl SourceTag {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provider(id) => id.as_ref(),
            Self::Default => "default",
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value returned by the fallback chain, tagged with its source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub value: Payload,
    pub source: SourceTag,
    /// True when the value was read from the file cache.
    pub from_cache: bool,
}

impl Resolved {
    pub fn live(value: Payload, provider: ProviderId) -> Self {
        Self {
            value,
            source: SourceTag::Provider(provider),
            from_cache: false,
        }
    }

    pub fn cached(value: Payload, provider: ProviderId) -> Self {
        Self {
            value,
            source: SourceTag::Provider(provider),
            from_cache: true,
        }
    }

    pub fn default_value(value: Payload) -> Self {
        Self {
            value,
            source: SourceTag::Default,
            from_cache: false,
        }
    }
}
