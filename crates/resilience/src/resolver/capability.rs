use crate::models::{CapabilityName, Payload, ProviderId};

/// One step of a fallback chain: which provider, and which of its
/// endpoints serves the capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainLink {
    pub provider_id: ProviderId,
    pub endpoint: String,
}

impl ChainLink {
    pub fn new(provider_id: impl Into<ProviderId>, endpoint: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// What happens when every provider in a chain fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Criticality {
    /// Core data. Exhaustion is an error for the calling phase.
    Critical,
    /// Exhaustion degrades to this conservative default, tagged `"default"`.
    NonCritical { default: Payload },
}

/// A logical capability ("VIX", "OPTIONS_CHAIN") and its ordered provider chain.
///
/// ```
/// use quantflow_resilience::resolver::Capability;
///
/// let vix = Capability::non_critical("VIX", b"20.0".to_vec())
///     .via("POLYGON", "v2/aggs/ticker/I:VIX/prev")
///     .via("FRED", "series/observations");
/// assert_eq!(vix.links.len(), 2);
/// assert!(!vix.is_critical());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub name: CapabilityName,
    pub links: Vec<ChainLink>,
    pub criticality: Criticality,
}

impl Capability {
    pub fn critical(name: impl Into<CapabilityName>) -> Self {
        Self {
            name: name.into(),
            links: Vec::new(),
            criticality: Criticality::Critical,
        }
    }

    pub fn non_critical(name: impl Into<CapabilityName>, default: Payload) -> Self {
        Self {
            name: name.into(),
            links: Vec::new(),
            criticality: Criticality::NonCritical { default },
        }
    }

    /// Append a provider to the end of the chain.
    pub fn via(mut self, provider_id: impl Into<ProviderId>, endpoint: impl Into<String>) -> Self {
        self.links.push(ChainLink::new(provider_id, endpoint));
        self
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.criticality, Criticality::Critical)
    }
}
