//! Data model shared by every component.
//!
//! - `types` - Type aliases for identifiers and payloads
//! - `request` - What a caller asks for ([`FetchParams`]) and what a provider receives ([`ProviderRequest`])
//! - `resolved` - A resolved value tagged with where it came from

mod request;
mod resolved;
mod types;

pub use request::{DateRange, FetchParams, ProviderRequest};
pub use resolved::{Resolved, SourceTag};
pub use types::{CapabilityName, Payload, ProviderId};
