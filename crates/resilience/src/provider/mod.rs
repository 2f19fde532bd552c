//! Provider abstractions.
//!
//! This module contains:
//! - The [`DataProvider`] trait every source implements
//! - [`ProviderDescriptor`] and [`AuthStrategy`], the static description of a source
//! - [`HttpProvider`], a generic implementation driven by base URL + auth + parser
//!
//! The provider system is designed to be:
//! - **Provider-agnostic**: nothing in the orchestration layer knows a wire format
//! - **Extensible**: new sources implement `DataProvider` or configure an `HttpProvider`
//! - **Resilient**: breakers, retries, pacing and caching are applied by the registry
//!   and resolver, never by the provider itself

mod descriptor;
mod http;
mod traits;

pub use descriptor::{AuthStrategy, ProviderDescriptor};
pub use http::{classify_status, HttpProvider, JsonStatusParser, PassthroughParser, ResponseParser};
pub use traits::DataProvider;
