use std::borrow::Cow;

/// Provider identifier - mostly static constants ("POLYGON", "FRED", ...)
pub type ProviderId = Cow<'static, str>;

/// Logical capability name ("VIX", "OPTIONS_CHAIN", ...)
pub type CapabilityName = Cow<'static, str>;

/// Opaque response body. The resilience layer never interprets it.
pub type Payload = Vec<u8>;
