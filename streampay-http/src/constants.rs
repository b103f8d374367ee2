//! HTTP-specific constants for streaming payment negotiation.

/// Header carrying base64-encoded payment terms (server → client).
pub const STREAM_TERMS_HEADER: &str = "Payment-Stream-Terms";

/// Header carrying the stream id as a decimal string (client → server).
pub const STREAM_ID_HEADER: &str = "Payment-Stream-Id";

/// CORS header name for exposing custom headers.
pub const ACCESS_CONTROL_EXPOSE_HEADERS: &str = "Access-Control-Expose-Headers";

/// How much streaming time a negotiator funds per stream by default.
pub const DEFAULT_FUNDING_DURATION_SECS: u64 = 3_600;
