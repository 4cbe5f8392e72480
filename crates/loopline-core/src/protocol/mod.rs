//! Wire protocol: message shapes and length-prefixed framing.
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many bytes of UTF-8 JSON:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests and responses use the same envelope; only the JSON schema differs.

pub mod frame;
pub mod types;

pub use frame::Framer;
pub use types::{ErrorBody, Method, Request, Response};
