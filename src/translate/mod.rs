//! Translation between the Anthropic Messages format and backend dialects.
//!
//! Requests go out through [`request::translate`], synchronous replies come
//! back through [`response::translate`] and streams through the decoders in
//! [`streaming`]. Nothing in here performs I/O.

pub mod anthropic_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
pub mod tokens;
