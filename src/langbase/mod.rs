//! Langbase Pipes API client.
//!
//! The follow-up agent treats Langbase as an opaque text-completion service:
//! - [`LangbaseClient`] issues single pipe runs and upserts the follow-up pipe
//! - [`types`] holds the wire format for requests and responses

mod client;
mod types;


pub use client::LangbaseClient;
pub use types::*;
