pub mod client;

pub use client::{extract_error_message, unwrap_response_envelope, UpstreamDispatcher};
