pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use models::*;
pub use request::{
    conversation_fingerprint, is_thinking_capable, resolve_model_route, transform_request,
    RoutedRequest,
};
pub use response::{harvest_signatures, translate_response};
pub use streaming::create_message_stream;
