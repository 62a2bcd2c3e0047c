pub mod handlers;
pub mod mappers;
pub mod pool;
pub mod providers;
pub mod server;
pub mod signature_store;
pub mod state;
pub mod upstream;

pub use pool::{AccountPool, PoolEvent};
pub use signature_store::SignatureStore;
pub use state::AppState;
pub use upstream::UpstreamDispatcher;
