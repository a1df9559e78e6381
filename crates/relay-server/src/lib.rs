pub mod error;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod stream;

pub use error::ApiError;
pub use registry::{SessionError, SessionRegistry, SessionStream, StreamEnd};
pub use server::{build_router, start, AppState, ProducerSlot, ServerConfig, ServerHandle};
