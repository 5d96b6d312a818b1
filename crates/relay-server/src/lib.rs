pub mod error;
pub mod handlers;
pub mod health;
pub mod request;
pub mod server;
pub mod wire;

pub use error::ApiError;
pub use request::RequestDefaults;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
