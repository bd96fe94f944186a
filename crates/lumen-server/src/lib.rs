//! HTTP surface: synchronous and streaming chat endpoints plus health.

pub mod auth;
pub mod handlers;
pub mod server;

pub use auth::{Authenticator, HeaderAuthenticator, UNAUTHORIZED};
pub use handlers::AppState;
pub use server::{build_router, start, ServerConfig, ServerHandle};
