pub mod auth;
pub mod error;
pub mod handlers;
pub mod server;
pub mod sse;
pub mod websocket;

pub use server::{router, run, ApiState};
