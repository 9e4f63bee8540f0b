pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod redis;
pub mod schema;
pub mod store;
pub mod types;

pub use config::{Config, MessagingConfig, TransportKind};
pub use context::ChatContext;
pub use db::DbPool;
pub use error::{ChatError, ChatResult};
pub use crate::redis::RedisPool;
pub use store::{Appended, ChatStore};
pub use types::*;
