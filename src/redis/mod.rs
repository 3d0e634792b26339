pub mod client;
pub mod documents;

pub use client::{create_client, health_check};
pub use documents::RedisDocumentStore;
