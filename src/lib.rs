// Scribe Gate Library

pub mod api;
pub mod auth;
pub mod authz;
pub mod clock;
pub mod components;
pub mod config;
pub mod crypto;
pub mod db;
pub mod domain;
pub mod errors;
pub mod external;
pub mod failsafe;
pub mod monitor;
pub mod observability;
pub mod rate_limit;
pub mod redis;
pub mod store;
pub mod users;

pub use components::{Collaborators, Components};
pub use config::Config;
pub use errors::{AppError, Result};
