//! authgate: OAuth2 sign-in for command line tools
//!
//! This library provides:
//! - Credential lifecycle management with proactive refresh
//! - Browser login completed through a loopback callback listener
//! - File-backed credential persistence
//! - The `authgate` CLI transport

pub mod auth;
pub mod config;
pub mod transport;

pub use auth::{AuthError, AuthManager, Credential};
pub use config::Config;
