//! Frontgate - serves a pre-built web bundle and forwards an API prefix to a backend
//!
//! This library provides a small front-end process that:
//! - Serves files from a static directory with a single-page fallback to `index.html`
//! - Forwards every request under a path prefix (`/api` by default) to a backend URL
//! - Answers with a JSON 500 when the backend cannot be reached
//! - Optionally spawns the backend as a child process and kills it on SIGINT/SIGTERM

pub mod config;
pub mod error;
pub mod launcher;
pub mod mime;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod static_files;

/// Version information for the front-end
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
