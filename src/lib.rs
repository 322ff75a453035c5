//! # Bifrost
//!
//! An embeddable HTTP reverse-proxy / API gateway with millisecond hot
//! reload and zero-downtime binary upgrade.
//!
//! ## Architecture
//!
//! ```text
//! Listener → Server → Engine (handler chain) → Init middleware →
//!   User middlewares → Router → Service → Upstream strategy → Proxy → Backend
//! ```
//!
//! ## Core Features
//!
//! - **Multi-protocol**: HTTP/1.1, HTTP/2 (ALPN) and H2C listeners
//! - **Load Balancing**: round-robin, weighted, random, consistent hashing
//! - **Middleware Chain**: strip/add prefix, regex path rewrite,
//!   Redis-backed rate limiting, embedder-registered kinds
//! - **Dynamic Upstreams**: `$variable`-bound upstream selection per request
//! - **Hot Reload**: atomic engine swap, no listener rebind
//! - **Zero-Downtime Upgrade**: listener fd inheritance across binaries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> bifrost::Result<()> {
//!     let bifrost = bifrost::Bifrost::load_from_config("./bifrost.yaml").await?;
//!     let handles = bifrost.start();
//!     bifrost::wait_for_signal().await;
//!     bifrost.shutdown().await;
//!     for handle in handles {
//!         let _ = handle.await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod bifrost;
pub mod config;
pub mod ctx;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod provider;
pub mod proxy;
pub mod router;
pub mod server;
pub mod service;
pub mod vars;
pub mod zero;

// Re-export main types
pub use bifrost::{wait_for_signal, Bifrost};
pub use ctx::{RequestContext, VarValue};
pub use engine::{Engine, Handler};
pub use error::{BifrostError, Result};
pub use middleware::register_middleware;
