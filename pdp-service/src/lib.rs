//! Authorization gateway for federated TMF marketplace APIs
//!
//! The gateway sits between HTTP clients and the upstream resource
//! services. For every proxied request it verifies the bearer credential,
//! consults a local SQLite mirror of the target object, evaluates a
//! scripted policy to a boolean verdict, relays authorized operations
//! upstream and keeps the mirror consistent. A scheduled cloner walks the
//! upstream catalog to pre-materialize objects and their owners.
//!
//! Subsystems:
//! - [`store`]: the resource object cache (SQLite, hash-ordered lists)
//! - [`upstream`]: typed client over the upstream resource APIs
//! - [`cloner`]: the periodic catalog walk
//! - [`token`]: JWKS-backed bearer token verification
//! - [`policy`]: the sandboxed policy engine
//! - [`orchestrator`]: LIST/READ/CREATE/UPDATE pipelines
//! - [`routes`] and [`server`]: the HTTP surface

pub mod cloner;
pub mod config;
pub mod error;
pub mod input;
pub mod kinds;
pub mod object;
pub mod orchestrator;
pub mod policy;
pub mod request;
pub mod routes;
pub mod server;
pub mod state;
pub mod store;
pub mod token;
pub mod tree;
pub mod upstream;

pub use config::{Config, Environment};
pub use error::{GatewayError, Result};
pub use state::AppState;

/// Install the process-wide tracing subscriber
///
/// The filter comes from `RUST_LOG` when set, from the configured level
/// otherwise.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(filter).init();
}
