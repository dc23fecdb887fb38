//! Application state shared across handlers

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::policy::PolicyEngine;
use crate::store::TmfCache;
use crate::token::{KeyFetcher, OpenIdKeyFetcher, TokenVerifier};
use crate::upstream::UpstreamClient;

/// Shared state handed to every handler
///
/// All members are cheap to clone; the heavyweight parts live behind
/// their own `Arc`s or internal pools.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: TmfCache,
    pub engine: Arc<PolicyEngine>,
    pub upstream: UpstreamClient,
    pub verifier: TokenVerifier,
}

impl AppState {
    /// Wire up production collaborators from configuration
    ///
    /// The token key is fetched once, here; a failing issuer fails
    /// startup rather than every request.
    pub async fn from_config(config: Config) -> Result<Self> {
        let cache = TmfCache::open(&config.database.path, &config.database).await?;
        let engine = Arc::new(PolicyEngine::new(&config.policy)?);
        let upstream = UpstreamClient::new(&config.upstream)?;
        let fetcher = OpenIdKeyFetcher::new(&config.token.issuer)?;
        let verifier = TokenVerifier::from_fetcher(&fetcher).await?;
        Ok(Self {
            config: Arc::new(config),
            cache,
            engine,
            upstream,
            verifier,
        })
    }

    /// Assemble state from prebuilt collaborators; used by tests and the
    /// sync tool, which injects its own key source
    pub async fn with_parts(
        config: Config,
        cache: TmfCache,
        engine: Arc<PolicyEngine>,
        upstream: UpstreamClient,
        fetcher: &dyn KeyFetcher,
    ) -> Result<Self> {
        let verifier = TokenVerifier::from_fetcher(fetcher).await?;
        Ok(Self {
            config: Arc::new(config),
            cache,
            engine,
            upstream,
            verifier,
        })
    }
}
