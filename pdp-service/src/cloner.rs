//! Periodic upstream catalog cloning
//!
//! A clone pass pages through each configured root kind, resolves every
//! root's owning organization through its indirect references, and walks
//! the object tree depth-first, materializing each `href`-bearing child
//! into the cache. One savepoint transaction per root: a partial failure
//! rolls that root back and the pass moves on.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::ClonerConfig;
use crate::error::{GatewayError, Result};
use crate::kinds;
use crate::object::TmfObject;
use crate::store::{TmfCache, UpsertOutcome};
use crate::tree;
use crate::upstream::{CallContext, UpstreamClient};

/// Children deeper than this are left alone; catalog trees are shallow
const MAX_WALK_DEPTH: usize = 16;

/// Outcome counters of one clone pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloneStats {
    /// Root objects walked
    pub roots: u64,
    /// Rows written because they were new or their hash changed
    pub written: u64,
    /// Rows rewritten only because the freshness window had elapsed
    pub refreshed: u64,
    /// Rows skipped as fresh and identical
    pub unchanged: u64,
    /// Roots rolled back on error
    pub failed_roots: u64,
}

/// The cloner; a process has exactly one
pub struct Cloner {
    cache: TmfCache,
    upstream: UpstreamClient,
    config: ClonerConfig,
    /// Single-flight gate: at most one walk at a time, later attempts wait
    gate: Mutex<()>,
    stopping: AtomicBool,
}

impl Cloner {
    pub fn new(cache: TmfCache, upstream: UpstreamClient, config: ClonerConfig) -> Arc<Self> {
        Arc::new(Self {
            cache,
            upstream,
            config,
            gate: Mutex::new(()),
            stopping: AtomicBool::new(false),
        })
    }

    /// Ask a running walk to stop at the next root boundary
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    /// Run one clone pass over all configured roots
    pub async fn run_once(&self) -> Result<CloneStats> {
        let _walk = self.gate.lock().await;
        let started = Instant::now();
        tracing::info!(roots = ?self.config.roots, "clone pass starting");

        let mut stats = CloneStats::default();
        for resource in &self.config.roots {
            if self.stopping.load(Ordering::Relaxed) {
                tracing::info!("clone pass stopping at root boundary");
                break;
            }
            if let Err(e) = self.clone_root_kind(resource, &mut stats).await {
                tracing::warn!(resource, "cloning root kind failed: {e}");
            }
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            roots = stats.roots,
            written = stats.written,
            refreshed = stats.refreshed,
            unchanged = stats.unchanged,
            failed = stats.failed_roots,
            "clone pass finished"
        );
        Ok(stats)
    }

    /// Fire once at startup, then on the configured period
    pub fn spawn_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cloner = self.clone();
        let period = Duration::from_secs(self.config.period_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if cloner.stopping.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = cloner.run_once().await {
                    tracing::error!("scheduled clone pass failed: {e}");
                }
            }
        })
    }

    /// Page one root kind until the upstream returns an empty page
    async fn clone_root_kind(&self, resource: &str, stats: &mut CloneStats) -> Result<()> {
        let api = kinds::api_family(resource).ok_or_else(|| {
            GatewayError::Internal(format!("root kind {resource:?} has no API family"))
        })?;
        let statuses = root_statuses(resource);
        let page_size = self.config.page_size;
        let ctx = CallContext::default();

        let mut offset: u32 = 0;
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return Ok(());
            }
            let page = self
                .upstream
                .list_page(
                    api,
                    resource,
                    &[
                        ("limit", page_size.to_string()),
                        ("offset", offset.to_string()),
                        ("lifecycleStatus", statuses.to_string()),
                    ],
                    &ctx,
                )
                .await?;
            if page.is_empty() {
                return Ok(());
            }
            offset += page.len() as u32;

            for root in page {
                stats.roots += 1;
                if let Err(e) = self.clone_root(root, stats).await {
                    stats.failed_roots += 1;
                    tracing::warn!(resource, "root rolled back: {e}");
                }
            }
        }
    }

    /// Walk one root inside its own transaction
    async fn clone_root(&self, root: Value, stats: &mut CloneStats) -> Result<()> {
        let mut obj = TmfObject::from_value(root)?;
        let mut tx = self.cache.begin().await?;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(obj.id.clone());

        // Owner first, so the root and its children are stamped before
        // they are written.
        let owner = self.resolve_owner(&obj).await?;
        if let Some(ref owner) = owner {
            if let Some(org_obj) = &owner.organization_object {
                visited.insert(org_obj.id.clone());
                count(self.cache.upsert_tx(&mut tx, org_obj).await?, stats);
            }
            obj.stamp("organizationIdentifier", &owner.identifier);
            obj.stamp("organization", &owner.organization);
        }

        count(self.cache.upsert_tx(&mut tx, &obj).await?, stats);

        let content = obj.content.clone();
        self.walk_children(&mut tx, &content, &mut visited, stats, 0)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Depth-first walk: fetch, write and recurse into every nested
    /// object carrying an `href`, once per root walk
    fn walk_children<'a>(
        &'a self,
        tx: &'a mut sqlx::Transaction<'static, sqlx::Sqlite>,
        node: &'a Value,
        visited: &'a mut HashSet<String>,
        stats: &'a mut CloneStats,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth >= MAX_WALK_DEPTH {
                return Ok(());
            }
            match node {
                Value::Array(items) => {
                    for item in items {
                        self.walk_children(tx, item, visited, stats, depth + 1).await?;
                    }
                }
                Value::Object(map) => {
                    let href = map.get("href").and_then(Value::as_str).unwrap_or("");
                    if kinds::is_valid_id(href) && visited.insert(href.to_string()) {
                        match self.fetch_object(href).await {
                            Ok(child) => {
                                count(self.cache.upsert_tx(tx, &child).await?, stats);
                                let content = child.content.clone();
                                self.walk_children(tx, &content, visited, stats, depth + 1)
                                    .await?;
                            }
                            Err(e) => {
                                tracing::debug!(href, "child not materialized: {e}");
                            }
                        }
                    }
                    for value in map.values() {
                        self.walk_children(tx, value, visited, stats, depth + 1).await?;
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    async fn fetch_object(&self, href: &str) -> Result<TmfObject> {
        let value = self
            .upstream
            .get_by_href(href, &CallContext::default())
            .await?;
        TmfObject::from_value(value)
    }

    /// Resolve the owning organization of a root object
    ///
    /// Offerings point at their product specification, whose owner
    /// related-party leads to the organization; catalogs carry the owner
    /// related-party directly. The organization's `externalReference`
    /// entry of type `idm_id` names the identity.
    async fn resolve_owner(&self, obj: &TmfObject) -> Result<Option<ResolvedOwner>> {
        let owner_href = match obj.kind.as_str() {
            "productOffering" => {
                let spec_href = tree::lookup_string(&obj.content, "productSpecification.href");
                if spec_href.is_empty() {
                    return Ok(None);
                }
                let spec = self
                    .upstream
                    .get_by_href(&spec_href, &CallContext::default())
                    .await?;
                owner_party_href(&spec)
            }
            "catalog" => owner_party_href(&obj.content),
            _ => None,
        };
        let Some(owner_href) = owner_href else {
            return Ok(None);
        };

        let org_value = self
            .upstream
            .get_by_href(&owner_href, &CallContext::default())
            .await?;
        let Some(identifier) = idm_reference(&org_value) else {
            return Ok(None);
        };
        let organization = tree::lookup_string(&org_value, "id");

        let organization_object = match TmfObject::from_value(org_value) {
            Ok(mut org_obj) => {
                org_obj.stamp("organizationIdentifier", &identifier);
                org_obj.stamp("organization", &organization);
                Some(org_obj)
            }
            Err(e) => {
                tracing::debug!(href = owner_href, "owner object not cacheable: {e}");
                None
            }
        };

        Ok(Some(ResolvedOwner {
            identifier,
            organization,
            organization_object,
        }))
    }
}

struct ResolvedOwner {
    /// `did:elsi:` identity from the idm_id reference
    identifier: String,
    /// Id of the owning organization object
    organization: String,
    /// The organization itself, stamped, for write-through
    organization_object: Option<TmfObject>,
}

fn count(outcome: UpsertOutcome, stats: &mut CloneStats) {
    match outcome {
        UpsertOutcome::Inserted | UpsertOutcome::Updated => stats.written += 1,
        UpsertOutcome::Refreshed => stats.refreshed += 1,
        UpsertOutcome::Unchanged => stats.unchanged += 1,
    }
}

/// Upstream list statuses per root kind
fn root_statuses(resource: &str) -> &'static str {
    match resource {
        "catalog" => "Launched,Active",
        _ => "Launched",
    }
}

/// `relatedParty[role=owner].href`, case-insensitive on the role
fn owner_party_href(value: &Value) -> Option<String> {
    let parties = value.get("relatedParty")?.as_array()?;
    parties.iter().find_map(|party| {
        let role = party.get("role").and_then(Value::as_str).unwrap_or("");
        if role.eq_ignore_ascii_case("owner") {
            party
                .get("href")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        }
    })
}

/// First `externalReference[*]` name with `externalReferenceType=idm_id`
fn idm_reference(value: &Value) -> Option<String> {
    let refs = value.get("externalReference")?.as_array()?;
    refs.iter().find_map(|r| {
        let ty = r
            .get("externalReferenceType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if ty.eq_ignore_ascii_case("idm_id") {
            r.get("name").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    })
}
