//! Request orchestration
//!
//! The four proxied operations share one pipeline: parse → verify token →
//! consult the cache (or upstream) → assemble the policy input → evaluate
//! → relay and write back. A false verdict never reaches the upstream and
//! never mutates the cache.

use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::input::build_input;
use crate::kinds;
use crate::object::{ensure_related_parties, TmfObject};
use crate::request::ProxiedRequest;
use crate::state::AppState;
use crate::store::ListFilter;
use crate::token;
use crate::upstream::CallContext;

/// Cache page pulled per iteration while filtering a LIST
const LIST_PAGE: i64 = 50;

/// Authorize and serve a single-object read
///
/// The object comes from the cache when present, from the upstream
/// otherwise (and is then written back).
pub async fn read(state: &AppState, req: &ProxiedRequest) -> Result<TmfObject> {
    require_known_resource(&req.resource)?;
    let claims = state.verifier.verify(req.authorization.as_deref())?;
    let id = req
        .id
        .as_deref()
        .ok_or_else(|| GatewayError::BadRequest("read without an id".into()))?;

    let obj = match state.cache.retrieve(id, None).await? {
        Some(obj) => obj,
        None => fetch_and_cache(state, req, id, &claims).await?,
    };

    let input = build_input(req, &claims, Some(&obj));
    if state.engine.decide(&state.config.policy.name, input)? {
        Ok(obj)
    } else {
        Err(GatewayError::NotAuthorized(format!(
            "read of {id} denied by policy"
        )))
    }
}

/// Authorize a list query, filtering candidates through the policy
///
/// The caller's `offset` skips *accepted* results and `limit` caps them;
/// the cache is paged independently underneath.
pub async fn list(state: &AppState, req: &ProxiedRequest) -> Result<Vec<TmfObject>> {
    require_known_resource(&req.resource)?;
    let claims = state.verifier.verify(req.authorization.as_deref())?;

    let filter = ListFilter::from_query(&req.query);
    let wanted = filter.limit;
    let skip = filter.offset;
    let candidates = filter.clone().without_paging();

    let mut results = Vec::new();
    let mut accepted: i64 = 0;
    let mut cache_offset: i64 = 0;

    'pages: loop {
        let batch = state
            .cache
            .list(
                &req.resource,
                &candidates.clone().with_paging(LIST_PAGE, cache_offset),
            )
            .await?;
        if batch.is_empty() {
            break;
        }
        cache_offset += batch.len() as i64;

        for obj in batch {
            let input = build_input(req, &claims, Some(&obj));
            let verdict = state.engine.decide(&state.config.policy.name, input)?;
            if !verdict {
                continue;
            }
            accepted += 1;
            // The offset applies after filtering: skip the first
            // `skip` accepted candidates.
            if accepted <= skip {
                continue;
            }
            results.push(obj);
            if results.len() as i64 >= wanted {
                break 'pages;
            }
        }
    }

    Ok(results)
}

/// Authorize and relay an object creation
pub async fn create(state: &AppState, req: &ProxiedRequest, body: &[u8]) -> Result<TmfObject> {
    require_known_resource(&req.resource)?;
    let claims = state.verifier.verify(req.authorization.as_deref())?;
    let org = require_writer(&claims)?;

    let mut payload: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("body is not JSON: {e}")))?;
    if !payload.is_object() {
        return Err(GatewayError::BadRequest("body is not a JSON object".into()));
    }

    match payload.get("id").and_then(Value::as_str) {
        None => {
            let minted = kinds::mint_id(&req.resource).ok_or_else(|| {
                GatewayError::BadRequest(format!("cannot mint an id for {:?}", req.resource))
            })?;
            payload["id"] = Value::String(minted);
        }
        Some(id) => {
            if !kinds::is_valid_id(id) {
                return Err(GatewayError::BadRequest(format!("malformed id {id:?}")));
            }
            if state.cache.retrieve(id, None).await?.is_some() {
                return Err(GatewayError::Conflict(format!("{id} already exists")));
            }
        }
    }

    ensure_related_parties(&mut payload, &org);

    let obj = TmfObject::from_value(payload)?;
    obj.validate_mandatory()?;

    let input = build_input(req, &claims, Some(&obj));
    if !state.engine.decide(&state.config.policy.name, input)? {
        return Err(GatewayError::NotAuthorized(format!(
            "creation of {} denied by policy",
            obj.id
        )));
    }

    let ctx = call_context(req, &org);
    let response = state
        .upstream
        .create(&req.api, &req.resource, &obj.content, &ctx)
        .await?;
    let created = TmfObject::from_value(response)?;
    state.cache.upsert(&created).await?;
    Ok(created)
}

/// Authorize and relay an object update
///
/// Beyond the policy, a hard rule applies: the caller's organization must
/// hold one of the object's four role positions.
pub async fn update(state: &AppState, req: &ProxiedRequest, body: &[u8]) -> Result<TmfObject> {
    require_known_resource(&req.resource)?;
    let claims = state.verifier.verify(req.authorization.as_deref())?;
    let org = require_writer(&claims)?;
    let id = req
        .id
        .as_deref()
        .ok_or_else(|| GatewayError::BadRequest("update without an id".into()))?;

    let existing = state
        .cache
        .retrieve(id, None)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("{id} is not cached")))?;

    if !existing.has_role(&org) {
        return Err(GatewayError::NotAuthorized(format!(
            "{org} holds no role on {id}"
        )));
    }

    let patch: Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("body is not JSON: {e}")))?;
    if !patch.is_object() {
        return Err(GatewayError::BadRequest("body is not a JSON object".into()));
    }

    let input = build_input(req, &claims, Some(&existing));
    if !state.engine.decide(&state.config.policy.name, input)? {
        return Err(GatewayError::NotAuthorized(format!(
            "update of {id} denied by policy"
        )));
    }

    let ctx = call_context(req, &org);
    let response = state
        .upstream
        .patch(&req.api, &req.resource, id, &patch, &ctx)
        .await?;
    let updated = TmfObject::from_value(response)?;
    state.cache.upsert(&updated).await?;
    Ok(updated)
}

/// Pure-PDP verdict: would a READ of the proxied request succeed?
pub async fn authorize_only(state: &AppState, req: &ProxiedRequest) -> Result<()> {
    read(state, req).await.map(|_| ())
}

/// Fetch an object from the upstream and write it through the cache
async fn fetch_and_cache(
    state: &AppState,
    req: &ProxiedRequest,
    id: &str,
    claims: &Value,
) -> Result<TmfObject> {
    let org = kinds::normalize_did(&token::organization_identifier(claims));
    let ctx = call_context(req, &org);
    let fetched = state
        .upstream
        .get_object(&req.api, &req.resource, id, &ctx)
        .await
        .map_err(|e| match e {
            GatewayError::Upstream { status: 404, .. } => {
                GatewayError::NotFound(format!("{id} not found upstream"))
            }
            other => other,
        })?;
    let obj = TmfObject::from_value(fetched)?;
    state.cache.upsert(&obj).await?;
    Ok(obj)
}

fn call_context(req: &ProxiedRequest, org: &str) -> CallContext {
    CallContext::new(
        req.authorization.clone().unwrap_or_default(),
        org.to_string(),
    )
}

fn require_known_resource(resource: &str) -> Result<()> {
    if kinds::kebab_kind(resource).is_none() {
        return Err(GatewayError::BadRequest(format!(
            "unknown resource {resource:?}"
        )));
    }
    Ok(())
}

/// Write verbs need a verified token with a non-empty organization
fn require_writer(claims: &Value) -> Result<String> {
    if !token::is_authenticated(claims) {
        return Err(GatewayError::NotAuthenticated(
            "write operations require a bearer token".into(),
        ));
    }
    let org = token::organization_identifier(claims);
    if org.is_empty() {
        return Err(GatewayError::InvalidToken(
            "token carries no organization identifier".into(),
        ));
    }
    Ok(kinds::normalize_did(&org))
}
