//! HTTP route table and handlers
//!
//! One router covers the proxied TMF surface, the pure-PDP verdict
//! endpoint, the admin file surface and the health probe. Handlers stay
//! thin: parse, delegate to the orchestrator or engine, shape the
//! response.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rand::seq::SliceRandom;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};
use crate::object::TmfObject;
use crate::orchestrator;
use crate::policy::PolicyError;
use crate::request::ProxiedRequest;
use crate::state::AppState;

/// Build the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/tmf-api/{api}/v4/{resource}",
            get(list_objects).post(create_object),
        )
        .route(
            "/tmf-api/{api}/v4/{resource}/{id}",
            get(read_object).patch(update_object),
        )
        .route("/authorize/v1/policies/authz", get(authorize_verdict))
        .route(
            "/adminapi/v1/file/{name}",
            get(admin_get_file).post(admin_put_file),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn read_object(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let req = ProxiedRequest::parse(&method, &uri, &headers, false)?;
    let obj = orchestrator::read(&state, &req).await?;
    Ok(([(header::ETAG, obj.etag())], Json(obj.content)).into_response())
}

async fn list_objects(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let req = ProxiedRequest::parse(&method, &uri, &headers, false)?;
    let objs = orchestrator::list(&state, &req).await?;

    // Present accepted results in a fresh random order; the stable cache
    // order is an implementation detail callers must not depend on.
    let mut contents: Vec<Value> = objs.into_iter().map(|o| o.content).collect();
    contents.shuffle(&mut rand::rng());

    let total = contents.len().to_string();
    Ok((
        [(header::HeaderName::from_static("x-total-count"), total)],
        Json(Value::Array(contents)),
    )
        .into_response())
}

async fn create_object(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let req = ProxiedRequest::parse(&method, &uri, &headers, false)?;
    let obj = orchestrator::create(&state, &req, &body).await?;
    let location = canonical_path(&req.api, &req.resource, &obj);
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (header::ETAG, obj.etag()),
        ],
        Json(obj.content),
    )
        .into_response())
}

async fn update_object(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let req = ProxiedRequest::parse(&method, &uri, &headers, false)?;
    let obj = orchestrator::update(&state, &req, &body).await?;
    Ok(([(header::ETAG, obj.etag())], Json(obj.content)).into_response())
}

/// Pure-PDP endpoint: 200 when the proxied READ would be served, the
/// matching error status otherwise
async fn authorize_verdict(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let req = ProxiedRequest::parse(&method, &uri, &headers, true)?;
    orchestrator::authorize_only(&state, &req).await?;
    Ok(Json(json!({"authorized": true})).into_response())
}

async fn admin_get_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let bytes = state.engine.get_policy(&name).map_err(|e| match e {
        PolicyError::NotFound(name) => {
            GatewayError::NotFound(format!("no policy file {name:?}"))
        }
        other => other.into(),
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    )
        .into_response())
}

async fn admin_put_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response> {
    state.engine.put_policy(&name, &body)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn canonical_path(api: &str, resource: &str, obj: &TmfObject) -> String {
    format!("/tmf-api/{api}/v4/{resource}/{}", obj.id)
}
