//! HTTP dispatch surface.
//!
//! Thin glue over the stores and the invocation engine: routes, request
//! parsing, response framing, and error → status mapping. Every response is
//! `application/json; charset=utf-8` except `/health`. Each request gets a
//! synthetic id carried through the logs.

use crate::assets::{AssetStore, mint_id, parse_manifest, resolve_manifest};
use crate::constants::DISPATCH_TIMEOUT_MILLIS;
use crate::engine::{InvocationRequest, Invoker};
use crate::error::Error;
use crate::resources::{CreateResource, ResourceRecord, ResourceStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::http::header::{CONTENT_TYPE, HeaderValue};
use warp::{Filter, Rejection, Reply};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub assets: Arc<AssetStore>,
    pub resources: Arc<ResourceStore>,
    pub invoker: Arc<Invoker>,
    /// Directory `sourceFile` manifest references resolve against.
    pub manifest_root: PathBuf,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionSummary {
    id: String,
    language_id: String,
    function_name: String,
    js_eval_as_module: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSummary {
    id: String,
    #[serde(rename = "type")]
    resource_type: String,
    owners: Vec<String>,
}

impl From<&ResourceRecord> for ResourceSummary {
    fn from(record: &ResourceRecord) -> Self {
        Self {
            id: record.id.clone(),
            resource_type: record.resource_type.to_string(),
            owners: record.owners.iter().cloned().collect(),
        }
    }
}

// =============================================================================
// Routes
// =============================================================================

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn with_request_id() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::any().map(mint_id)
}

/// Builds the full route tree.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .map(|| "OK");

    let create_function = warp::post()
        .and(warp::path("functions"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and(with_request_id())
        .and(warp::body::bytes())
        .and_then(create_function);

    let list_functions = warp::get()
        .and(warp::path("functions"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and_then(list_functions);

    let invoke = warp::post()
        .and(warp::path("invoke"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and(with_request_id())
        .and(warp::body::bytes())
        .and_then(invoke_function);

    // POST /invoke with no id is a client error, not an unknown route.
    let invoke_missing_id = warp::post()
        .and(warp::path("invoke"))
        .and(warp::path::end())
        .map(|| error_reply(StatusCode::BAD_REQUEST, "missing function id"));

    let create_resource = warp::post()
        .and(warp::path("resources"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and(with_request_id())
        .and(warp::body::bytes())
        .and_then(create_resource);

    let list_resources = warp::get()
        .and(warp::path("resources"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and_then(list_resources);

    let attach_owner = warp::post()
        .and(warp::path("resources"))
        .and(warp::path::param::<String>())
        .and(warp::path("owners"))
        .and(warp::path::end())
        .and(with_state(state.clone()))
        .and(with_request_id())
        .and(warp::body::bytes())
        .and_then(attach_owner);

    health
        .or(create_function)
        .or(list_functions)
        .or(invoke)
        .or(invoke_missing_id)
        .or(create_resource)
        .or(list_resources)
        .or(attach_owner)
        .recover(handle_rejection)
}

/// Serves the route tree until the process exits.
pub async fn serve(state: AppState, port: u16) {
    info!(port, "faasrun listening");
    warp::serve(routes(state)).run(([0, 0, 0, 0], port)).await;
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_function(
    state: AppState,
    request_id: String,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let text = match std::str::from_utf8(&body) {
        Ok(text) => text,
        Err(_) => {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                "manifest must be UTF-8 text",
            ));
        }
    };

    let outcome = parse_manifest(text)
        .and_then(|manifest| resolve_manifest(&state.manifest_root, &manifest))
        .and_then(|asset| {
            state.assets.save(&asset)?;
            Ok(asset)
        });

    match outcome {
        Ok(asset) => {
            info!(request_id, id = %asset.id, "function uploaded");

            #[derive(Serialize)]
            #[serde(rename_all = "camelCase")]
            struct Created {
                id: String,
                language_id: String,
                function_name: String,
                js_eval_as_module: bool,
                dependencies: Vec<String>,
            }
            let created = Created {
                id: asset.id.clone(),
                language_id: asset.language_id.to_string(),
                function_name: asset.function_name.clone(),
                js_eval_as_module: asset.js_eval_as_module,
                dependencies: asset.dependencies.keys().cloned().collect(),
            };
            Ok(json_reply(StatusCode::CREATED, &created))
        }
        Err(e) => {
            warn!(request_id, error = %e, "function upload rejected");
            Ok(error_reply(error_status(&e), &e.to_string()))
        }
    }
}

async fn list_functions(state: AppState) -> Result<warp::reply::Response, Infallible> {
    match state.assets.list() {
        Ok(assets) => {
            let summaries: Vec<FunctionSummary> = assets
                .iter()
                .map(|asset| FunctionSummary {
                    id: asset.id.clone(),
                    language_id: asset.language_id.to_string(),
                    function_name: asset.function_name.clone(),
                    js_eval_as_module: asset.js_eval_as_module,
                })
                .collect();
            Ok(json_reply(StatusCode::OK, &summaries))
        }
        Err(e) => {
            error!(error = %e, "listing functions failed");
            Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

async fn invoke_function(
    id: String,
    state: AppState,
    request_id: String,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let asset = match state.assets.load(&id) {
        Ok(Some(asset)) => asset,
        Ok(None) => {
            return Ok(error_reply(
                StatusCode::NOT_FOUND,
                &format!("function not found: {id}"),
            ));
        }
        Err(e) => {
            error!(request_id, error = %e, "asset load failed");
            return Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()));
        }
    };

    // Empty or malformed bodies invoke with an empty event.
    let event: Map<String, Value> = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let platform = match state.resources.platform_for_function(&id) {
        Ok(platform) => platform,
        Err(e) => {
            error!(request_id, error = %e, "platform assembly failed");
            return Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()));
        }
    };

    let request = InvocationRequest {
        language_id: asset.language_id,
        source_code: asset.source_code,
        function_name: asset.function_name,
        event,
        files: Vec::new(),
        dependencies: asset.dependencies,
        js_eval_as_module: asset.js_eval_as_module,
        timeout_millis: DISPATCH_TIMEOUT_MILLIS,
        enable_network: true,
        platform: Some(platform),
    };

    info!(request_id, function = %id, "dispatching invocation");
    match state.invoker.invoke(request).await {
        Ok(result) => Ok(json_reply(StatusCode::OK, &result)),
        Err(e) => {
            warn!(request_id, function = %id, error = %e, "invocation failed");
            Ok(error_reply(error_status(&e), &e.to_string()))
        }
    }
}

async fn create_resource(
    state: AppState,
    request_id: String,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    let request: CreateResource = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                &Error::InvalidJson(e.to_string()).to_string(),
            ));
        }
    };

    match state.resources.create(request) {
        Ok(record) => {
            info!(request_id, id = %record.id, "resource created");
            Ok(json_reply(StatusCode::CREATED, &ResourceSummary::from(&record)))
        }
        Err(e) => {
            warn!(request_id, error = %e, "resource creation failed");
            Ok(error_reply(error_status(&e), &e.to_string()))
        }
    }
}

async fn list_resources(state: AppState) -> Result<warp::reply::Response, Infallible> {
    match state.resources.list() {
        Ok(records) => {
            let summaries: Vec<ResourceSummary> =
                records.iter().map(ResourceSummary::from).collect();
            Ok(json_reply(StatusCode::OK, &summaries))
        }
        Err(e) => {
            error!(error = %e, "listing resources failed");
            Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

async fn attach_owner(
    resource_id: String,
    state: AppState,
    request_id: String,
    body: Bytes,
) -> Result<warp::reply::Response, Infallible> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct AttachOwner {
        function_id: String,
    }

    let request: AttachOwner = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Ok(error_reply(
                StatusCode::BAD_REQUEST,
                &Error::InvalidJson(e.to_string()).to_string(),
            ));
        }
    };

    match state.resources.attach_owner(&resource_id, &request.function_id) {
        Ok(record) => {
            info!(request_id, resource = %record.id, function = %request.function_id, "owner attached");
            Ok(json_reply(StatusCode::OK, &ResourceSummary::from(&record)))
        }
        Err(e) => {
            warn!(request_id, error = %e, "owner attach failed");
            Ok(error_reply(error_status(&e), &e.to_string()))
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

fn json_reply<T: Serialize>(status: StatusCode, value: &T) -> warp::reply::Response {
    let mut response = warp::reply::with_status(warp::reply::json(value), status).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
    json_reply(
        status,
        &ErrorBody {
            error: message.to_string(),
        },
    )
}

/// Maps an error kind to the response status.
fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::InvalidManifest(_)
        | Error::InvalidJson(_)
        | Error::UnknownLanguage(_)
        | Error::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        Error::RecordNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_rejection(rejection: Rejection) -> Result<warp::reply::Response, Infallible> {
    if rejection.is_not_found() {
        return Ok(error_reply(StatusCode::NOT_FOUND, "not found"));
    }
    if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(error_reply(StatusCode::BAD_REQUEST, "payload too large"));
    }
    error!(?rejection, "unhandled rejection");
    Ok(error_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&Error::InvalidManifest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&Error::UnknownLanguage("cobol".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&Error::RecordNotFound("r".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&Error::InvocationTimeout { millis: 5 }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&Error::EgressDenied { reason: "x".into() }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
