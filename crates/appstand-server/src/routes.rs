//! HTTP routes: the thin adapter over the registry core.
//!
//! Per space `{space}` the surface is the one the install clients expect:
//! app registration and version publication behind editor tokens, document
//! reads, channel-latest resolution and attachment serving, plus the
//! global editor directory. Version path parameters accept an optional
//! leading `v`. Document and attachment routes answer HEAD with the same
//! headers as GET and no body.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use appstand_core::auth::{verify_token, Editor};
use appstand_core::ingest::VersionOptions;
use appstand_core::registry::{App, AppOptions, AppsListOptions, AppsPage, Version};
use appstand_core::space::{Space, VirtualSpace};
use appstand_core::store::ObjectBlob;
use appstand_core::version::{strip_v_prefix, Channel};
use appstand_core::{Registry, RegistryError};

use crate::error::ApiError;

/// Request body ceiling; publish bodies are small JSON documents.
const MAX_BODY_SIZE: usize = 100 * 1024;

/// Bearer scheme on the Authorization header.
const TOKEN_SCHEME: &str = "Token ";

/// Token length cap before base64 decoding.
const MAX_TOKEN_LEN: usize = 1024;

const ONE_MINUTE: u64 = 60;
const ONE_HOUR: u64 = 3600;
const ONE_YEAR: u64 = 365 * 24 * 3600;

type AppState = Arc<Registry>;

/// Builds the router over an assembled registry.
///
/// `get` routes also receive HEAD requests; the document and attachment
/// handlers inspect the method and answer HEAD with headers only.
pub fn router(registry: AppState) -> Router {
    Router::new()
        .route("/editors", get(list_editors))
        .route("/editors/{editor}", get(get_editor))
        .route("/{space}/registry", post(create_app).get(get_apps_list))
        .route("/{space}/registry/{app}", post(create_version).get(get_app))
        .route("/{space}/registry/{app}/versions", get(get_app_versions))
        .route("/{space}/registry/{app}/icon", get(get_app_icon))
        .route(
            "/{space}/registry/{app}/screenshots/{filename}",
            get(get_app_screenshot),
        )
        .route("/{space}/registry/{app}/{target}", get(get_version))
        .route(
            "/{space}/registry/{app}/{target}/latest",
            get(get_latest_version),
        )
        .route(
            "/{space}/registry/{app}/{target}/icon",
            get(get_version_icon),
        )
        .route(
            "/{space}/registry/{app}/{target}/latest/icon",
            get(get_latest_icon),
        )
        .route(
            "/{space}/registry/{app}/{target}/screenshots/{filename}",
            get(get_version_screenshot),
        )
        .route(
            "/{space}/registry/{app}/{target}/latest/screenshots/{filename}",
            get(get_latest_screenshot),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(registry)
}

enum SpaceRef<'a> {
    Physical(&'a Space),
    Virtual(&'a VirtualSpace),
}

fn resolve_space<'a>(registry: &'a Registry, name: &str) -> Result<SpaceRef<'a>, ApiError> {
    if let Some(space) = registry.spaces().space(name) {
        return Ok(SpaceRef::Physical(space));
    }
    if let Some(virtual_space) = registry.spaces().virtual_space(name) {
        return Ok(SpaceRef::Virtual(virtual_space));
    }
    Err(ApiError::not_found(format!("space {name:?} does not exist")))
}

fn resolve_physical<'a>(registry: &'a Registry, name: &str) -> Result<&'a Space, ApiError> {
    match resolve_space(registry, name)? {
        SpaceRef::Physical(space) => Ok(space),
        SpaceRef::Virtual(_) => Err(ApiError::bad_request(
            "cannot publish into a virtual space",
        )),
    }
}

fn extract_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;
    let token = header
        .strip_prefix(TOKEN_SCHEME)
        .ok_or_else(|| ApiError::unauthorized("missing prefix from authorization header"))?;
    if token.len() > MAX_TOKEN_LEN {
        return Err(ApiError::unauthorized("token is too long"));
    }
    Ok(token.to_owned())
}

async fn check_permissions(
    registry: &Registry,
    editor_name: &str,
    app_slug: &str,
    headers: &HeaderMap,
) -> Result<Editor, ApiError> {
    let token = extract_token(headers)?;
    let editor = registry
        .vault()
        .get(editor_name)
        .await
        .map_err(|_| ApiError::unauthorized(format!("could not find editor: {editor_name}")))?;
    verify_token(&editor, app_slug, &token)
        .map_err(|_| ApiError::unauthorized("token could not be verified"))?;
    Ok(editor)
}

async fn create_app(
    State(registry): State<AppState>,
    Path(space): Path<String>,
    headers: HeaderMap,
    Json(opts): Json<AppOptions>,
) -> Result<Response, ApiError> {
    let space = resolve_physical(&registry, &space)?;
    let editor = check_permissions(&registry, &opts.editor, &opts.slug, &headers).await?;
    let app = registry.create_app(space, &opts, &editor).await?;
    Ok((StatusCode::CREATED, Json(app)).into_response())
}

async fn create_version(
    State(registry): State<AppState>,
    Path((space, app_slug)): Path<(String, String)>,
    headers: HeaderMap,
    Json(mut opts): Json<VersionOptions>,
) -> Result<Response, ApiError> {
    let space = resolve_physical(&registry, &space)?;
    let app = registry.find_app(space, &app_slug).await?;
    check_permissions(&registry, &app.editor, &app_slug, &headers).await?;

    opts.version = strip_v_prefix(&opts.version).to_owned();
    let version = registry.publish_version(space, &app, &opts).await?;
    Ok((StatusCode::CREATED, Json(version)).into_response())
}

#[derive(Serialize)]
struct PageMeta {
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

#[derive(Serialize)]
struct PageResponse {
    data: Vec<App>,
    meta: PageMeta,
}

fn parse_list_query(pairs: &[(String, String)]) -> Result<AppsListOptions, ApiError> {
    let mut opts = AppsListOptions::default();
    for (name, value) in pairs {
        match name.as_str() {
            "limit" => {
                opts.limit = value.parse().map_err(|err| {
                    ApiError::bad_request(format!(r#"query param "limit" is invalid: {err}"#))
                })?;
            },
            "cursor" => {
                opts.cursor = value.parse().map_err(|err| {
                    ApiError::bad_request(format!(r#"query param "cursor" is invalid: {err}"#))
                })?;
            },
            "sort" => opts.sort = Some(value.clone()),
            other => {
                if let Some(field) = other
                    .strip_prefix("filter[")
                    .and_then(|rest| rest.strip_suffix(']'))
                {
                    opts.filters.push((field.to_owned(), value.clone()));
                } else {
                    debug!(param = other, "ignoring unknown query parameter");
                }
            },
        }
    }
    Ok(opts)
}

async fn get_apps_list(
    State(registry): State<AppState>,
    Path(space): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    method: Method,
) -> Result<Response, ApiError> {
    let opts = parse_list_query(&pairs)?;
    let page: AppsPage = match resolve_space(&registry, &space)? {
        SpaceRef::Physical(space) => registry.get_apps_list(space, &opts).await?,
        SpaceRef::Virtual(virtual_space) => {
            registry.virtual_get_apps_list(virtual_space, &opts).await?
        },
    };

    let body = PageResponse {
        meta: PageMeta {
            count: page.apps.len(),
            next_cursor: (page.next_cursor >= 0).then(|| page.next_cursor.to_string()),
        },
        data: page.apps,
    };
    Ok(cached_json(&method, &body, ONE_MINUTE))
}

async fn get_app(
    State(registry): State<AppState>,
    Path((space, app_slug)): Path<(String, String)>,
    method: Method,
) -> Result<Response, ApiError> {
    let app = match resolve_space(&registry, &space)? {
        SpaceRef::Physical(space) => registry.find_app(space, &app_slug).await?,
        SpaceRef::Virtual(virtual_space) => {
            registry.virtual_find_app(virtual_space, &app_slug).await?
        },
    };
    Ok(cached_json(&method, &app, ONE_MINUTE))
}

async fn get_app_versions(
    State(registry): State<AppState>,
    Path((space, app_slug)): Path<(String, String)>,
    method: Method,
) -> Result<Response, ApiError> {
    let versions = match resolve_space(&registry, &space)? {
        SpaceRef::Physical(space) => registry.find_app_versions(space, &app_slug).await?,
        SpaceRef::Virtual(virtual_space) => {
            registry
                .virtual_find_app_versions(virtual_space, &app_slug)
                .await?
        },
    };
    Ok(cached_json(&method, &versions, ONE_MINUTE))
}

async fn get_version(
    State(registry): State<AppState>,
    Path((space, app_slug, target)): Path<(String, String, String)>,
    method: Method,
) -> Result<Response, ApiError> {
    let wanted = strip_v_prefix(&target);
    let version = match resolve_space(&registry, &space)? {
        SpaceRef::Physical(space) => registry.find_version(space, &app_slug, wanted).await?,
        SpaceRef::Virtual(virtual_space) => {
            registry
                .virtual_find_version(virtual_space, &app_slug, wanted)
                .await?
        },
    };
    Ok(cached_json(&method, &version, ONE_YEAR))
}

async fn get_latest_version(
    State(registry): State<AppState>,
    Path((space, app_slug, channel)): Path<(String, String, String)>,
    method: Method,
) -> Result<Response, ApiError> {
    let channel: Channel = channel.parse().map_err(ApiError::from)?;
    let version = latest_in(&registry, &space, &app_slug, channel).await?;
    Ok(cached_json(&method, &version, ONE_MINUTE))
}

async fn latest_in(
    registry: &Registry,
    space: &str,
    app_slug: &str,
    channel: Channel,
) -> Result<Version, ApiError> {
    match resolve_space(registry, space)? {
        SpaceRef::Physical(space) => Ok(registry
            .find_latest_version(space, app_slug, channel)
            .await?),
        SpaceRef::Virtual(virtual_space) => Ok(registry
            .virtual_find_latest_version(virtual_space, app_slug, channel)
            .await?),
    }
}

async fn get_version_icon(
    state: State<AppState>,
    Path((space, app, target)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    version_attachment(state, space, app, target, "icon".to_owned(), method, headers).await
}

async fn get_version_screenshot(
    state: State<AppState>,
    Path((space, app, target, filename)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    version_attachment(
        state,
        space,
        app,
        target,
        format!("screenshots/{filename}"),
        method,
        headers,
    )
    .await
}

async fn version_attachment(
    State(registry): State<AppState>,
    space: String,
    app_slug: String,
    target: String,
    filename: String,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let wanted = strip_v_prefix(&target);
    let blob = match resolve_space(&registry, &space)? {
        SpaceRef::Physical(space) => {
            let version = registry.find_version(space, &app_slug, wanted).await?;
            registry
                .find_version_attachment(space, &version, &filename)
                .await?
        },
        SpaceRef::Virtual(virtual_space) => {
            registry
                .virtual_find_version_attachment(virtual_space, &app_slug, wanted, &filename)
                .await?
        },
    };
    Ok(attachment_response(&method, &headers, blob))
}

async fn get_latest_icon(
    state: State<AppState>,
    Path((space, app, channel)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    latest_attachment(state, space, app, channel, "icon".to_owned(), method, headers).await
}

async fn get_latest_screenshot(
    state: State<AppState>,
    Path((space, app, channel, filename)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    latest_attachment(
        state,
        space,
        app,
        channel,
        format!("screenshots/{filename}"),
        method,
        headers,
    )
    .await
}

async fn latest_attachment(
    State(registry): State<AppState>,
    space: String,
    app_slug: String,
    channel: String,
    filename: String,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let channel: Channel = channel.parse().map_err(ApiError::from)?;
    let latest = latest_in(&registry, &space, &app_slug, channel).await?;
    let blob = attachment_of(&registry, &space, &app_slug, &latest.version, &filename).await?;
    Ok(attachment_response(&method, &headers, blob))
}

async fn get_app_icon(
    state: State<AppState>,
    Path((space, app)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    app_attachment(state, space, app, "icon".to_owned(), method, headers).await
}

async fn get_app_screenshot(
    state: State<AppState>,
    Path((space, app, filename)): Path<(String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    app_attachment(
        state,
        space,
        app,
        format!("screenshots/{filename}"),
        method,
        headers,
    )
    .await
}

/// App-level attachments resolve against the narrowest channel that has a
/// version carrying the file: stable first, then beta, then dev.
async fn app_attachment(
    State(registry): State<AppState>,
    space: String,
    app_slug: String,
    filename: String,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    for channel in Channel::ALL {
        let latest = match latest_in(&registry, &space, &app_slug, channel).await {
            Ok(latest) => latest,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        match attachment_of(&registry, &space, &app_slug, &latest.version, &filename).await {
            Ok(blob) => return Ok(attachment_response(&method, &headers, blob)),
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(ApiError::not_found("attachment was not found"))
}

async fn attachment_of(
    registry: &Registry,
    space: &str,
    app_slug: &str,
    version: &str,
    filename: &str,
) -> Result<ObjectBlob, ApiError> {
    match resolve_space(registry, space)? {
        SpaceRef::Physical(space) => {
            let version = registry.find_version(space, app_slug, version).await?;
            Ok(registry
                .find_version_attachment(space, &version, filename)
                .await?)
        },
        SpaceRef::Virtual(virtual_space) => Ok(registry
            .virtual_find_version_attachment(virtual_space, app_slug, version, filename)
            .await?),
    }
}

/// Editor directory entry: only the public part of the record.
#[derive(Serialize)]
struct EditorView {
    name: String,
}

async fn list_editors(State(registry): State<AppState>) -> Result<Response, ApiError> {
    let editors = registry.vault().all().await?;
    let views: Vec<EditorView> = editors
        .into_iter()
        .map(|editor| EditorView { name: editor.name })
        .collect();
    Ok(Json(views).into_response())
}

async fn get_editor(
    State(registry): State<AppState>,
    Path(editor): Path<String>,
    method: Method,
) -> Result<Response, ApiError> {
    let editor = registry.vault().get(&editor).await?;
    Ok(cached_json(&method, &EditorView { name: editor.name }, ONE_MINUTE))
}

/// Serialises a document response. A HEAD request gets the same headers,
/// including the content length the GET body would have, and no body.
fn cached_json<T: Serialize>(method: &Method, body: &T, max_age: u64) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = if *method == Method::HEAD {
        let mut response = StatusCode::OK.into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
        response
    } else {
        Bytes::from(bytes).into_response()
    };
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = format!("max-age={max_age}").parse() {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

/// Serves an attachment. The etag is checked before anything else; a HEAD
/// request gets the headers without the bytes.
fn attachment_response(method: &Method, request_headers: &HeaderMap, blob: ObjectBlob) -> Response {
    let etag = blob.etag.clone();
    if let Some(matched) = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    {
        if matched.split(',').any(|candidate| candidate.trim() == etag) {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let mut response = if *method == Method::HEAD {
        let mut response = StatusCode::OK.into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(blob.content_length));
        response
    } else {
        blob.data.into_response()
    };
    let headers = response.headers_mut();
    if let Ok(value) = blob.content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = etag.parse() {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = format!("max-age={ONE_HOUR}").parse() {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}
