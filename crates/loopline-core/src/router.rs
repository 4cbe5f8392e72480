//! Route table and dispatch.
//!
//! Routes map `(method, path pattern)` to a [`Handler`]. Patterns are
//! `/`-separated segments where `{name}` captures one segment into
//! [`PathParams`]. Every path must start with `/api/<version>/` for a
//! configured version; anything else is `NOT_FOUND` before lookup.
//!
//! Each handler runs in its own task under a deadline, so a panic or a hang
//! in business code becomes an error response on that request only.

use crate::config::{ApiVersionConfig, ProtocolConfig, ServerConfig};
use crate::error::{IpcError, Result};
use crate::middleware::{Endpoint, RequestContext};
use crate::protocol::{Method, Request, Response};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Values captured from `{name}` segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(HashMap<String, String>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Like [`get`](Self::get), but a missing parameter is a validation error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| IpcError::Validation {
            field: name.to_string(),
            message: "missing path parameter".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Failure reported by a handler.
#[derive(Debug)]
pub enum HandlerError {
    /// Sent to the client as-is.
    Ipc(IpcError),
    /// Logged; the client sees a generic `INTERNAL_ERROR`.
    Internal(String),
}

impl HandlerError {
    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }
}

impl From<IpcError> for HandlerError {
    fn from(err: IpcError) -> Self {
        HandlerError::Ipc(err)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

pub type HandlerResult = std::result::Result<Response, HandlerError>;

/// Business logic behind a route.
///
/// Implemented for any `Fn(Request, PathParams) -> impl Future<Output = HandlerResult>`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, request: Request, params: PathParams) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, request: Request, params: PathParams) -> HandlerResult {
        (self)(request, params).await
    }
}

/// JSON type expected for a field of `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Object,
    Array,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Bool => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

type Validator = Arc<dyn Fn(Option<&Value>) -> Result<()> + Send + Sync>;

/// Structural expectation on a request's `data`, checked before the handler runs.
#[derive(Clone, Default)]
pub enum DataShape {
    /// No check.
    #[default]
    Any,
    /// `data` must be present.
    Required,
    /// `data` must be an object containing these typed fields.
    Object(Vec<(String, FieldType)>),
    Custom(Validator),
}

impl DataShape {
    pub fn object(fields: &[(&str, FieldType)]) -> Self {
        DataShape::Object(
            fields
                .iter()
                .map(|(name, ty)| (name.to_string(), *ty))
                .collect(),
        )
    }

    /// `data` must deserialize as `T`.
    pub fn typed<T: DeserializeOwned + 'static>() -> Self {
        DataShape::Custom(Arc::new(|data: Option<&Value>| {
            let value = data.cloned().unwrap_or(Value::Null);
            serde_json::from_value::<T>(value)
                .map(|_| ())
                .map_err(|e| IpcError::Validation {
                    field: "data".to_string(),
                    message: e.to_string(),
                })
        }))
    }

    pub fn validate(&self, data: Option<&Value>) -> Result<()> {
        match self {
            DataShape::Any => Ok(()),
            DataShape::Required => data.map(|_| ()).ok_or_else(|| missing("data")),
            DataShape::Object(fields) => {
                let object = data
                    .ok_or_else(|| missing("data"))?
                    .as_object()
                    .ok_or_else(|| IpcError::Validation {
                        field: "data".to_string(),
                        message: "expected an object".to_string(),
                    })?;
                for (name, ty) in fields {
                    let value = object.get(name).ok_or_else(|| missing(name))?;
                    if !ty.accepts(value) {
                        return Err(IpcError::Validation {
                            field: name.clone(),
                            message: format!("expected {}", ty.name()),
                        });
                    }
                }
                Ok(())
            }
            DataShape::Custom(validator) => validator(data),
        }
    }
}

impl std::fmt::Debug for DataShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataShape::Any => f.write_str("Any"),
            DataShape::Required => f.write_str("Required"),
            DataShape::Object(fields) => f.debug_tuple("Object").field(fields).finish(),
            DataShape::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn missing(field: &str) -> IpcError {
    IpcError::Validation {
        field: field.to_string(),
        message: "required".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed route pattern such as `/api/v1/connectors/{connector_id}/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(pattern_error(pattern, "must start with '/'"));
        }

        let mut segments = Vec::new();
        for part in split_path(pattern) {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(pattern_error(pattern, "invalid parameter segment"));
                }
                if segments
                    .iter()
                    .any(|s| matches!(s, Segment::Param(existing) if existing == name))
                {
                    return Err(pattern_error(pattern, "duplicate parameter name"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains(['{', '}']) {
                return Err(pattern_error(pattern, "braces must span a whole segment"));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn matches(&self, path: &[&str]) -> Option<PathParams> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(PathParams(params))
    }
}

fn pattern_error(pattern: &str, reason: &str) -> IpcError {
    IpcError::Config {
        message: format!("Invalid route pattern {:?}: {}", pattern, reason),
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

struct Route {
    method: Method,
    pattern: PathPattern,
    shape: DataShape,
    handler: Arc<dyn Handler>,
}

/// Aborts the handler task if dispatch is abandoned.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The route table. Built before the server starts, then shared read-only.
pub struct Router {
    routes: Vec<Route>,
    versions: ApiVersionConfig,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let defaults = ServerConfig::default();
        Self {
            routes: Vec::new(),
            versions: defaults.api_versions.clone(),
            default_timeout: defaults.default_request_timeout(),
            max_timeout: defaults.max_request_timeout(),
        }
    }

    /// Take API versions and request deadlines from the server config.
    pub fn configure(&mut self, config: &ServerConfig) {
        self.versions = config.api_versions.clone();
        self.default_timeout = config.default_request_timeout();
        self.max_timeout = config.max_request_timeout();
    }

    /// Register a closure handler.
    pub fn register<F, Fut>(&mut self, method: Method, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(method, pattern, DataShape::Any, handler)
    }

    /// Register a closure handler whose `data` is validated against `shape` first.
    pub fn register_with_shape<F, Fut>(
        &mut self,
        method: Method,
        pattern: &str,
        shape: DataShape,
        handler: F,
    ) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(method, pattern, shape, handler)
    }

    /// Register any [`Handler`] implementation.
    pub fn register_handler(
        &mut self,
        method: Method,
        pattern: &str,
        shape: DataShape,
        handler: impl Handler,
    ) -> Result<&mut Self> {
        let pattern = PathPattern::parse(pattern)?;
        if self
            .routes
            .iter()
            .any(|r| r.method == method && r.pattern == pattern)
        {
            return Err(IpcError::Config {
                message: format!("Route {} {} registered twice", method, pattern.as_str()),
            });
        }

        debug!("Registered route {} {}", method, pattern.as_str());
        self.routes.push(Route {
            method,
            pattern,
            shape,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    pub fn get<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Method::Get, pattern, handler)
    }

    pub fn post<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Method::Post, pattern, handler)
    }

    pub fn put<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Method::Put, pattern, handler)
    }

    pub fn delete<F, Fut>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(Method::Delete, pattern, handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route `request` to its handler and produce the response.
    pub async fn dispatch(&self, request: Request) -> Response {
        let request_id = request.request_id.clone();
        let response = match self.resolve(&request) {
            Ok((route, params)) => self.run(route, request, params).await,
            Err(e) => Response::from_error(&e),
        };
        response.with_request_id(request_id)
    }

    fn resolve(&self, request: &Request) -> Result<(&Route, PathParams)> {
        let path = request.route_path();
        let parts: Vec<&str> = split_path(path).collect();
        self.check_version(path, &parts)?;

        let mut allowed = Vec::new();
        for route in &self.routes {
            let Some(params) = route.pattern.matches(&parts) else {
                continue;
            };
            if route.method == request.method {
                route.shape.validate(request.data.as_ref())?;
                return Ok((route, params));
            }
            allowed.push(route.method.as_str().to_string());
        }

        if allowed.is_empty() {
            return Err(IpcError::NotFound {
                path: path.to_string(),
            });
        }
        allowed.sort();
        allowed.dedup();
        Err(IpcError::MethodNotAllowed {
            method: request.method.to_string(),
            path: path.to_string(),
            allowed,
        })
    }

    fn check_version(&self, path: &str, parts: &[&str]) -> Result<()> {
        let prefix = ProtocolConfig::API_PREFIX.trim_start_matches('/');
        let version = match parts {
            [api, version, ..] if *api == prefix => *version,
            _ => {
                return Err(IpcError::NotFound {
                    path: path.to_string(),
                })
            }
        };

        if !self.versions.supported.iter().any(|v| v == version) {
            return Err(IpcError::NotFound {
                path: path.to_string(),
            });
        }
        if self.versions.deprecated.iter().any(|v| v == version) {
            warn!("Request on deprecated API version {}: {}", version, path);
        }
        Ok(())
    }

    async fn run(&self, route: &Route, request: Request, params: PathParams) -> Response {
        let limit = request
            .timeout_duration()
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout);

        let handler = route.handler.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.call(request, params).await
        }));

        match tokio::time::timeout(limit, &mut task.0).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(HandlerError::Ipc(e)))) => Response::from_error(&e),
            Ok(Ok(Err(HandlerError::Internal(message)))) => {
                error!(
                    "Handler for {} {} failed: {}",
                    route.method,
                    route.pattern.as_str(),
                    message
                );
                internal_error()
            }
            Ok(Err(join_error)) => {
                error!(
                    "Handler for {} {} panicked: {}",
                    route.method,
                    route.pattern.as_str(),
                    join_error
                );
                internal_error()
            }
            Err(_) => {
                warn!(
                    "Handler for {} {} exceeded {:?}, aborting",
                    route.method,
                    route.pattern.as_str(),
                    limit
                );
                Response::from_error(&IpcError::Timeout(limit))
            }
        }
    }
}

fn internal_error() -> Response {
    Response::from_error(&IpcError::Internal("Internal server error".to_string()))
}

#[async_trait]
impl Endpoint for Router {
    async fn call(&self, _ctx: &RequestContext, request: Request) -> Response {
        self.dispatch(request).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field(
                "routes",
                &self
                    .routes
                    .iter()
                    .map(|r| format!("{} {}", r.method, r.pattern.as_str()))
                    .collect::<Vec<_>>(),
            )
            .field("versions", &self.versions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn health_router() -> Router {
        let mut router = Router::new();
        router
            .get("/api/v1/health", |_req: Request, _params: PathParams| async {
                Ok(Response::ok(json!({"status": "healthy"})))
            })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_health_route() {
        let response = health_router()
            .dispatch(Request::get("/api/v1/health").with_request_id("r1"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.data, Some(json!({"status": "healthy"})));
        assert_eq!(response.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_unknown_version_is_not_found() {
        let response = health_router()
            .dispatch(Request::get("/api/v2/unknown").with_request_id("r2"))
            .await;
        assert_eq!(response.status_code, 404);
        assert_eq!(response.error.unwrap().error_code, "NOT_FOUND");
        assert_eq!(response.request_id.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_unversioned_path_is_not_found() {
        let response = health_router().dispatch(Request::get("/health")).await;
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test]
    async fn test_path_params_captured() {
        let mut router = Router::new();
        router
            .get(
                "/api/v1/connectors/{connector_id}/config",
                |_req: Request, params: PathParams| async move {
                    let id = params.require("connector_id")?.to_string();
                    Ok(Response::ok(json!({ "id": id })))
                },
            )
            .unwrap();

        let response = router
            .dispatch(Request::get("/api/v1/connectors/slack/config"))
            .await;
        assert_eq!(response.data, Some(json!({"id": "slack"})));
    }

    #[tokio::test]
    async fn test_method_not_allowed_lists_methods() {
        let mut router = health_router();
        router
            .delete("/api/v1/health", |_req: Request, _p: PathParams| async {
                Ok(Response::empty())
            })
            .unwrap();

        let response = router
            .dispatch(Request::post("/api/v1/health", json!({})))
            .await;
        assert_eq!(response.status_code, 405);
        let error = response.error.unwrap();
        assert_eq!(error.error_code, "METHOD_NOT_ALLOWED");
        assert_eq!(
            error.details,
            Some(json!({"allowed_methods": ["DELETE", "GET"]}))
        );
    }

    #[tokio::test]
    async fn test_shape_validation_runs_before_handler() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let mut router = Router::new();
        router
            .register_with_shape(
                Method::Post,
                "/api/v1/connectors",
                DataShape::object(&[("name", FieldType::String), ("enabled", FieldType::Bool)]),
                move |_req: Request, _p: PathParams| {
                    let flag = flag.clone();
                    async move {
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(Response::with_status(201, json!({})))
                    }
                },
            )
            .unwrap();

        let response = router
            .dispatch(Request::post("/api/v1/connectors", json!({"name": 5, "enabled": true})))
            .await;
        assert_eq!(response.status_code, 422);
        let error = response.error.unwrap();
        assert_eq!(error.error_code, "VALIDATION_ERROR");
        assert_eq!(error.details, Some(json!({"field": "name"})));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

        let response = router
            .dispatch(Request::post(
                "/api/v1/connectors",
                json!({"name": "slack", "enabled": true}),
            ))
            .await;
        assert_eq!(response.status_code, 201);
    }

    #[tokio::test]
    async fn test_typed_shape() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Config {
            interval_secs: u64,
        }

        let shape = DataShape::typed::<Config>();
        assert!(shape.validate(Some(&json!({"interval_secs": 30}))).is_ok());
        assert!(shape.validate(Some(&json!({"interval_secs": "x"}))).is_err());
        assert!(shape.validate(None).is_err());
    }

    #[tokio::test]
    async fn test_structured_handler_error_passes_through() {
        let mut router = Router::new();
        router
            .put("/api/v1/items/{id}", |_req: Request, _p: PathParams| async {
                Err(HandlerError::from(IpcError::Conflict {
                    message: "version mismatch".into(),
                }))
            })
            .unwrap();

        let response = router
            .dispatch(Request::put("/api/v1/items/1", json!({})))
            .await;
        assert_eq!(response.status_code, 409);
        assert_eq!(response.error.unwrap().error_code, "CONFLICT");
    }

    #[tokio::test]
    async fn test_opaque_handler_error_is_generic() {
        let mut router = Router::new();
        router
            .get("/api/v1/fail", |_req: Request, _p: PathParams| async {
                Err(HandlerError::internal("db password rejected"))
            })
            .unwrap();

        let response = router.dispatch(Request::get("/api/v1/fail")).await;
        assert_eq!(response.status_code, 500);
        let error = response.error.unwrap();
        assert_eq!(error.error_code, "INTERNAL_ERROR");
        assert!(!error.error_message.contains("password"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_internal_error() {
        let mut router = Router::new();
        router
            .get("/api/v1/panic", |_req: Request, _p: PathParams| async {
                if true {
                    panic!("boom");
                }
                Ok(Response::empty())
            })
            .unwrap();

        let response = router.dispatch(Request::get("/api/v1/panic")).await;
        assert_eq!(response.status_code, 500);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let mut router = Router::new();
        router
            .get("/api/v1/slow", |_req: Request, _p: PathParams| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Response::empty())
            })
            .unwrap();

        let response = router
            .dispatch(Request::get("/api/v1/slow").with_timeout(Duration::from_millis(50)))
            .await;
        assert_eq!(response.status_code, 504);
        assert_eq!(response.error.unwrap().error_code, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_request_timeout_clamped_to_max() {
        let mut config = ServerConfig::default();
        config.default_request_timeout_ms = 20;
        config.max_request_timeout_ms = 50;
        let mut router = Router::new();
        router.configure(&config);
        router
            .get("/api/v1/slow", |_req: Request, _p: PathParams| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Response::empty())
            })
            .unwrap();

        let started = std::time::Instant::now();
        let response = router
            .dispatch(Request::get("/api/v1/slow").with_timeout(Duration::from_secs(3600)))
            .await;
        assert_eq!(response.status_code, 504);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_deprecated_version_still_routes() {
        let mut config = ServerConfig::default();
        config.api_versions = ApiVersionConfig {
            supported: vec!["v1".into(), "v2".into()],
            deprecated: vec!["v1".into()],
        };
        let mut router = health_router();
        router.configure(&config);

        let response = router.dispatch(Request::get("/api/v1/health")).await;
        assert_eq!(response.status_code, 200);
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, request: Request, _params: PathParams) -> HandlerResult {
            Ok(Response::ok(request.data.unwrap_or(Value::Null)))
        }
    }

    #[tokio::test]
    async fn test_struct_handler() {
        let mut router = Router::new();
        router
            .register_handler(Method::Post, "/api/v1/echo", DataShape::Required, Echo)
            .unwrap();

        let response = router
            .dispatch(Request::post("/api/v1/echo", json!([1, 2])))
            .await;
        assert_eq!(response.data, Some(json!([1, 2])));
        assert_eq!(
            router.dispatch(Request::new(Method::Post, "/api/v1/echo")).await.status_code,
            422
        );
    }

    #[test]
    fn test_pattern_errors() {
        assert!(PathPattern::parse("api/v1/x").is_err());
        assert!(PathPattern::parse("/api/v1/{}").is_err());
        assert!(PathPattern::parse("/api/v1/x{id}").is_err());
        assert!(PathPattern::parse("/api/v1/{id}/{id}").is_err());
        assert!(PathPattern::parse("/api/v1/{id}/items/{item_id}").is_ok());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let mut router = health_router();
        let err = router
            .get("/api/v1/health", |_req: Request, _p: PathParams| async {
                Ok(Response::empty())
            })
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::Config { .. }));
    }

    #[tokio::test]
    async fn test_query_suffix_ignored_for_routing() {
        let response = health_router()
            .dispatch(Request::get("/api/v1/health?verbose=1"))
            .await;
        assert_eq!(response.status_code, 200);
    }
}
