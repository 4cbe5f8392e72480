//! Request, response and error shapes carried inside frames.

use crate::error::{ErrorCode, ErrorType, IpcError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Request verb. Only the idempotent `GET` may be retried by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether a transparent retry is safe. Only reads qualify; `PUT` and
    /// `DELETE` may carry side effects through handlers we know nothing about.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Method::Get)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from a client process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub query_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Requested processing budget in seconds. Clamped server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            data: None,
            headers: HashMap::new(),
            query_params: Map::new(),
            request_id: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, data: Value) -> Self {
        Self::new(Method::Post, path).with_data(data)
    }

    pub fn put(path: impl Into<String>, data: Value) -> Self {
        Self::new(Method::Put, path).with_data(data)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: Value) -> Self {
        self.query_params.insert(name.into(), value);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs_f64());
        self
    }

    /// The requested timeout, if it is a usable positive duration.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Path without any `?query` suffix.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

/// Structured error carried in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub error_message: String,
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.as_str().to_string(),
            error_message: message.into(),
            error_type: code.error_type(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Parsed error code, if this server speaks one we know.
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::parse(&self.error_code)
    }
}

impl From<&IpcError> for ErrorBody {
    fn from(err: &IpcError) -> Self {
        if let IpcError::Remote { error, .. } = err {
            return error.clone();
        }
        let mut body = ErrorBody::new(err.error_code(), err.to_string());
        body.details = err.details();
        body
    }
}

/// A response from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Server-measured handling time in milliseconds. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
}

impl Response {
    /// A 200 response carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self::with_status(200, data)
    }

    pub fn with_status(status_code: u16, data: Value) -> Self {
        Self {
            status_code,
            data: Some(data),
            error: None,
            request_id: None,
            processing_time: None,
        }
    }

    /// A 204-style response with no payload.
    pub fn empty() -> Self {
        Self {
            status_code: 204,
            data: None,
            error: None,
            request_id: None,
            processing_time: None,
        }
    }

    pub fn from_error(err: &IpcError) -> Self {
        Self {
            status_code: err.status_code(),
            data: None,
            error: Some(ErrorBody::from(err)),
            request_id: None,
            processing_time: None,
        }
    }

    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Convert into the payload, or a typed [`IpcError::Remote`] for non-2xx.
    pub fn into_result(self) -> Result<Value, IpcError> {
        if self.is_success() {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_else(|| {
            let code = match self.status_code {
                404 => ErrorCode::NotFound,
                429 => ErrorCode::RateLimited,
                400..=499 => ErrorCode::BadRequest,
                _ => ErrorCode::InternalError,
            };
            ErrorBody::new(code, format!("status {}", self.status_code))
        });
        Err(IpcError::Remote {
            status_code: self.status_code,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_minimal_shape_parses() {
        let req: Request =
            serde_json::from_str(r#"{"method": "GET", "path": "/api/v1/health", "request_id": "r1"}"#)
                .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/api/v1/health");
        assert_eq!(req.request_id.as_deref(), Some("r1"));
        assert!(req.data.is_none());
        assert!(req.headers.is_empty());
    }

    #[test]
    fn test_request_rejects_unknown_method() {
        let parsed = serde_json::from_str::<Request>(r#"{"method": "PATCH", "path": "/api/v1/x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_request_omits_empty_fields() {
        let json = serde_json::to_value(Request::get("/api/v1/health")).unwrap();
        assert_eq!(json, json!({"method": "GET", "path": "/api/v1/health"}));
    }

    #[test]
    fn test_timeout_duration_ignores_nonsense() {
        let mut req = Request::get("/api/v1/x");
        req.timeout = Some(-1.0);
        assert!(req.timeout_duration().is_none());
        req.timeout = Some(f64::NAN);
        assert!(req.timeout_duration().is_none());
        req.timeout = Some(1.5);
        assert_eq!(req.timeout_duration(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_route_path_strips_query() {
        let req = Request::get("/api/v1/items?limit=5");
        assert_eq!(req.route_path(), "/api/v1/items");
    }

    #[test]
    fn test_error_response_shape() {
        let resp = Response::from_error(&IpcError::NotFound {
            path: "/api/v2/unknown".into(),
        })
        .with_request_id(Some("r2".into()));
        let json = serde_json::to_value(&resp).unwrap();

        assert_eq!(json["status_code"], 404);
        assert_eq!(json["error"]["error_code"], "NOT_FOUND");
        assert_eq!(json["error"]["error_type"], "client");
        assert_eq!(json["request_id"], "r2");
        assert!(json["error"]["timestamp"].is_string());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_into_result_maps_errors() {
        let resp = Response::from_error(&IpcError::RateLimited { retry_after_ms: 50 });
        match resp.into_result() {
            Err(IpcError::Remote { status_code, error }) => {
                assert_eq!(status_code, 429);
                assert_eq!(error.code(), Some(ErrorCode::RateLimited));
                assert_eq!(error.details, Some(json!({"retry_after_ms": 50})));
            }
            other => panic!("Expected Remote error, got: {:?}", other),
        }

        let ok = Response::ok(json!({"status": "healthy"})).into_result().unwrap();
        assert_eq!(ok, json!({"status": "healthy"}));
    }

    #[test]
    fn test_method_idempotency() {
        assert!(Method::Get.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert!(!Method::Put.is_idempotent());
        assert!(!Method::Delete.is_idempotent());
    }
}
