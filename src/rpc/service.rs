//! RPC handler contract.
//!
//! The transport below a service is opaque to it: a call is a method name plus a
//! JSON payload, and the answer is a JSON value or an [`RpcError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown method {method} on service {service}")]
    UnknownMethod { service: String, method: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn unknown_method(service: &str, method: &str) -> Self {
        RpcError::UnknownMethod {
            service: service.to_string(),
            method: method.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RpcError::UnknownService(_)
            | RpcError::UnknownMethod { .. }
            | RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RpcError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// One named RPC service.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn call(&self, method: &str, payload: Value) -> Result<Value, RpcError>;
}

/// Service name to handler, as contributed by one subsystem.
pub type RpcServiceMap = BTreeMap<String, Arc<dyn RpcService>>;

pub fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, RpcError> {
    serde_json::from_value(payload).map_err(|e| RpcError::InvalidArgument(e.to_string()))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(e.to_string()))
}
