// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared HTTP error shapes, reused by both the control plane's and (should
//! it ever grow one) the worker agent's poem-openapi surface, so every
//! endpoint in the system returns the same error envelope.

use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object};

#[derive(Object, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Object, Debug, Clone)]
pub struct ErrorsBody {
    pub errors: Vec<String>,
}

/// Implemented by error enums that know how to classify themselves for
/// tracing, independent of the HTTP status they end up mapped to.
pub trait TraceErrorKind {
    fn trace_error_kind(&self) -> &'static str;
}

#[derive(ApiResponse, Debug)]
pub enum ApiError {
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn bad_request(messages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ApiError::BadRequest(Json(ErrorsBody {
            errors: messages.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(Json(ErrorBody {
            error: message.into(),
        }))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(Json(ErrorBody {
            error: message.into(),
        }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::InternalError(Json(ErrorBody {
            error: message.into(),
        }))
    }
}

impl TraceErrorKind for ApiError {
    fn trace_error_kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::InternalError(_) => "internal_error",
        }
    }
}

pub struct HealthcheckApi;

#[derive(Object, Debug, Clone)]
pub struct HealthcheckResponse {
    pub healthy: bool,
}

#[poem_openapi::OpenApi]
impl HealthcheckApi {
    #[oai(path = "/healthcheck", method = "get", operation_id = "healthcheck")]
    async fn healthcheck(&self) -> Json<HealthcheckResponse> {
        Json(HealthcheckResponse { healthy: true })
    }
}
