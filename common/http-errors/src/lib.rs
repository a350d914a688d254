use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Stable error taxonomy surfaced to callers. The wire `error` tag and the
/// HTTP status for each kind are part of the public contract and must not
/// change without a version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CredentialsMissing,
    CredentialsInvalid,
    CredentialsExpired,
    PrincipalSuspended,
    ForbiddenModel,
    ForbiddenEndpoint,
    InsufficientPermissions,
    InputTooLarge,
    UnsupportedContentType,
    MaliciousContent,
    InvalidArgument,
    RateLimitedGlobal,
    RateLimitedIp,
    RateLimitedPrincipal,
    ConcurrencyExceeded,
    TierTokenLimitExceeded,
    UpstreamUnavailable,
    UpstreamTimeout,
    UpstreamError,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialsMissing => "credentials-missing",
            Self::CredentialsInvalid => "credentials-invalid",
            Self::CredentialsExpired => "credentials-expired",
            Self::PrincipalSuspended => "principal-suspended",
            Self::ForbiddenModel => "forbidden-model",
            Self::ForbiddenEndpoint => "forbidden-endpoint",
            Self::InsufficientPermissions => "insufficient-permissions",
            Self::InputTooLarge => "input-too-large",
            Self::UnsupportedContentType => "unsupported-content-type",
            Self::MaliciousContent => "malicious-content",
            Self::InvalidArgument => "invalid-argument",
            Self::RateLimitedGlobal => "rate-limited-global",
            Self::RateLimitedIp => "rate-limited-ip",
            Self::RateLimitedPrincipal => "rate-limited-principal",
            Self::ConcurrencyExceeded => "concurrency-exceeded",
            Self::TierTokenLimitExceeded => "tier-token-limit-exceeded",
            Self::UpstreamUnavailable => "upstream-unavailable",
            Self::UpstreamTimeout => "upstream-timeout",
            Self::UpstreamError => "upstream-error",
            Self::NotFound => "not-found",
            Self::Internal => "internal-error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::CredentialsMissing | Self::CredentialsInvalid | Self::CredentialsExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::PrincipalSuspended
            | Self::ForbiddenModel
            | Self::ForbiddenEndpoint
            | Self::InsufficientPermissions => StatusCode::FORBIDDEN,
            Self::InputTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::MaliciousContent
            | Self::InvalidArgument
            | Self::TierTokenLimitExceeded => StatusCode::BAD_REQUEST,
            Self::RateLimitedGlobal
            | Self::RateLimitedIp
            | Self::RateLimitedPrincipal
            | Self::ConcurrencyExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable | Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn family(&self) -> &'static str {
        match self {
            Self::CredentialsMissing
            | Self::CredentialsInvalid
            | Self::CredentialsExpired
            | Self::PrincipalSuspended => "authentication",
            Self::ForbiddenModel | Self::ForbiddenEndpoint | Self::InsufficientPermissions => {
                "authorization"
            }
            Self::InputTooLarge
            | Self::UnsupportedContentType
            | Self::MaliciousContent
            | Self::InvalidArgument
            | Self::TierTokenLimitExceeded
            | Self::NotFound => "invalid_request",
            Self::RateLimitedGlobal
            | Self::RateLimitedIp
            | Self::RateLimitedPrincipal
            | Self::ConcurrencyExceeded => "rate_limit",
            Self::UpstreamUnavailable | Self::UpstreamTimeout | Self::UpstreamError => "upstream",
            Self::Internal => "internal",
        }
    }
}

/// Rate-limit details attached to 429 responses; drives the
/// `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix: i64,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub request_id: Option<Uuid>,
    pub message: Option<String>,
    pub param: Option<String>,
    pub rate: Option<RateLimitInfo>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            message: None,
            param: None,
            rate: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument).with_message(message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(ErrorKind::Internal).with_message(err.to_string())
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_rate(mut self, rate: RateLimitInfo) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind.code(), message),
            None => write!(f, "{}", self.kind.code()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(rename = "type")]
    family: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<String>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    timestamp: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        // Internal messages stay in the logs outside development builds.
        let message = if self.kind == ErrorKind::Internal && !cfg!(debug_assertions) {
            Some("Internal server error".to_string())
        } else {
            self.message
        };
        let body = ErrorBody {
            error: self.kind.code(),
            message,
            family: self.kind.family(),
            param: self.param,
            request_id: self.request_id,
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut resp = (status, Json(body)).into_response();
        let headers = resp.headers_mut();
        headers.insert("X-Error-Code", HeaderValue::from_static(self.kind.code()));
        if let Some(rate) = self.rate {
            if let Ok(value) = HeaderValue::from_str(&rate.limit.to_string()) {
                headers.insert("X-RateLimit-Limit", value);
            }
            if let Ok(value) = HeaderValue::from_str(&rate.remaining.to_string()) {
                headers.insert("X-RateLimit-Remaining", value);
            }
            if let Ok(value) = HeaderValue::from_str(&rate.reset_unix.to_string()) {
                headers.insert("X-RateLimit-Reset", value);
            }
            if let Some(retry_after) = rate.retry_after_secs {
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    headers.insert("Retry-After", value);
                }
            }
        }
        resp
    }
}
