use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: &'static str, message: Option<String> },
    NotFound { code: &'static str },
    Conflict { code: &'static str, message: Option<String> },
    Internal { message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self { Self::Internal { message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str) -> Self { Self::BadRequest { code, message: None } }
    pub fn not_found(code: &'static str) -> Self { Self::NotFound { code } }
    pub fn conflict(code: &'static str) -> Self { Self::Conflict { code, message: None } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::BadRequest { code, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), message },
                code
            ),
            ApiError::NotFound { code } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), message: None },
                code
            ),
            ApiError::Conflict { code, message } => (
                StatusCode::CONFLICT,
                ErrorBody { code: code.into(), message },
                code
            ),
            ApiError::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), message },
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
