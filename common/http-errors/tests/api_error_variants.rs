use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::ApiError;

#[test]
fn bad_request_variant() {
    let err = ApiError::BadRequest { code: "invalid_something", message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_something");
}

#[test]
fn not_found_variant() {
    let err = ApiError::NotFound { code: "missing_resource" };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "missing_resource");
}

#[test]
fn conflict_variant_carries_message() {
    let err = ApiError::Conflict {
        code: "insufficient_stock",
        message: Some("requested 3, available 1".into()),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "insufficient_stock");
}

#[test]
fn internal_variant() {
    let err = ApiError::internal("db connection refused");
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}
