use axum::response::{
    IntoResponse,
    Response,
};
use errors::ErrorMetadataAnyhowExt;
use http::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};

/// `HttpResponseError` converts `anyhow::Error` chains (and the
/// `ErrorMetadata` inside them, if present) into the responses handlers
/// return. The `IntoResponse` impl is the exit point of the HTTP layer and
/// the one place request errors get logged.
#[derive(Debug)]
pub struct HttpResponseError {
    trace: anyhow::Error,
    status_code: StatusCode,
    error_code: String,
    msg: String,
}

#[derive(Serialize, Deserialize)]
pub struct ResponseErrorMessage {
    pub code: String,
    pub message: String,
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        errors::report_error(&self.trace);
        (
            self.status_code,
            axum::Json(ResponseErrorMessage {
                code: self.error_code,
                message: self.msg,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> HttpResponseError {
        Self {
            status_code: err.http_status(),
            error_code: err.short_msg().to_string(),
            msg: err.msg().to_string(),
            trace: err,
        }
    }
}

impl From<HttpResponseError> for anyhow::Error {
    fn from(value: HttpResponseError) -> Self {
        value.trace
    }
}
