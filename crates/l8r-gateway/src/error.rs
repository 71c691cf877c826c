use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use l8r_common::Error;
use serde_json::{Value, json};
use tracing::error;

pub const CHAT_FAILURE: &str = "Failed to process chat request";

/// An error response: status plus a JSON body with at least an `error` field.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Chat failures collapse to a generic 500. Shape errors in the inbound
    /// history stay client errors.
    pub fn chat(err: &Error, expose_details: bool) -> Self {
        if let Error::InvalidInput(msg) = err {
            return Self::bad_request(msg.clone());
        }
        error!("chat request failed: {err}");
        let mut body = json!({ "error": CHAT_FAILURE });
        if expose_details {
            body["message"] = Value::String(err.to_string());
        }
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Tool(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => {
                error!("request failed: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.user_message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        let cases = [
            (Error::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("Order not found".into()), StatusCode::NOT_FOUND),
            (
                Error::Tool("Can only retry failed payments".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                Error::Database("disk full".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn chat_errors_hide_detail_unless_exposed() {
        let err = Error::Agent("openai API error: status=500".into());
        let hidden = ApiError::chat(&err, false);
        assert_eq!(hidden.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(hidden.body, json!({ "error": CHAT_FAILURE }));

        let shown = ApiError::chat(&err, true);
        assert_eq!(
            shown.body["message"],
            "agent error: openai API error: status=500"
        );
    }
}
