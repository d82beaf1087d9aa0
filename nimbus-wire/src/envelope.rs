//! Error envelopes.
//!
//! JSON dialects answer errors as `{"__type": code, "message": text}`; XML
//! dialects answer `<ErrorResponse><Error>...</Error></ErrorResponse>`.
//! Dispatchers take the format as a parameter so services that speak both
//! (the object-store management subset, for instance) share one code path.
//! Every error response carries the request identifier.

use axum::http::{header, StatusCode};
use axum::response::Response;
use serde_json::json;

use nimbus_core::EmulatorError;

use crate::xml::XmlBuilder;

/// Which envelope a dispatcher emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Json,
    Xml,
}

/// Header carrying the request identifier on every response.
pub const REQUEST_ID_HEADER: &str = "x-amzn-requestid";

/// Render an error into the dialect's native envelope.
pub fn error_response(format: ErrorFormat, error: &EmulatorError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match format {
        ErrorFormat::Json => {
            let body = json!({
                "__type": error.code(),
                "message": error.message(),
            });
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/x-amz-json-1.0")
                .header(REQUEST_ID_HEADER, request_id)
                .body(axum::body::Body::from(body.to_string()))
                .expect("error response")
        }
        ErrorFormat::Xml => {
            let mut xml = XmlBuilder::new();
            xml.open("ErrorResponse");
            xml.open("Error");
            xml.leaf("Code", error.code());
            xml.leaf("Message", error.message());
            xml.close("Error");
            xml.leaf("RequestId", request_id);
            xml.close("ErrorResponse");
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "text/xml")
                .header(REQUEST_ID_HEADER, request_id)
                .body(axum::body::Body::from(xml.finish()))
                .expect("error response")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_text(response: Response) -> (StatusCode, String) {
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn json_envelope_carries_type_and_message() {
        let err = EmulatorError::NotFound("no such queue: q".into());
        let resp = error_response(ErrorFormat::Json, &err, "req-1");
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "req-1");
        let (status, body) = body_text(resp).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["__type"], "ResourceNotFoundException");
        assert_eq!(parsed["message"], "no such queue: q");
    }

    #[tokio::test]
    async fn xml_envelope_carries_code_and_request_id() {
        let err = EmulatorError::Validation("bad value".into());
        let resp = error_response(ErrorFormat::Xml, &err, "req-2");
        let (status, body) = body_text(resp).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("<Code>ValidationException</Code>"));
        assert!(body.contains("<Message>bad value</Message>"));
        assert!(body.contains("<RequestId>req-2</RequestId>"));
    }
}
