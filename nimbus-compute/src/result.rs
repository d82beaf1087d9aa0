//! Child output parsing.
//!
//! A well-formed child emits `{"result": <payload>}` on success or
//! `{"error": {"errorMessage", "errorType", "stackTrace"}}` on handler
//! failure. Anything else becomes a parse-error result with the raw bytes
//! preserved so the developer can see what the child actually printed.

use std::time::Duration;

use serde_json::Value;

use nimbus_core::{InvocationErrorKind, InvocationResult};

/// Parse the bytes a child wrote to stdout into an invocation result.
pub fn parse_child_output(raw: &[u8], duration: Duration, request_id: &str) -> InvocationResult {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();

    let parsed: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => {
            return InvocationResult::failure(
                InvocationErrorKind::ParseError,
                format!("failed to parse function output: {trimmed:?}"),
                duration,
                request_id,
            )
        }
    };

    if let Some(error) = parsed.get("error") {
        let message = error
            .get("errorMessage")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return InvocationResult::failure(
            InvocationErrorKind::Handler,
            message,
            duration,
            request_id,
        );
    }

    let payload = parsed.get("result").cloned().unwrap_or(Value::Null);
    InvocationResult::success(payload, duration, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: &[u8]) -> InvocationResult {
        parse_child_output(raw, Duration::from_millis(5), "req-1")
    }

    #[test]
    fn success_payload_is_extracted() {
        let result = parse(br#"{"result": {"statusCode": 200}}"#);
        assert!(result.is_success());
        assert_eq!(result.payload(), Some(&json!({"statusCode": 200})));
    }

    #[test]
    fn error_payload_becomes_handler_error() {
        let result = parse(
            br#"{"error": {"errorMessage": "boom", "errorType": "ValueError", "stackTrace": []}}"#,
        );
        let error = result.error().unwrap();
        assert_eq!(error.kind, InvocationErrorKind::Handler);
        assert_eq!(error.message, "boom");
    }

    #[test]
    fn error_without_message_keeps_whole_descriptor() {
        let result = parse(br#"{"error": "just a string"}"#);
        assert_eq!(result.error().unwrap().message, "\"just a string\"");
    }

    #[test]
    fn malformed_output_preserves_raw_bytes() {
        let result = parse(b"Traceback (most recent call last): ...");
        let error = result.error().unwrap();
        assert_eq!(error.kind, InvocationErrorKind::ParseError);
        assert!(error.message.contains("Traceback"));
    }

    #[test]
    fn missing_result_key_is_null_payload() {
        let result = parse(b"{}");
        assert!(result.is_success());
        assert_eq!(result.payload(), Some(&Value::Null));
    }
}
