//! Proxy-event transformation.
//!
//! Gateways and function URLs hand the function a JSON event describing the
//! HTTP request and turn the function's response dict back into an HTTP
//! response. Two payload formats exist: v1 (legacy REST gateways, single and
//! multi-value maps) and v2 (HTTP APIs and function URLs, comma-joined
//! values plus a cookie list).

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use nimbus_core::{EmulatorError, LOCAL_ACCOUNT_ID};

/// Which proxy payload shape a surface speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFormat {
    V1,
    V2,
}

/// The request fields the event builders consume, decoupled from any HTTP
/// framework type.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestParts {
    pub method: String,
    pub path: String,
    pub raw_query: String,
    /// Header pairs with lower-cased names, in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub source_ip: String,
    pub protocol: String,
}

impl HttpRequestParts {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == "content-type")
            .map(|(_, value)| value.as_str())
    }

    fn user_agent(&self) -> String {
        self.headers
            .iter()
            .find(|(name, _)| name == "user-agent")
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        form_urlencoded::parse(self.raw_query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// The response fields handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct HttpResponseParts {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Content types whose request bodies are base64-encoded into the event.
pub fn is_binary_content_type(content_type: &str, extra: &[String]) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if ct == "application/octet-stream"
        || ct.starts_with("image/")
        || ct.starts_with("audio/")
        || ct.starts_with("video/")
    {
        return true;
    }
    extra.iter().any(|e| {
        let e = e.to_ascii_lowercase();
        if let Some(prefix) = e.strip_suffix("/*") {
            ct.starts_with(&format!("{prefix}/"))
        } else {
            ct == e
        }
    })
}

fn encode_body(req: &HttpRequestParts, binary_types: &[String]) -> (Option<String>, bool) {
    if req.body.is_empty() {
        return (None, false);
    }
    let binary = req
        .content_type()
        .map(|ct| is_binary_content_type(ct, binary_types))
        .unwrap_or(false);
    if binary {
        return (Some(BASE64.encode(&req.body)), true);
    }
    match std::str::from_utf8(&req.body) {
        Ok(text) => (Some(text.to_string()), false),
        // Undeclared binary payloads still round-trip.
        Err(_) => (Some(BASE64.encode(&req.body)), true),
    }
}

/// Build a payload-format 1.0 event.
pub fn build_v1_event(
    req: &HttpRequestParts,
    resource: &str,
    path_params: &BTreeMap<String, String>,
    binary_types: &[String],
) -> Value {
    let mut headers = Map::new();
    let mut multi_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &req.headers {
        headers.insert(name.clone(), json!(value));
        multi_headers.entry(name.clone()).or_default().push(value.clone());
    }

    let mut query: Map<String, Value> = Map::new();
    let mut multi_query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in req.query_pairs() {
        query.insert(key.clone(), json!(value));
        multi_query.entry(key).or_default().push(value);
    }

    let (body, is_base64) = encode_body(req, binary_types);
    let query_value = if query.is_empty() {
        Value::Null
    } else {
        Value::Object(query)
    };
    let multi_query_value = if multi_query.is_empty() {
        Value::Null
    } else {
        json!(multi_query)
    };
    let path_params_value = if path_params.is_empty() {
        Value::Null
    } else {
        json!(path_params)
    };

    json!({
        "httpMethod": req.method,
        "path": req.path,
        "resource": resource,
        "headers": Value::Object(headers),
        "multiValueHeaders": multi_headers,
        "queryStringParameters": query_value,
        "multiValueQueryStringParameters": multi_query_value,
        "pathParameters": path_params_value,
        "body": body,
        "isBase64Encoded": is_base64,
        "requestContext": {
            "accountId": LOCAL_ACCOUNT_ID,
            "resourcePath": resource,
            "httpMethod": req.method,
            "identity": {"sourceIp": req.source_ip, "userAgent": req.user_agent()},
            "requestId": uuid::Uuid::new_v4().to_string(),
        },
    })
}

/// Build a payload-format 2.0 event. Function URLs pass `"$default"` as the
/// route key.
pub fn build_v2_event(
    req: &HttpRequestParts,
    route_key: &str,
    path_params: &BTreeMap<String, String>,
    binary_types: &[String],
) -> Value {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    let mut cookies: Vec<String> = Vec::new();
    for (name, value) in &req.headers {
        if name == "cookie" {
            cookies.extend(value.split("; ").map(str::to_string));
            continue;
        }
        headers
            .entry(name.clone())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }

    let mut query: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in req.query_pairs() {
        query
            .entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let (body, is_base64) = encode_body(req, binary_types);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let protocol = if req.protocol.is_empty() {
        "HTTP/1.1"
    } else {
        req.protocol.as_str()
    };

    let mut event = json!({
        "version": "2.0",
        "routeKey": route_key,
        "rawPath": req.path,
        "rawQueryString": req.raw_query,
        "headers": headers,
        "isBase64Encoded": is_base64,
        "requestContext": {
            "accountId": LOCAL_ACCOUNT_ID,
            "http": {
                "method": req.method,
                "path": req.path,
                "protocol": protocol,
                "sourceIp": req.source_ip,
                "userAgent": req.user_agent(),
            },
            "requestId": uuid::Uuid::new_v4().to_string(),
            "routeKey": route_key,
            "timeEpoch": now,
        },
    });

    let obj = event.as_object_mut().expect("event object");
    if !cookies.is_empty() {
        obj.insert("cookies".to_string(), json!(cookies));
    }
    if !query.is_empty() {
        obj.insert("queryStringParameters".to_string(), json!(query));
    }
    if !path_params.is_empty() {
        obj.insert("pathParameters".to_string(), json!(path_params));
    }
    if let Some(body) = body {
        obj.insert("body".to_string(), json!(body));
    }
    event
}

/// Turn a handler response dict into HTTP response parts.
///
/// Accepts `{statusCode, headers?, multiValueHeaders?, body?, cookies?,
/// isBase64Encoded?}`. A non-object payload becomes a 200 with the payload
/// JSON-serialized, matching gateway passthrough behaviour.
pub fn transform_handler_response(
    payload: &Value,
    format: ProxyFormat,
) -> Result<HttpResponseParts, EmulatorError> {
    let Some(obj) = payload.as_object() else {
        return Ok(HttpResponseParts {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: payload.to_string().into_bytes(),
        });
    };

    let status = match obj.get("statusCode") {
        None => 200,
        Some(Value::Number(n)) => n.as_u64().unwrap_or(200) as u16,
        Some(Value::String(s)) => s.parse().map_err(|_| {
            EmulatorError::Handler(format!("invalid statusCode in handler response: {s}"))
        })?,
        Some(other) => {
            return Err(EmulatorError::Handler(format!(
                "invalid statusCode in handler response: {other}"
            )))
        }
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(Value::Object(map)) = obj.get("headers") {
        for (name, value) in map {
            headers.push((name.to_ascii_lowercase(), value_as_header(value)));
        }
    }
    if format == ProxyFormat::V1 {
        if let Some(Value::Object(map)) = obj.get("multiValueHeaders") {
            for (name, values) in map {
                if let Value::Array(items) = values {
                    for item in items {
                        headers.push((name.to_ascii_lowercase(), value_as_header(item)));
                    }
                }
            }
        }
    }
    if format == ProxyFormat::V2 {
        if let Some(Value::Array(cookies)) = obj.get("cookies") {
            for cookie in cookies {
                headers.push(("set-cookie".to_string(), value_as_header(cookie)));
            }
        }
    }

    let raw_body = match obj.get("body") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let is_base64 = obj
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let body = if is_base64 {
        BASE64
            .decode(raw_body.as_bytes())
            .map_err(|err| EmulatorError::Handler(format!("invalid base64 body: {err}")))?
    } else {
        raw_body.into_bytes()
    };

    Ok(HttpResponseParts {
        status,
        headers,
        body,
    })
}

fn value_as_header(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
