//! Object store wire surface (hybrid REST dialect).
//!
//! Objects are addressed as `/{bucket}/{key}`; bucket-level listing hangs
//! off `GET /{bucket}`. Successes answer raw bytes or XML listings; errors
//! use the XML envelope.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use nimbus_core::EmulatorError;
use nimbus_wire::envelope::{error_response, ErrorFormat};
use nimbus_wire::xml::XmlBuilder;

use crate::bucket::ObjectBucketProvider;

type BucketState = State<Arc<ObjectBucketProvider>>;

fn xml_error(err: EmulatorError) -> Response {
    error_response(ErrorFormat::Xml, &err, &uuid::Uuid::new_v4().to_string())
}

fn user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            name.as_str()
                .strip_prefix("x-amz-meta-")
                .map(|meta_key| (meta_key.to_string(), value.to_str().unwrap_or("").to_string()))
        })
        .collect()
}

async fn put_object(
    State(provider): BucketState,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match provider
        .put_object(&bucket, &key, body.to_vec(), content_type, user_metadata(&headers))
        .await
    {
        Ok(meta) => Response::builder()
            .status(StatusCode::OK)
            .header("etag", format!("\"{}\"", meta.etag))
            .body(Body::empty())
            .expect("put response"),
        Err(err) => xml_error(err),
    }
}

async fn get_object(
    State(provider): BucketState,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match provider.get_object(&bucket, &key).await {
        Ok(Some(object)) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", &object.meta.content_type)
            .header("etag", format!("\"{}\"", object.meta.etag))
            .header("last-modified", &object.meta.last_modified)
            .body(Body::from(object.body))
            .expect("get response"),
        Ok(None) => xml_error(EmulatorError::NotFound(format!(
            "no such key: {bucket}/{key}"
        ))),
        Err(err) => xml_error(err),
    }
}

async fn head_object(
    State(provider): BucketState,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match provider.head_object(&bucket, &key).await {
        Ok(Some(meta)) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", &meta.content_type)
            .header("etag", format!("\"{}\"", meta.etag))
            .header("content-length", meta.size.to_string())
            .body(Body::empty())
            .expect("head response"),
        Ok(None) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .expect("head response"),
        Err(err) => xml_error(err),
    }
}

async fn delete_object(
    State(provider): BucketState,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match provider.delete_object(&bucket, &key).await {
        Ok(_) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("delete response"),
        Err(err) => xml_error(err),
    }
}

async fn list_objects(
    State(provider): BucketState,
    Path(bucket): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let max_keys: usize = params
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let token = params.get("continuation-token").map(String::as_str);

    match provider.list_objects(&bucket, &prefix, max_keys, token).await {
        Ok(listing) => {
            let mut xml = XmlBuilder::new();
            xml.open("ListBucketResult");
            xml.leaf("Name", &bucket);
            xml.leaf("Prefix", &prefix);
            xml.leaf("KeyCount", &listing.contents.len().to_string());
            xml.leaf("IsTruncated", if listing.is_truncated { "true" } else { "false" });
            if let Some(next) = &listing.next_token {
                xml.leaf("NextContinuationToken", next);
            }
            for object in &listing.contents {
                xml.open("Contents");
                xml.leaf("Key", &object.key);
                xml.leaf("Size", &object.size.to_string());
                xml.leaf("ETag", &format!("\"{}\"", object.etag));
                xml.leaf("LastModified", &object.last_modified);
                xml.close("Contents");
            }
            xml.close("ListBucketResult");
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/xml")
                .body(Body::from(xml.finish()))
                .expect("list response")
        }
        Err(err) => xml_error(err),
    }
}

/// Build the object store app.
pub fn create_bucket_app(provider: Arc<ObjectBucketProvider>) -> Router {
    Router::new()
        .route("/{bucket}", get(list_objects))
        .route(
            "/{bucket}/{*key}",
            get(get_object)
                .put(put_object)
                .delete(delete_object)
                .head(head_object),
        )
        .with_state(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use nimbus_core::Provider;
    use nimbus_store::ObjectStore;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app(dir: &std::path::Path) -> Router {
        let provider = Arc::new(ObjectBucketProvider::new(
            ObjectStore::new(dir.join("obj")),
            Duration::ZERO,
        ));
        provider.create_bucket("photos").unwrap();
        provider.start().await.unwrap();
        create_bucket_app(provider)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(ct) = content_type {
            builder = builder.header("content-type", ct);
        }
        let response = router
            .clone()
            .oneshot(builder.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, bytes.to_vec())
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(dir.path()).await;

        let (status, headers, _) = send(
            &router,
            "PUT",
            "/photos/cats/a.jpg",
            b"jpeg".to_vec(),
            Some("image/jpeg"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get("etag").is_some());

        let (status, headers, body) =
            send(&router, "GET", "/photos/cats/a.jpg", Vec::new(), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "image/jpeg");
        assert_eq!(body, b"jpeg");

        let (status, _, _) = send(&router, "DELETE", "/photos/cats/a.jpg", Vec::new(), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, body) = send(&router, "GET", "/photos/cats/a.jpg", Vec::new(), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("<Code>ResourceNotFoundException</Code>"));
    }

    #[tokio::test]
    async fn listing_is_xml_with_pagination_fields() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(dir.path()).await;
        for key in ["logs/a", "logs/b", "img/c"] {
            send(&router, "PUT", &format!("/photos/{key}"), b"x".to_vec(), None).await;
        }

        let (status, _, body) =
            send(&router, "GET", "/photos?prefix=logs/&max-keys=1", Vec::new(), None).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("<ListBucketResult>"));
        assert!(text.contains("<Key>logs/a</Key>"));
        assert!(text.contains("<IsTruncated>true</IsTruncated>"));
        assert!(text.contains("<NextContinuationToken>logs/a</NextContinuationToken>"));
    }

    #[tokio::test]
    async fn unknown_bucket_is_xml_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(dir.path()).await;
        let (status, _, body) = send(&router, "GET", "/ghost/key", Vec::new(), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(String::from_utf8(body).unwrap().contains("no such bucket"));
    }
}
