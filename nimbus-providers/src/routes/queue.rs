//! Queue wire surface (query-action dialect, XML envelopes).

use std::sync::Arc;

use axum::Router;
use serde_json::json;

use nimbus_core::EmulatorError;
use nimbus_wire::query::ActionParams;
use nimbus_wire::xml::{escape, XmlBuilder};
use nimbus_wire::QueryDispatcher;

use crate::queue::{MessageQueueProvider, QueueConfig};

const XMLNS: &str = "http://queue.amazonaws.com/doc/2012-11-05/";

fn queue_url(base_port: u16, queue_name: &str) -> String {
    format!("http://localhost:{base_port}/000000000000/{queue_name}")
}

/// Queue name from a queue URL (its last path segment) or a bare name.
fn queue_name_param(params: &ActionParams) -> Result<String, EmulatorError> {
    if let Some(url) = params.get("QueueUrl") {
        let name = url.rsplit('/').next().unwrap_or(url);
        return Ok(name.to_string());
    }
    params
        .get("QueueName")
        .cloned()
        .ok_or_else(|| EmulatorError::Validation("missing QueueUrl or QueueName".into()))
}

/// Build the queue service app.
pub fn create_queue_app(provider: Arc<MessageQueueProvider>, port: u16) -> Router {
    let mut dispatcher = QueryDispatcher::new(XMLNS);

    let for_create = provider.clone();
    dispatcher.register("CreateQueue", move |params, _ctx| {
        let provider = for_create.clone();
        async move {
            let name = params
                .get("QueueName")
                .cloned()
                .ok_or_else(|| EmulatorError::Validation("missing QueueName".into()))?;
            let mut config = QueueConfig::new(&name);
            if name.ends_with(".fifo") {
                config = config.fifo();
            }
            match provider.create_queue(config) {
                // CreateQueue is idempotent on the wire.
                Ok(()) | Err(EmulatorError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
            Ok(format!("<QueueUrl>{}</QueueUrl>", escape(&queue_url(port, &name))))
        }
    });

    let for_get_url = provider.clone();
    dispatcher.register("GetQueueUrl", move |params, _ctx| {
        let provider = for_get_url.clone();
        async move {
            let name = queue_name_param(&params)?;
            if !provider.list_queues().contains(&name) {
                return Err(EmulatorError::NotFound(format!("no such queue: {name}")));
            }
            Ok(format!("<QueueUrl>{}</QueueUrl>", escape(&queue_url(port, &name))))
        }
    });

    let for_list = provider.clone();
    dispatcher.register("ListQueues", move |_params, _ctx| {
        let provider = for_list.clone();
        async move {
            let mut xml = XmlBuilder::new();
            for name in provider.list_queues() {
                xml.leaf("QueueUrl", &queue_url(port, &name));
            }
            Ok(xml.finish())
        }
    });

    let for_send = provider.clone();
    dispatcher.register("SendMessage", move |params, _ctx| {
        let provider = for_send.clone();
        async move {
            let name = queue_name_param(&params)?;
            let body = params
                .get("MessageBody")
                .cloned()
                .ok_or_else(|| EmulatorError::Validation("missing MessageBody".into()))?;
            let group_id = params.get("MessageGroupId").cloned();
            let dedup_id = params.get("MessageDeduplicationId").cloned();
            let message_id =
                provider.send_message(&name, body.clone(), json!({}), group_id, dedup_id)?;

            let mut xml = XmlBuilder::new();
            xml.leaf("MessageId", &message_id);
            xml.leaf("MD5OfMessageBody", &format!("{:x}", md5::compute(body.as_bytes())));
            Ok(xml.finish())
        }
    });

    let for_receive = provider.clone();
    dispatcher.register("ReceiveMessage", move |params, _ctx| {
        let provider = for_receive.clone();
        async move {
            let name = queue_name_param(&params)?;
            let max = params
                .get("MaxNumberOfMessages")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1usize);
            let batch = provider.receive_messages(&name, max)?;

            let mut xml = XmlBuilder::new();
            for message in batch {
                xml.open("Message");
                xml.leaf("MessageId", &message.message_id);
                xml.leaf("ReceiptHandle", &message.receipt_handle);
                xml.leaf("MD5OfBody", &format!("{:x}", md5::compute(message.body.as_bytes())));
                xml.leaf("Body", &message.body);
                for (attr_name, attr_value) in &message.attributes {
                    xml.open("Attribute");
                    xml.leaf("Name", attr_name);
                    xml.leaf("Value", attr_value);
                    xml.close("Attribute");
                }
                xml.close("Message");
            }
            Ok(xml.finish())
        }
    });

    let for_delete = provider.clone();
    dispatcher.register("DeleteMessage", move |params, _ctx| {
        let provider = for_delete.clone();
        async move {
            let name = queue_name_param(&params)?;
            let receipt = params
                .get("ReceiptHandle")
                .cloned()
                .ok_or_else(|| EmulatorError::Validation("missing ReceiptHandle".into()))?;
            provider.delete_message(&name, &receipt)?;
            Ok(String::new())
        }
    });

    let for_purge = provider.clone();
    dispatcher.register("PurgeQueue", move |params, _ctx| {
        let provider = for_purge.clone();
        async move {
            let name = queue_name_param(&params)?;
            provider.purge_queue(&name)?;
            Ok(String::new())
        }
    });

    dispatcher.into_router()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use nimbus_core::Provider;
    use tower::ServiceExt;

    async fn app() -> Router {
        let provider = Arc::new(MessageQueueProvider::new(None));
        provider.create_queue(QueueConfig::new("jobs")).unwrap();
        provider.start().await.unwrap();
        create_queue_app(provider, 4601)
    }

    async fn post_form(router: &Router, form: String) -> (u16, String) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(axum::body::Body::from(form))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn send_receive_delete_over_the_wire() {
        let router = app().await;

        let (status, sent) = post_form(
            &router,
            "Action=SendMessage&QueueUrl=http://localhost:4601/000000000000/jobs&MessageBody=hello"
                .to_string(),
        )
        .await;
        assert_eq!(status, 200);
        assert!(sent.contains("<MessageId>"));
        assert!(sent.contains("<MD5OfMessageBody>"));

        let (status, received) = post_form(
            &router,
            "Action=ReceiveMessage&QueueUrl=http://x/jobs&MaxNumberOfMessages=10".to_string(),
        )
        .await;
        assert_eq!(status, 200);
        assert!(received.contains("<Body>hello</Body>"));

        let receipt = received
            .split("<ReceiptHandle>")
            .nth(1)
            .unwrap()
            .split("</ReceiptHandle>")
            .next()
            .unwrap()
            .to_string();
        let (status, _) = post_form(
            &router,
            format!("Action=DeleteMessage&QueueUrl=http://x/jobs&ReceiptHandle={receipt}"),
        )
        .await;
        assert_eq!(status, 200);

        let (_, empty) = post_form(
            &router,
            "Action=ReceiveMessage&QueueUrl=http://x/jobs".to_string(),
        )
        .await;
        assert!(!empty.contains("<Message>"));
    }

    #[tokio::test]
    async fn unknown_queue_is_xml_error() {
        let router = app().await;
        let (status, body) = post_form(
            &router,
            "Action=SendMessage&QueueUrl=http://x/ghost&MessageBody=m".to_string(),
        )
        .await;
        assert_eq!(status, 404);
        assert!(body.contains("<Code>ResourceNotFoundException</Code>"));
    }

    #[tokio::test]
    async fn create_queue_is_idempotent() {
        let router = app().await;
        let (status, body) =
            post_form(&router, "Action=CreateQueue&QueueName=jobs".to_string()).await;
        assert_eq!(status, 200);
        assert!(body.contains("/000000000000/jobs"));
    }
}
