//! Send-side façade

use std::sync::Arc;
use tracing::debug;
use wq_common::{headers, AdditionalMessageData, CorrelationId, Message, MessageId, ReceivedMessage};
use wq_transport::MessageSender;

use crate::consumer_metrics;
use crate::error::ConsumerError;
use crate::Result;

/// Identity of a message accepted by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOutputMessage {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
}

pub struct ProducerQueue {
    sender: Arc<dyn MessageSender>,
    queue_name: String,
}

impl ProducerQueue {
    pub fn new(sender: Arc<dyn MessageSender>, queue_name: impl Into<String>) -> Self {
        Self {
            sender,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Enqueue one message. A correlation id is generated when `data` has none.
    pub fn send(&self, message: Message, data: AdditionalMessageData) -> Result<QueueOutputMessage> {
        let data = stamp(data);
        let correlation_id = data.correlation_id.clone().unwrap_or_default();
        let message_id = self.sender.send(message, &data)?;

        consumer_metrics::record_message_sent(&self.queue_name);
        debug!(
            queue = %self.queue_name,
            message_id = %message_id,
            correlation_id = %correlation_id,
            "Message sent"
        );
        Ok(QueueOutputMessage {
            message_id,
            correlation_id,
        })
    }

    pub fn send_batch(&self, messages: Vec<(Message, AdditionalMessageData)>) -> Result<Vec<QueueOutputMessage>> {
        let stamped: Vec<(Message, AdditionalMessageData)> = messages
            .into_iter()
            .map(|(message, data)| (message, stamp(data)))
            .collect();
        let correlation_ids: Vec<CorrelationId> = stamped
            .iter()
            .map(|(_, data)| data.correlation_id.clone().unwrap_or_default())
            .collect();

        let ids = self.sender.send_batch(stamped)?;
        for _ in &ids {
            consumer_metrics::record_message_sent(&self.queue_name);
        }
        debug!(queue = %self.queue_name, count = ids.len(), "Batch sent");

        Ok(ids
            .into_iter()
            .zip(correlation_ids)
            .map(|(message_id, correlation_id)| QueueOutputMessage {
                message_id,
                correlation_id,
            })
            .collect())
    }

    /// Answer an RPC request. This producer must target the request's reply-to queue.
    pub fn reply(&self, request: &ReceivedMessage, response: Message) -> Result<QueueOutputMessage> {
        match request.header(headers::REPLY_TO) {
            Some(reply_to) if reply_to == self.queue_name => {}
            Some(reply_to) => {
                return Err(ConsumerError::InvalidConfiguration(format!(
                    "request expects a reply on '{reply_to}', producer sends to '{}'",
                    self.queue_name
                )))
            }
            None => {
                return Err(ConsumerError::InvalidConfiguration(format!(
                    "message {} has no reply-to header",
                    request.id
                )))
            }
        }
        self.send(
            response,
            AdditionalMessageData::new().with_correlation_id(request.correlation_id.clone()),
        )
    }
}

fn stamp(mut data: AdditionalMessageData) -> AdditionalMessageData {
    if data.correlation_id.is_none() {
        data.correlation_id = Some(CorrelationId::generate());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use wq_common::CancellationToken;
    use wq_transport::{InMemoryTransport, MessageContext, MessageReceiver, WorkerNotification};

    fn receive(transport: &InMemoryTransport) -> ReceivedMessage {
        let cancel = CancellationToken::new();
        let mut ctx = MessageContext::new(Arc::new(WorkerNotification::new(
            "test",
            "test-queue",
            cancel.child_token(),
            cancel,
            true,
        )));
        let message = transport.receive(&mut ctx).unwrap().unwrap();
        ctx.commit().unwrap();
        message
    }

    #[test]
    fn test_send_generates_or_keeps_correlation_id() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let producer = ProducerQueue::new(transport.clone(), "orders");

        let generated = producer.send(Message::new("a"), AdditionalMessageData::new()).unwrap();
        let kept = producer
            .send(
                Message::new("b"),
                AdditionalMessageData::new().with_correlation_id(CorrelationId::from("order-42")),
            )
            .unwrap();
        assert_eq!(kept.correlation_id, CorrelationId::from("order-42"));

        let first = receive(&transport);
        assert_eq!(first.id, generated.message_id);
        assert_eq!(first.correlation_id, generated.correlation_id);
        assert_eq!(first.header(headers::CORRELATION_ID), Some(generated.correlation_id.as_str()));
        assert_eq!(receive(&transport).correlation_id, CorrelationId::from("order-42"));
    }

    #[test]
    fn test_send_batch_returns_one_output_per_message() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let producer = ProducerQueue::new(transport.clone(), "orders");
        let outputs = producer
            .send_batch(vec![
                (Message::new("a"), AdditionalMessageData::new()),
                (Message::new("b"), AdditionalMessageData::new()),
            ])
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_ne!(outputs[0].correlation_id, outputs[1].correlation_id);
        assert_eq!(transport.waiting_count(), 2);
    }

    #[test]
    fn test_reply_requires_matching_reply_to() {
        let requests = Arc::new(InMemoryTransport::new("requests"));
        let responses = Arc::new(InMemoryTransport::new("responses"));
        ProducerQueue::new(requests.clone(), "requests")
            .send(
                Message::new("ping"),
                AdditionalMessageData::new()
                    .with_correlation_id(CorrelationId::from("call-1"))
                    .with_header(headers::REPLY_TO, "responses"),
            )
            .unwrap();
        let request = receive(&requests);

        let wrong = ProducerQueue::new(requests.clone(), "requests");
        assert!(wrong.reply(&request, Message::new("pong")).is_err());

        let replier = ProducerQueue::new(responses.clone(), "responses");
        let output = replier.reply(&request, Message::new("pong")).unwrap();
        assert_eq!(output.correlation_id, CorrelationId::from("call-1"));
        assert_eq!(receive(&responses).correlation_id, CorrelationId::from("call-1"));
    }
}
