//! Request/response over two queues

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wq_common::{
    headers, AdditionalMessageData, CancellationToken, CorrelationId, Message, ReceivedMessage,
};
use wq_transport::{MessageContext, MessageReceiver, WorkerNotification};

use crate::error::ConsumerError;
use crate::producer::ProducerQueue;
use crate::Result;

/// Sends a request and blocks until the matching response arrives.
///
/// Calls are serialized, so any response whose correlation id does not match
/// belongs to an earlier call that already timed out and is discarded.
pub struct RpcQueue {
    requests: ProducerQueue,
    responses: Arc<dyn MessageReceiver>,
    response_queue: String,
    poll_interval: Duration,
    cancel: CancellationToken,
    call_lock: Mutex<()>,
}

impl RpcQueue {
    pub fn new(
        requests: ProducerQueue,
        responses: Arc<dyn MessageReceiver>,
        response_queue: impl Into<String>,
    ) -> Self {
        Self {
            requests,
            responses,
            response_queue: response_queue.into(),
            poll_interval: Duration::from_millis(10),
            cancel: CancellationToken::new(),
            call_lock: Mutex::new(()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn send(&self, request: Message, timeout: Duration) -> Result<ReceivedMessage> {
        let _call = self.call_lock.lock();
        let correlation_id = CorrelationId::generate();
        let data = AdditionalMessageData::new()
            .with_correlation_id(correlation_id.clone())
            .with_header(headers::REPLY_TO, self.response_queue.clone());
        let sent = self.requests.send(request, data)?;
        debug!(
            message_id = %sent.message_id,
            correlation_id = %correlation_id,
            reply_to = %self.response_queue,
            "RPC request sent"
        );

        let deadline = Instant::now() + timeout;
        loop {
            let mut ctx = self.context();
            match self.responses.receive(&mut ctx)? {
                Some(response) if response.correlation_id == correlation_id => {
                    ctx.commit()?;
                    return Ok(response);
                }
                Some(stale) => {
                    warn!(
                        message_id = %stale.id,
                        correlation_id = %stale.correlation_id,
                        "Discarding response for an earlier request"
                    );
                    ctx.commit()?;
                    continue;
                }
                None => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConsumerError::RpcTimeout(timeout));
            }
            thread::sleep(remaining.min(self.poll_interval));
        }
    }

    fn context(&self) -> MessageContext {
        MessageContext::new(Arc::new(WorkerNotification::new(
            "rpc",
            self.response_queue.clone(),
            self.cancel.child_token(),
            self.cancel.clone(),
            true,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wq_transport::InMemoryTransport;

    #[test]
    fn test_times_out_without_response() {
        let requests = Arc::new(InMemoryTransport::new("requests"));
        let responses = Arc::new(InMemoryTransport::new("responses"));
        let rpc = RpcQueue::new(ProducerQueue::new(requests.clone(), "requests"), responses, "responses")
            .with_poll_interval(Duration::from_millis(2));

        let started = Instant::now();
        let err = rpc.send(Message::new("ping"), Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, ConsumerError::RpcTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(requests.waiting_count(), 1);
    }

    #[test]
    fn test_stale_responses_are_discarded() {
        let requests = Arc::new(InMemoryTransport::new("requests"));
        let responses = Arc::new(InMemoryTransport::new("responses"));
        ProducerQueue::new(responses.clone(), "responses")
            .send(
                Message::new("late"),
                AdditionalMessageData::new().with_correlation_id(CorrelationId::from("old-call")),
            )
            .unwrap();

        let rpc = RpcQueue::new(ProducerQueue::new(requests, "requests"), responses.clone(), "responses")
            .with_poll_interval(Duration::from_millis(2));
        assert!(rpc.send(Message::new("ping"), Duration::from_millis(20)).is_err());
        assert_eq!(responses.waiting_count(), 0);
        assert_eq!(responses.committed().len(), 1);
    }
}
