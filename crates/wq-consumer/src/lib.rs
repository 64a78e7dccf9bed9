//! WorkQueue consumer engine
//!
//! A pool of polling workers, each on its own OS thread, that receive one
//! message at a time from a transport, run the user handler and commit or
//! roll back. Around that loop sit:
//!
//! - backoff when the queue is empty or the transport fails ([`QueueWait`])
//! - a pause gate that parks secondary workers while the pool is idle
//! - per-message heartbeats on a dedicated thread pool
//! - a retry policy and error store routing for failed messages
//! - background monitors reclaiming stalled and expired messages
//! - a graceful shutdown ladder (stop, cancel, abandon or wait)

pub mod cancel_work;
pub mod collection;
pub mod consumer_metrics;
pub mod consumer_queue;
pub mod error;
pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod monitor;
pub mod notification;
pub mod primary;
pub mod processing;
pub mod producer;
pub mod queue_wait;
pub mod retry;
pub mod rpc;
pub mod stop;
pub mod wait_gate;
pub mod worker;

pub use cancel_work::{DisposeGuard, QueueCancelWork};
pub use collection::WorkerCollection;
pub use consumer_queue::{ConsumerQueue, ConsumerQueueAsync};
pub use error::{ConsumerError, Result};
pub use events::{ConsumerEvents, ProcessingFailure, WorkerEvent};
pub use handler::{HandlerError, MessageHandler, MessageHandlerAsync};
pub use heartbeat::{HeartBeatFactory, HeartBeatThreadPool, HeartBeatWorker};
pub use monitor::{ExpiredMessageMonitor, HeartBeatMonitor, Monitor, QueueMonitor};
pub use notification::{
    CompositeConsumerNotification, ConsumerNotification, LoggingConsumerNotification,
    NoOpConsumerNotification,
};
pub use primary::PrimaryWorker;
pub use processing::{
    AsyncTaskCount, MessageProcessing, MessageProcessingAsync, MessageProcessor, ProcessingFactory,
};
pub use producer::{ProducerQueue, QueueOutputMessage};
pub use queue_wait::{QueueWait, QueueWaitFactory};
pub use retry::{RetryDecision, RetryPolicy};
pub use rpc::RpcQueue;
pub use stop::{StopOptions, StopOutcome, StopWorker};
pub use wait_gate::{WaitForEventOrCancel, WorkerWaitForEventOrCancel};
pub use worker::{Worker, WorkerState};
