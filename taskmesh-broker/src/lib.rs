pub mod amqp;
pub mod error;
pub mod payload;

pub use amqp::AmqpBroker;
pub use error::BrokerError;
pub use payload::{ScriptData, Step, TaskPayload};

use async_trait::async_trait;
use std::pin::Pin;
use taskmesh_common::ids::WorkerId;
use tokio_stream::Stream;

/// A single inbound delivery, carrying the parsed payload and the means to
/// settle it. Exactly one of `ack`/`nack` must be called per delivery (§8,
/// property 5) — dropping a `Delivery` without settling it leaves the
/// underlying AMQP delivery tag unacked and the message is redelivered once
/// the channel resets.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &TaskPayload;
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Box<dyn Delivery>, BrokerError>> + Send>>;

/// The broker adapter's contract (C2). One implementation (`AmqpBroker`)
/// backs production; `taskmesh-test-support` provides an in-memory fake for
/// dispatcher/worker tests that never touch a real AMQP server.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the per-worker topology (durable queue bound by routing key
    /// `executor.{uuid}`) if it does not already exist. Idempotent.
    async fn declare_worker_queue(&self, worker: WorkerId) -> Result<(), BrokerError>;

    /// Publishes a task payload to the given worker's queue with persistent
    /// delivery mode. Reconnects with backoff on connection loss before
    /// giving up.
    async fn publish(&self, worker: WorkerId, payload: &TaskPayload) -> Result<(), BrokerError>;

    /// Begins consuming the given worker's queue with `prefetch_count = 1`.
    /// Returns a stream of deliveries that must each be acked or nacked.
    async fn consume(&self, worker: WorkerId) -> Result<DeliveryStream, BrokerError>;

    /// SPEC_FULL §10.6's clear-queue tool: drops every message currently
    /// sitting in `worker`'s queue. Operator-invoked only (the worker's
    /// `--purge` flag), never called from the normal dispatch/intake path.
    async fn purge_worker_queue(&self, worker: WorkerId) -> Result<u32, BrokerError>;
}
