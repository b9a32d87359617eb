//! An in-memory stand-in for [`taskmesh_broker::Broker`] used by dispatcher
//! and worker-agent tests, so neither needs a real AMQP server. Unlike the
//! AMQP adapter it can actually simulate `nack(requeue=true)` putting a
//! message back on the same worker's queue (S5), which is the one behavior
//! tests most often need to assert on.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use taskmesh_broker::{Broker, BrokerError, Delivery, DeliveryStream, TaskPayload};
use taskmesh_common::ids::{TaskId, WorkerId};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked(TaskId),
    Nacked(TaskId, bool),
}

struct Inner {
    queues: Mutex<HashMap<WorkerId, VecDeque<TaskPayload>>>,
    senders: Mutex<HashMap<WorkerId, mpsc::UnboundedSender<TaskPayload>>>,
    log: Mutex<Vec<Outcome>>,
}

#[derive(Clone)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                senders: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, worker: WorkerId, payload: TaskPayload) {
        let senders = self.inner.senders.lock().unwrap();
        if let Some(sender) = senders.get(&worker) {
            if sender.send(payload).is_ok() {
                return;
            }
        }
        drop(senders);
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(worker)
            .or_default()
            .push_back(payload);
    }

    /// Outcomes recorded so far, in order, for assertions like "exactly one
    /// ack or nack per delivery" (§8 property 5).
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn pending_count(&self, worker: WorkerId) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(&worker)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn declare_worker_queue(&self, worker: WorkerId) -> Result<(), BrokerError> {
        self.inner.queues.lock().unwrap().entry(worker).or_default();
        Ok(())
    }

    async fn publish(&self, worker: WorkerId, payload: &TaskPayload) -> Result<(), BrokerError> {
        self.deliver(worker, payload.clone());
        Ok(())
    }

    async fn consume(&self, worker: WorkerId) -> Result<DeliveryStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut queues = self.inner.queues.lock().unwrap();
            if let Some(backlog) = queues.get_mut(&worker) {
                while let Some(payload) = backlog.pop_front() {
                    let _ = tx.send(payload);
                }
            }
        }
        self.inner.senders.lock().unwrap().insert(worker, tx);

        let broker = self.clone();
        let stream = UnboundedReceiverStream::new(rx).map(move |payload| {
            Ok(Box::new(FakeDelivery {
                payload,
                worker,
                broker: broker.clone(),
            }) as Box<dyn Delivery>)
        });

        Ok(Box::pin(stream))
    }

    async fn purge_worker_queue(&self, worker: WorkerId) -> Result<u32, BrokerError> {
        let mut queues = self.inner.queues.lock().unwrap();
        let purged = queues.get(&worker).map(VecDeque::len).unwrap_or(0);
        queues.insert(worker, VecDeque::new());
        Ok(purged as u32)
    }
}

struct FakeDelivery {
    payload: TaskPayload,
    worker: WorkerId,
    broker: FakeBroker,
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker
            .inner
            .log
            .lock()
            .unwrap()
            .push(Outcome::Acked(self.payload.task_id));
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.broker
            .inner
            .log
            .lock()
            .unwrap()
            .push(Outcome::Nacked(self.payload.task_id, requeue));
        if requeue {
            self.broker.deliver(self.worker, self.payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use taskmesh_broker::ScriptData;
    use taskmesh_common::ids::ScriptId;

    fn payload(task: TaskId) -> TaskPayload {
        TaskPayload {
            task_id: task,
            execution_id: taskmesh_common::ids::ExecutionId::new_v4(),
            browser_type: "chromium".to_string(),
            timeout: 60,
            variables: Map::new(),
            script_data: ScriptData {
                script_id: ScriptId::new_v4(),
                name: "s".to_string(),
                description: String::new(),
                script_type: "ui".to_string(),
                framework: "playwright".to_string(),
                steps: vec![],
                variables: Map::new(),
                timeout: 60,
                project_id: None,
            },
            parent_execution_id: None,
            mode: None,
            script_index: None,
            total_scripts: None,
            plan_scripts: vec![],
        }
    }

    #[tokio::test]
    async fn requeued_nack_is_redelivered_to_the_same_worker() {
        let broker = FakeBroker::new();
        let worker = WorkerId::new_v4();
        let task = TaskId::new_v4();

        broker.publish(worker, &payload(task)).await.unwrap();

        let mut stream = broker.consume(worker).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.nack(true).await.unwrap();

        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload().task_id, task);
        assert_eq!(
            broker.outcomes(),
            vec![Outcome::Nacked(task, true)]
        );
    }

    #[tokio::test]
    async fn acked_delivery_is_not_redelivered() {
        let broker = FakeBroker::new();
        let worker = WorkerId::new_v4();
        let task = TaskId::new_v4();

        broker.publish(worker, &payload(task)).await.unwrap();
        let mut stream = broker.consume(worker).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.ack().await.unwrap();

        assert_eq!(broker.pending_count(worker), 0);
        assert_eq!(broker.outcomes(), vec![Outcome::Acked(task)]);
    }

    #[tokio::test]
    async fn purge_drops_everything_still_queued() {
        let broker = FakeBroker::new();
        let worker = WorkerId::new_v4();
        broker.publish(worker, &payload(TaskId::new_v4())).await.unwrap();
        broker.publish(worker, &payload(TaskId::new_v4())).await.unwrap();

        let purged = broker.purge_worker_queue(worker).await.unwrap();

        assert_eq!(purged, 2);
        assert_eq!(broker.pending_count(worker), 0);
    }
}
