//! Delivery task scheduling.
//!
//! Every queue with at least one consumer owns a delivery task. The task is a small driver loop on
//! the tokio runtime which submits one execution at a time to a shared, fixed-size
//! [`TaskExecQueue`] worker pool. An execution moves up to `batch_size` messages from the queue to
//! ready consumers. When an execution finds nothing to do, the driver idles for `idle_delay` or
//! until the queue signals new work, whichever comes first, instead of spinning.
//!
//! Registration and deregistration happen under the queue's consumer lock, see
//! [`QueueHandler::add_consumer`] and [`QueueHandler::remove_consumer`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_box::task_exec_queue::{Builder, SpawnExt, TaskExecQueue};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::queue::QueueHandler;
use crate::settings::Delivery as DeliveryConfig;
use crate::types::{DashMap, QueueName};
use crate::utils::Counter;
use crate::{BrokerError, Result};

struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    handler: Arc<QueueHandler>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    #[inline]
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handler.wakeup();
    }
}

struct Shared {
    running: AtomicBool,
    next_tag: AtomicU64,
    idle_delay: Duration,
    batch_size: usize,
    drivers: Counter,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskExecStats {
    pub active_count: isize,
    pub completed_count: isize,
    pub waiting_count: isize,
    pub scheduled_tasks: usize,
    pub running_drivers: isize,
}

pub struct DeliveryScheduler {
    exec: TaskExecQueue,
    tasks: DashMap<QueueName, TaskHandle>,
    shared: Arc<Shared>,
}

impl DeliveryScheduler {
    /// Creates the worker pool. Must be called from within a tokio runtime.
    pub fn new(cfg: &DeliveryConfig) -> Self {
        let (exec, task_runner) = Builder::default().workers(cfg.workers).queue_max(cfg.queue_max).build();

        tokio::spawn(async move {
            task_runner.await;
        });

        Self {
            exec,
            tasks: DashMap::default(),
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                next_tag: AtomicU64::new(1),
                idle_delay: cfg.idle_delay,
                batch_size: cfg.batch_size,
                drivers: Counter::new(),
            }),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Starts the delivery task of `handler`, replacing a stale one if present.
    pub(crate) fn register(&self, handler: Arc<QueueHandler>) -> Result<()> {
        if !self.is_running() {
            return Err(BrokerError::internal("delivery scheduler is stopped"));
        }
        let name = handler.name().clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(drive(handler.clone(), cancelled.clone(), self.exec.clone(), self.shared.clone()));
        if let Some(old) = self.tasks.insert(name.clone(), TaskHandle { cancelled, handler, join }) {
            log::warn!("{} replaced a stale delivery task", name);
            old.cancel();
        }
        Ok(())
    }

    /// Stops scheduling the delivery task of `queue`. A running execution finishes its current
    /// message first.
    pub(crate) fn deregister(&self, queue: &QueueName) -> bool {
        if let Some((_, task)) = self.tasks.remove(queue) {
            task.cancel();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_scheduled(&self, queue: &str) -> bool {
        self.tasks.contains_key(queue)
    }

    #[inline]
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Driver loops still alive, including ones cancelled but not yet exited.
    #[inline]
    pub fn running_drivers(&self) -> isize {
        self.shared.drivers.count()
    }

    /// Stops admission of new executions and waits for every driver to exit.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let queues = self.tasks.iter().map(|e| e.key().clone()).collect::<Vec<_>>();
        let mut joins = Vec::with_capacity(queues.len());
        for q in queues {
            if let Some((_, task)) = self.tasks.remove(&q) {
                task.cancel();
                joins.push(task.join);
            }
        }
        for res in futures::future::join_all(joins).await {
            if let Err(e) = res {
                log::warn!("delivery task join error, {:?}", e);
            }
        }
        log::info!("delivery scheduler stopped");
    }

    pub async fn exec_stats(&self) -> TaskExecStats {
        TaskExecStats {
            active_count: self.exec.active_count(),
            completed_count: self.exec.completed_count().await,
            waiting_count: self.exec.waiting_count(),
            scheduled_tasks: self.active_tasks(),
            running_drivers: self.running_drivers(),
        }
    }
}

async fn drive(handler: Arc<QueueHandler>, cancelled: Arc<AtomicBool>, exec: TaskExecQueue, shared: Arc<Shared>) {
    shared.drivers.inc();
    scopeguard::defer! {
        shared.drivers.dec();
    }
    log::debug!("{} delivery task started", handler.name());

    loop {
        if cancelled.load(Ordering::SeqCst) || !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let delivered =
            match run_once(handler.clone(), cancelled.clone(), shared.clone()).spawn(&exec).result().await {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("{} delivery task execution error, {:?}", handler.name(), e.to_string());
                    0
                }
            };

        if delivered == 0 {
            tokio::select! {
                _ = tokio::time::sleep(shared.idle_delay) => {},
                _ = handler.notified() => {},
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    log::debug!("{} delivery task stopped", handler.name());
}

/// One execution: hands up to `batch_size` messages to ready consumers.
async fn run_once(handler: Arc<QueueHandler>, cancelled: Arc<AtomicBool>, shared: Arc<Shared>) -> usize {
    let mut delivered = 0;
    while delivered < shared.batch_size
        && !cancelled.load(Ordering::SeqCst)
        && shared.running.load(Ordering::SeqCst)
    {
        let Some((consumer, delivery)) = handler.next_delivery(&shared.next_tag) else {
            break;
        };
        let tag = delivery.tag;
        if let Err(e) = consumer.sink().deliver(delivery).await {
            log::warn!("{} deliver to consumer {} failed, tag: {}, {:?}", handler.name(), consumer.tag, tag, e);
            handler.delivery_failed(tag);
            break;
        }
        delivered += 1;
    }
    delivered
}
