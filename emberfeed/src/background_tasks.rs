// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of emberfeed.
//
// emberfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// emberfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with emberfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Background Task Processing
//!
//! Domain-event handlers must not block their caller beyond enqueueing: the expiry sweep & the
//! notification fan-out both run off the request path, on a small async task system. The shape is
//! a trio of traits-- [Task] (a unit of work), [Sender] (enqueue), [Receiver] (dequeue & later
//! mark complete)-- plus a [Processor] that drives checked-out tasks on a [JoinSet] with
//! per-task timeouts, periodic pick-up, and orderly shutdown.
//!
//! The queue itself is in-memory ([TaskQueue]). A task accepted by [`Sender::send`] survives
//! until executed or the process exits; that's the durability on offer, and for the work at hand
//! (a sweep that re-derives its work-list from the store each run, best-effort notifications)
//! it's the right trade. A durable queue would slot in behind the same traits.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::Poll,
    time::Duration,
};

use async_trait::async_trait;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{prelude::*, Backtrace, IntoError};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
};
use tracing::error;
use uuid::Uuid;

use crate::{
    counter_add, gauge_setu,
    metrics::{self, Instruments, Sort},
    notifications::{Notification, Sink},
    popularity::PopularityLedger,
    storage::Backend as StorageBackend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    // Generic error variant trait implementations can use
    #[snafu(display("{source}"))]
    Background {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to mark a task complete: {source}"))]
    Completion {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Task processing failed to run to completion: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the task processor: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to pick-up a new task: {source}"))]
    Take {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Tried to complete a task that was never checked-out"))]
    TaskId { backtrace: Backtrace },
    #[snafu(display("Failed to wait for in-flight tasks: {source}"))]
    Timeout { source: tokio::time::error::Elapsed },
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Background {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             tasks                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A unit of background work
///
/// Generic over the context `C` handed to each execution (storage handles & so forth). Note that
/// `exec()` consumes the task; re-running means re-sending.
// This trait must be object-safe: the processor handles tasks generically, as trait objects.
#[async_trait]
pub trait Task<C>: Send {
    async fn exec(self: Box<Self>, context: C) -> Result<()>;
    /// Per-task execution timeout; `None` defers to [Config::default_timeout].
    fn timeout(&self) -> Option<Duration>;
}

/// The ability to enqueue [Task]s
///
/// Generic over the [Task] type (rather than making `send()` generic) so implementors can
/// constrain what they accept.
#[async_trait]
pub trait Sender<C, T: Task<C>> {
    async fn send(&self, task: T) -> Result<()>;
}

/// The ability to draw [Task]s for execution
///
/// `take_task` hands back the task plus a cookie; the processor calls `mark_complete` with that
/// cookie once the task has run.
#[async_trait]
pub trait Receiver<C> {
    type TaskId: Send + 'static;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()>;
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>>;
}

/// Blanket implementation for [Arc]s; if `T` is a [Receiver], then so is `Arc<T>`.
#[async_trait]
impl<C, T: Receiver<C> + Send + Sync> Receiver<C> for Arc<T> {
    type TaskId = T::TaskId;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.as_ref().mark_complete(cookie).await
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        self.as_ref().take_task().await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the in-memory queue                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// FIFO, in-process implementation of [Sender] & [Receiver]
pub struct TaskQueue<C> {
    tasks: Mutex<VecDeque<(Uuid, Box<dyn Task<C>>)>>,
    checkouts: Mutex<HashSet<Uuid>>,
}

impl<C> TaskQueue<C> {
    pub fn new() -> TaskQueue<C> {
        TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            checkouts: Mutex::new(HashSet::new()),
        }
    }
    /// Tasks waiting or in-flight; handy in tests & in shutdown checks.
    pub fn depth(&self) -> usize {
        self.tasks.lock().unwrap(/* poisoning means a prior panic */).len()
            + self.checkouts.lock().unwrap(/* ditto */).len()
    }
}

impl<C> Default for TaskQueue<C> {
    fn default() -> Self {
        TaskQueue::new()
    }
}

#[async_trait]
impl<C: Send, T: Task<C> + 'static> Sender<C, T> for TaskQueue<C> {
    async fn send(&self, task: T) -> Result<()> {
        self.tasks
            .lock()
            .unwrap(/* poisoning means a prior panic */)
            .push_back((Uuid::new_v4(), Box::new(task)));
        Ok(())
    }
}

#[async_trait]
impl<C: Send> Receiver<C> for TaskQueue<C> {
    type TaskId = Uuid;
    async fn mark_complete(&self, cookie: Self::TaskId) -> Result<()> {
        self.checkouts
            .lock()
            .unwrap(/* poisoning means a prior panic */)
            .remove(&cookie)
            .then_some(())
            .ok_or(TaskIdSnafu.build())
    }
    async fn take_task(&self) -> Result<Option<(Box<dyn Task<C>>, Self::TaskId)>> {
        let popped = self
            .tasks
            .lock()
            .unwrap(/* poisoning means a prior panic */)
            .pop_front();
        match popped {
            Some((id, task)) => {
                self.checkouts
                    .lock()
                    .unwrap(/* poisoning means a prior panic */)
                    .insert(id);
                Ok(Some((task, id)))
            }
            None => Ok(None),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the processor                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Handle on the ongoing processing of background tasks
///
/// Await it to observe the processing loop's result, or call
/// [`shutdown()`](Processor::shutdown) to stop it.
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the processing loop to stop & wait up to `timeout` for it to do so.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts; convenient when selecting over the processor
    /// along with other futures.
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

/// Configuration parameters for processing background tasks
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Timeout that will be used for any task that doesn't define its own
    #[serde(rename = "default-timeout")]
    pub default_timeout: Duration,
    /// The maximum number of tasks to drive concurrently
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,
    /// Amount of time to sleep when we have no tasks in process
    #[serde(rename = "sleep-duration")]
    pub sleep_duration: Duration,
    /// Amount of time to wait for in-flight tasks on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
    /// Maximum amount of time to drive in-flight tasks without attempting to pick-up new tasks
    #[serde(rename = "pickup-timeout")]
    pub pickup_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_concurrent_tasks: 16,
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(500),
            pickup_timeout: Duration::from_millis(1000),
        }
    }
}

inventory::submit! { metrics::Registration::new("background.processor.tasks.completed", Sort::IntegralCounter) }

inventory::submit! { metrics::Registration::new("background.processor.tasks.inflight", Sort::IntegralGauge) }

/// The processing loop: draw tasks from `receiver` while watching `shutdown`.
///
/// In-flight tasks live on a [JoinSet], capped at [Config::max_concurrent_tasks]; each runs under
/// its timeout. When there's nothing in flight we sleep briefly rather than spin, and a long-
/// running task can't starve pick-up because the select below wakes every
/// [Config::pickup_timeout] regardless.
async fn process<C: Clone + 'static, R: Receiver<C>>(
    receiver: R,
    context: C,
    config: Config,
    shutdown: Arc<Notify>,
    instruments: Arc<Instruments>,
) -> Result<()> {
    let mut cookies: HashMap<Id, R::TaskId> = HashMap::new();
    let mut running = JoinSet::new();
    let mut stopping = false;
    while !stopping {
        if running.len() < config.max_concurrent_tasks {
            if let Some((task, cookie)) = receiver.take_task().await.context(TakeSnafu)? {
                let timeout = task.timeout().unwrap_or(config.default_timeout);
                let id = running
                    .spawn(tokio::time::timeout(timeout, task.exec(context.clone())))
                    .id();
                cookies.insert(id, cookie);
            }
        }

        gauge_setu!(
            instruments,
            "background.processor.tasks.inflight",
            running.len() as u64,
            &[]
        );

        if running.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.sleep_duration) => (),
                _ = shutdown.notified() => {
                    stopping = true;
                }
            }
        } else {
            tokio::select! {
                joined = running.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, outcome))) => {
                            // The task ran (perhaps to a timeout or an error-- both are its own
                            // business; see the Task implementations) & was consumed; mark it
                            // complete either way.
                            if let Ok(Err(err)) = outcome {
                                error!("A background task failed: {err:#?}");
                            }
                            let cookie = cookies.remove(&id).context(TaskIdSnafu)?;
                            receiver.mark_complete(cookie).await.context(CompletionSnafu)?;
                            counter_add!(instruments, "background.processor.tasks.completed", 1, &[]);
                        },
                        Some(Err(err)) => {
                            return Err(JoinSnafu.into_error(err));
                        },
                        None => unimplemented!(), // Precluded by `.is_empty()`, above.
                    }
                },
                _ = tokio::time::sleep(config.pickup_timeout) => (),
                _ = shutdown.notified() => {
                    stopping = true;
                }
            }
        }
    }

    // Give any in-flight tasks a chance to complete:
    tokio::time::timeout(config.shutdown_timeout, running.join_all())
        .await
        .context(TimeoutSnafu)?;

    Ok(())
}

/// Create a new [Processor] given a [Receiver].
pub fn new<C: Clone + Send + 'static, R: Receiver<C> + Send + 'static>(
    receiver: R,
    context: C,
    config: Option<Config>,
    instruments: Arc<Instruments>,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(
        receiver,
        context,
        config.unwrap_or_default(),
        shutdown.clone(),
        instruments,
    ));
    Processor {
        processor,
        shutdown,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      the emberfeed context                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Context handed to every emberfeed background task
#[derive(Clone)]
pub struct Context {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub ledger: Arc<PopularityLedger>,
    pub sink: Arc<dyn Sink + Send + Sync>,
}

/// Hand a [Notification] to the [Sink], best-effort
///
/// A failed delivery is logged & swallowed; per the dispatcher contract, nothing downstream of a
/// ranking mutation is allowed to care.
pub struct DeliverNotification {
    pub notification: Notification,
}

#[async_trait]
impl Task<Context> for DeliverNotification {
    async fn exec(self: Box<Self>, context: Context) -> Result<()> {
        if let Err(err) = context.sink.deliver(&self.notification).await {
            error!(
                "Dropping a notification for user {}: {err}",
                self.notification.user
            );
        }
        Ok(())
    }
    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(5))
    }
}

// Pressure-test the processing machinery with a trivial task & context:
#[cfg(test)]
mod mock {

    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bump a shared counter after a nap; the nap keeps several of these in flight at once.
    struct Bump {
        hits: Arc<AtomicUsize>,
        nap: Duration,
    }

    #[async_trait]
    impl Task<()> for Bump {
        async fn exec(self: Box<Self>, _: ()) -> Result<()> {
            tokio::time::sleep(self.nap).await;
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn timeout(&self) -> Option<Duration> {
            None
        }
    }

    #[tokio::test]
    async fn drains_the_queue() {
        let queue = Arc::new(TaskQueue::<()>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        for nap in [40, 10, 90, 25, 60] {
            queue
                .send(Bump {
                    hits: hits.clone(),
                    nap: Duration::from_millis(nap),
                })
                .await
                .unwrap();
        }
        assert_eq!(queue.depth(), 5);

        let processor = new(
            queue.clone(),
            (),
            Some(Config {
                sleep_duration: Duration::from_millis(50),
                ..Default::default()
            }),
            Arc::new(Instruments::new("emberfeed")),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_task_in_flight() {
        let queue = Arc::new(TaskQueue::<()>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let processor = new(
            queue.clone(),
            (),
            Some(Config {
                sleep_duration: Duration::from_millis(10),
                // Longer than the task below, which may have just started when the shutdown
                // signal arrives.
                shutdown_timeout: Duration::from_millis(500),
                ..Default::default()
            }),
            Arc::new(Instruments::new("emberfeed")),
        );

        queue
            .send(Bump {
                hits: hits.clone(),
                nap: Duration::from_millis(200),
            })
            .await
            .unwrap();
        // Long enough for pick-up, not for completion.
        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
