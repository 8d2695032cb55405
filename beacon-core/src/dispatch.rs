//! Request dispatch queue
//!
//! [`DispatchQueue`] serializes outbound requests: at most one request is in
//! flight, requests go out in submission order, and sending resumes on its
//! own when connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//!  producers ──enqueue──►┐
//!  observers ◄──state────┤   ┌────────────┐  spawn   ┌───────────┐
//!                        ├──►│ Dispatcher │ ───────► │ Transport │
//!  monitor ───edges─────►┤   │   (actor)  │ ◄─────── │   call    │
//!                        │   └────────────┘ completed└───────────┘
//! ```
//!
//! The handle only sends messages. Backlog, in-flight slot, cached
//! reachability, state and observers all live in one task, so every mutation
//! happens in a single context. Completions and observer callbacks run in
//! that task too.
//!
//! ## State
//!
//! The queue is [`ClientState::Waiting`] when the endpoint is reachable, the
//! backlog is empty and nothing is in flight; otherwise it is
//! [`ClientState::Running`]. Observers hear about flips only.
//!
//! A request enqueued while the queue is waiting is sent right away without
//! consulting reachability. Requests enqueued while running wait for the
//! previous one to complete, or for the endpoint to become reachable again.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;
use crate::reachability::{Reachability, ReachabilityMonitor, ReachabilityNotifier};
use crate::request::Request;
use crate::transport::Transport;

/// Callback receiving the transport result of one enqueued request
pub type Completion<R> =
    Box<dyn FnOnce(Result<<R as Request>::Response, TransportError>) + Send + 'static>;

/// Identifies an enqueued request; doubles as the dispatch token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Busy/idle state published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Reachable, nothing queued, nothing in flight
    #[default]
    Waiting,
    /// Anything else
    Running,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Waiting => f.write_str("waiting"),
            ClientState::Running => f.write_str("running"),
        }
    }
}

/// Receives state transitions.
///
/// Called from the queue's task, never inline with the call that caused the
/// transition.
pub trait StateObserver: Send + Sync + 'static {
    fn on_state_changed(&self, state: ClientState);
}

impl<F> StateObserver for F
where
    F: Fn(ClientState) + Send + Sync + 'static,
{
    fn on_state_changed(&self, state: ClientState) {
        self(state)
    }
}

/// Revokes an observer registration
pub struct Subscription {
    key: usize,
    unsubscribe: Box<dyn FnOnce(usize) + Send>,
}

impl Subscription {
    /// Stop delivering notifications to the observer
    pub fn unsubscribe(self) {
        (self.unsubscribe)(self.key);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of the queue, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub state: ClientState,
    pub reachability: Reachability,
    /// Requests waiting to be sent (excludes the one in flight)
    pub queued: usize,
    pub in_flight: Option<TaskId>,
    pub observers: usize,
    /// Whether a transport has been configured
    pub configured: bool,
}

struct Task<R: Request> {
    id: TaskId,
    request: R,
    completion: Completion<R>,
}

enum Command<R: Request> {
    Configure {
        transport: Arc<dyn Transport<R>>,
        monitor: Box<dyn ReachabilityMonitor>,
    },
    Enqueue(Task<R>),
    AddObserver {
        key: usize,
        observer: Arc<dyn StateObserver>,
    },
    RemoveObserver {
        key: usize,
    },
    Teardown,
    Snapshot(oneshot::Sender<QueueSnapshot>),
}

struct Completed<R: Request> {
    id: TaskId,
    completion: Completion<R>,
    result: Result<R::Response, TransportError>,
}

struct Edge {
    generation: u64,
    status: Reachability,
}

/// Handle to a dispatch queue.
///
/// Cheap to clone; every clone talks to the same queue. None of the methods
/// block or fail. Once every handle is dropped the queue stops and anything
/// still pending is dropped.
pub struct DispatchQueue<R: Request> {
    commands: mpsc::UnboundedSender<Command<R>>,
    next_task_id: Arc<AtomicU64>,
}

impl<R: Request> Clone for DispatchQueue<R> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_task_id: self.next_task_id.clone(),
        }
    }
}

impl<R: Request> DispatchQueue<R> {
    /// Spawn a queue on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new() -> Self {
        Self::spawn_on(&tokio::runtime::Handle::current())
    }

    /// Spawn a queue on `runtime`.
    ///
    /// Completions and observer notifications are delivered on this runtime.
    pub fn spawn_on(runtime: &tokio::runtime::Handle) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (edges_tx, edges_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            backlog: VecDeque::new(),
            in_flight: None,
            state: ClientState::Waiting,
            reachability: Reachability::Reachable,
            observers: Vec::new(),
            transport: None,
            monitor: None,
            generation: 0,
            edges_tx,
            completions_tx,
        };
        runtime.spawn(dispatcher.run(commands_rx, edges_rx, completions_rx));

        Self {
            commands: commands_tx,
            next_task_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Install the transport and start listening to `monitor`.
    ///
    /// Calling again replaces both; the previous monitor is stopped and its
    /// late edges are ignored.
    pub fn configure(&self, transport: Arc<dyn Transport<R>>, monitor: impl ReachabilityMonitor) {
        self.send(Command::Configure {
            transport,
            monitor: Box::new(monitor),
        });
    }

    /// Append a request to the queue.
    ///
    /// `completion` receives the transport result once the request has been
    /// sent. It is never called if the request is discarded by
    /// [`teardown`](Self::teardown) before being sent.
    pub fn enqueue<F>(&self, request: R, completion: F) -> TaskId
    where
        F: FnOnce(Result<R::Response, TransportError>) + Send + 'static,
    {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Enqueue(Task {
            id,
            request,
            completion: Box::new(completion),
        }));
        id
    }

    /// Enqueue a request and wait for its result.
    ///
    /// Resolves to [`TransportError::Cancelled`] if the request is discarded
    /// before being sent.
    pub fn submit(
        &self,
        request: R,
    ) -> impl Future<Output = Result<R::Response, TransportError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.enqueue(request, move |result| {
            let _ = tx.send(result);
        });
        async move { rx.await.unwrap_or(Err(TransportError::Cancelled)) }
    }

    /// Register an observer for state transitions.
    ///
    /// Observers are compared by `Arc` identity; registering the same one
    /// twice has no effect. The returned subscription does not keep the
    /// queue alive.
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) -> Subscription {
        let key = Arc::as_ptr(&observer) as *const () as usize;
        self.send(Command::AddObserver { key, observer });

        let commands = self.commands.downgrade();
        Subscription {
            key,
            unsubscribe: Box::new(move |key| {
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::RemoveObserver { key });
                }
            }),
        }
    }

    /// Stop the monitor, discard queued requests and observers, and reset to
    /// an idle state.
    ///
    /// A request already in flight still completes. The transport stays
    /// installed; call [`configure`](Self::configure) to resume monitoring.
    pub fn teardown(&self) {
        self.send(Command::Teardown);
    }

    /// Current view of the queue, or `None` if it has stopped
    pub async fn snapshot(&self) -> Option<QueueSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.ok()
    }

    fn send(&self, command: Command<R>) {
        if self.commands.send(command).is_err() {
            tracing::trace!("Dispatch queue has stopped; command dropped");
        }
    }
}

impl<R: Request> Default for DispatchQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of all queue state; runs as a single task
struct Dispatcher<R: Request> {
    backlog: VecDeque<Task<R>>,
    in_flight: Option<TaskId>,
    state: ClientState,
    reachability: Reachability,
    observers: Vec<(usize, Arc<dyn StateObserver>)>,
    transport: Option<Arc<dyn Transport<R>>>,
    monitor: Option<Box<dyn ReachabilityMonitor>>,
    /// Bumped whenever the monitor is replaced or stopped
    generation: u64,
    edges_tx: mpsc::UnboundedSender<Edge>,
    completions_tx: mpsc::UnboundedSender<Completed<R>>,
}

impl<R: Request> Dispatcher<R> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<R>>,
        mut edges: mpsc::UnboundedReceiver<Edge>,
        mut completions: mpsc::UnboundedReceiver<Completed<R>>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(completed) = completions.recv() => self.handle_completed(completed),
                Some(edge) = edges.recv() => self.handle_edge(edge),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        self.stop_monitor();
        tracing::debug!(
            dropped = self.backlog.len(),
            in_flight = self.in_flight.is_some(),
            "Dispatch queue stopped"
        );
    }

    fn handle_command(&mut self, command: Command<R>) {
        match command {
            Command::Configure { transport, monitor } => self.configure(transport, monitor),
            Command::Enqueue(task) => self.enqueue(task),
            Command::AddObserver { key, observer } => {
                if !self.observers.iter().any(|(existing, _)| *existing == key) {
                    self.observers.push((key, observer));
                }
            }
            Command::RemoveObserver { key } => {
                self.observers.retain(|(existing, _)| *existing != key);
            }
            Command::Teardown => self.teardown(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn configure(
        &mut self,
        transport: Arc<dyn Transport<R>>,
        mut monitor: Box<dyn ReachabilityMonitor>,
    ) {
        self.stop_monitor();
        self.transport = Some(transport);

        let generation = self.generation;
        let edges = self.edges_tx.clone();
        monitor.start(ReachabilityNotifier::new(move |status| {
            let _ = edges.send(Edge { generation, status });
        }));
        self.monitor = Some(monitor);

        tracing::info!(generation, "Dispatch queue configured");
    }

    fn enqueue(&mut self, task: Task<R>) {
        tracing::debug!(
            task_id = %task.id,
            request_id = %task.request.request_id(),
            queued = self.backlog.len() + 1,
            "Request enqueued"
        );
        let idle = self.state == ClientState::Waiting && self.in_flight.is_none();
        self.backlog.push_back(task);
        self.recompute_state();

        // Idle queue: send the new request immediately, reachable or not.
        if idle {
            if let Some(task) = self.backlog.pop_front() {
                self.dispatch(task);
            }
        }
    }

    fn teardown(&mut self) {
        self.stop_monitor();
        let dropped = self.backlog.len();
        self.backlog.clear();
        self.observers.clear();
        self.reachability = Reachability::Unreachable;
        self.state = ClientState::Waiting;

        tracing::info!(
            dropped,
            in_flight = self.in_flight.is_some(),
            "Dispatch queue torn down"
        );
    }

    fn handle_edge(&mut self, edge: Edge) {
        if edge.generation != self.generation || self.monitor.is_none() {
            tracing::trace!(status = %edge.status, "Ignoring edge from a replaced monitor");
            return;
        }

        self.reachability = edge.status;
        match edge.status {
            Reachability::Reachable => {
                tracing::info!("Communication is possible");
                self.attempt_send();
            }
            Reachability::Unreachable => {
                tracing::info!("Communication is impossible");
            }
        }
        self.recompute_state();
    }

    fn handle_completed(&mut self, completed: Completed<R>) {
        let Completed {
            id,
            completion,
            result,
        } = completed;

        if self.in_flight == Some(id) {
            self.in_flight = None;
        } else {
            tracing::warn!(task_id = %id, "Completion does not match the request in flight");
        }

        self.recompute_state();
        self.attempt_send();
        completion(result);
    }

    /// Send the head of the backlog if reachable and idle
    fn attempt_send(&mut self) {
        if self.in_flight.is_some() || !self.reachability.is_reachable() {
            return;
        }
        if let Some(task) = self.backlog.pop_front() {
            self.dispatch(task);
        }
    }

    fn dispatch(&mut self, task: Task<R>) {
        let Task {
            id,
            request,
            completion,
        } = task;
        self.in_flight = Some(id);

        let completions = self.completions_tx.clone();
        let Some(transport) = self.transport.clone() else {
            tracing::warn!(task_id = %id, "No transport configured; failing request");
            let _ = completions.send(Completed {
                id,
                completion,
                result: Err(TransportError::NotConfigured),
            });
            return;
        };

        tracing::debug!(task_id = %id, request_id = %request.request_id(), "Request start");
        tokio::spawn(async move {
            let result = transport.send(&request).await;
            tracing::debug!(
                task_id = %id,
                request_id = %request.request_id(),
                success = result.is_ok(),
                "Request end"
            );
            let _ = completions.send(Completed {
                id,
                completion,
                result,
            });
        });
    }

    fn recompute_state(&mut self) {
        let next = if self.reachability.is_reachable()
            && self.backlog.is_empty()
            && self.in_flight.is_none()
        {
            ClientState::Waiting
        } else {
            ClientState::Running
        };

        if next == self.state {
            return;
        }

        tracing::debug!(from = %self.state, to = %next, "Dispatch state changed");
        self.state = next;
        for (_, observer) in &self.observers {
            observer.on_state_changed(next);
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.generation += 1;
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            state: self.state,
            reachability: self.reachability,
            queued: self.backlog.len(),
            in_flight: self.in_flight,
            observers: self.observers.len(),
            configured: self.transport.is_some(),
        }
    }
}
