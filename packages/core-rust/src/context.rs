//! Event-context completion tracker.
//!
//! Every event is bound to a node of a context tree. Routing creates a child
//! node per dispatched route, and a node only counts as complete once it has a
//! response and all of its children are complete. Termination additionally
//! waits for children to terminate and for tracked side work to drain.
//!
//! A tree is an arena: nodes live in one `Vec` behind a mutex and refer to each
//! other by index, so the parent relation never forms an ownership cycle.
//! Callbacks and waiters are collected under the lock and invoked after it is
//! released.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{panic_message, ContextError};
use crate::event::Event;

/// Error type carried by failed contexts.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

type Callback = Box<dyn FnOnce(&ContextResponse) + Send>;

/// The response a context was completed with.
#[derive(Debug, Clone)]
pub enum ContextResponse {
    /// Completed successfully. The result event is released once the context
    /// terminates, after which late subscribers see `Success(None)`.
    Success(Option<Event>),
    Error(SharedError),
}

impl ContextResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[must_use]
    pub fn event(&self) -> Option<&Event> {
        match self {
            Self::Success(event) => event.as_ref(),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&SharedError> {
        match self {
            Self::Error(err) => Some(err),
            Self::Success(_) => None,
        }
    }
}

/// Lifecycle of a context node.
///
/// `Active -> Responded -> Complete -> Terminated`. A node may skip
/// `Responded` when it has no pending children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Active,
    /// Has a response but is still waiting on children.
    Responded,
    Complete,
    Terminated,
}

/// Limits applied to a context tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum nesting depth below the root.
    pub max_call_stack_depth: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_call_stack_depth: 45,
        }
    }
}

// ---------------------------------------------------------------------------
// Context tree
// ---------------------------------------------------------------------------

struct ContextNode {
    id: Arc<str>,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: usize,
    next_child: usize,
    response: Option<ContextResponse>,
    complete: bool,
    terminated: bool,
    pending_work: usize,
    on_response: Vec<Callback>,
    on_complete: Vec<Callback>,
    on_terminated: Vec<Callback>,
    waiters: Vec<oneshot::Sender<ContextResponse>>,
}

impl ContextNode {
    fn new(id: Arc<str>, parent: Option<usize>, depth: usize) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            depth,
            next_child: 0,
            response: None,
            complete: false,
            terminated: false,
            pending_work: 0,
            on_response: Vec::new(),
            on_complete: Vec::new(),
            on_terminated: Vec::new(),
            waiters: Vec::new(),
        }
    }

    fn state(&self) -> ContextState {
        if self.terminated {
            ContextState::Terminated
        } else if self.complete {
            ContextState::Complete
        } else if self.response.is_some() {
            ContextState::Responded
        } else {
            ContextState::Active
        }
    }
}

/// Work collected under the tree lock, run once the lock is released.
enum Notification {
    Callbacks {
        context: Arc<str>,
        callbacks: Vec<Callback>,
        response: ContextResponse,
    },
    Waiters {
        waiters: Vec<oneshot::Sender<ContextResponse>>,
        response: ContextResponse,
    },
}

impl Notification {
    fn deliver(self) {
        match self {
            Self::Callbacks {
                context,
                callbacks,
                response,
            } => {
                for callback in callbacks {
                    invoke(&context, callback, &response);
                }
            }
            Self::Waiters { waiters, response } => {
                for waiter in waiters {
                    // Receiver gone means nobody is waiting any more.
                    let _ = waiter.send(response.clone());
                }
            }
        }
    }
}

fn invoke(context: &str, callback: Callback, response: &ContextResponse) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(response))) {
        tracing::error!(
            context,
            panic = %panic_message(payload.as_ref()),
            "context callback panicked"
        );
    }
}

struct ContextTree {
    config: ContextConfig,
    correlation_id: Arc<str>,
    nodes: Mutex<Vec<ContextNode>>,
}

impl ContextTree {
    /// Walks from `index` towards the root, completing and terminating nodes
    /// whose conditions are now met.
    fn settle(nodes: &mut [ContextNode], start: usize, out: &mut Vec<Notification>) {
        let mut index = start;
        loop {
            let mut changed = false;

            let children_complete = nodes[index].children.iter().all(|&c| nodes[c].complete);
            let node = &mut nodes[index];
            if !node.complete && children_complete {
                if let Some(response) = node.response.clone() {
                    node.complete = true;
                    changed = true;
                    out.push(Notification::Callbacks {
                        context: Arc::clone(&node.id),
                        callbacks: std::mem::take(&mut node.on_complete),
                        response,
                    });
                }
            }

            let children_terminated = nodes[index]
                .children
                .iter()
                .all(|&c| nodes[c].terminated);
            let node = &mut nodes[index];
            if node.complete && !node.terminated && node.pending_work == 0 && children_terminated
            {
                node.terminated = true;
                changed = true;
                // Drop the result event so it cannot keep the tree alive.
                if let Some(ContextResponse::Success(event)) = node.response.as_mut() {
                    *event = None;
                }
                if let Some(response) = node.response.clone() {
                    out.push(Notification::Callbacks {
                        context: Arc::clone(&node.id),
                        callbacks: std::mem::take(&mut node.on_terminated),
                        response,
                    });
                }
                node.on_response.clear();
                node.on_complete.clear();
            }

            match (changed, nodes[index].parent) {
                (true, Some(parent)) => index = parent,
                _ => break,
            }
        }
    }
}

fn deliver_all(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

// ---------------------------------------------------------------------------
// EventContext
// ---------------------------------------------------------------------------

/// Handle to one node of a context tree. Cheap to clone.
#[derive(Clone)]
pub struct EventContext {
    tree: Arc<ContextTree>,
    index: usize,
    id: Arc<str>,
}

impl EventContext {
    /// Creates a new tree with default limits and returns its root.
    #[must_use]
    pub fn root() -> Self {
        Self::root_with(ContextConfig::default())
    }

    #[must_use]
    pub fn root_with(config: ContextConfig) -> Self {
        let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        let tree = ContextTree {
            config,
            correlation_id: Arc::clone(&id),
            nodes: Mutex::new(vec![ContextNode::new(Arc::clone(&id), None, 0)]),
        };
        Self {
            tree: Arc::new(tree),
            index: 0,
            id,
        }
    }

    /// Creates a child context.
    ///
    /// # Errors
    ///
    /// - [`ContextError::AlreadyComplete`] when this context is complete.
    /// - [`ContextError::CallStackOverflow`] when the child would be nested
    ///   deeper than the tree's configured limit.
    pub fn child(&self) -> Result<Self, ContextError> {
        let max = self.tree.config.max_call_stack_depth;
        let mut nodes = self.tree.nodes.lock();
        let child_index = nodes.len();
        let parent = &mut nodes[self.index];
        if parent.complete {
            return Err(ContextError::AlreadyComplete {
                id: parent.id.to_string(),
            });
        }
        let depth = parent.depth + 1;
        if depth > max {
            return Err(ContextError::CallStackOverflow { depth, max });
        }
        let id: Arc<str> = Arc::from(format!("{}_{}", parent.id, parent.next_child));
        parent.next_child += 1;
        parent.children.push(child_index);
        nodes.push(ContextNode::new(Arc::clone(&id), Some(self.index), depth));
        Ok(Self {
            tree: Arc::clone(&self.tree),
            index: child_index,
            id,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the root of this tree, shared by every context in it.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.tree.correlation_id
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.tree.nodes.lock()[self.index].depth
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let nodes = self.tree.nodes.lock();
        nodes[self.index].parent.map(|index| Self {
            tree: Arc::clone(&self.tree),
            index,
            id: Arc::clone(&nodes[index].id),
        })
    }

    /// The root of this context's tree.
    #[must_use]
    pub fn root_context(&self) -> Self {
        let nodes = self.tree.nodes.lock();
        Self {
            tree: Arc::clone(&self.tree),
            index: 0,
            id: Arc::clone(&nodes[0].id),
        }
    }

    #[must_use]
    pub fn config(&self) -> ContextConfig {
        self.tree.config
    }

    /// Completes the context without a result event.
    pub fn success(&self) -> bool {
        self.respond(ContextResponse::Success(None))
    }

    /// Completes the context with a result event.
    pub fn success_with(&self, event: Event) -> bool {
        self.respond(ContextResponse::Success(Some(event)))
    }

    pub fn error(&self, err: SharedError) -> bool {
        self.respond(ContextResponse::Error(err))
    }

    /// Records the response. Only the first call has any effect; returns
    /// whether this call was it.
    fn respond(&self, response: ContextResponse) -> bool {
        let mut out = Vec::new();
        {
            let mut nodes = self.tree.nodes.lock();
            let node = &mut nodes[self.index];
            if node.response.is_some() {
                return false;
            }
            node.response = Some(response.clone());
            out.push(Notification::Callbacks {
                context: Arc::clone(&node.id),
                callbacks: std::mem::take(&mut node.on_response),
                response: response.clone(),
            });
            out.push(Notification::Waiters {
                waiters: std::mem::take(&mut node.waiters),
                response,
            });
            ContextTree::settle(&mut nodes, self.index, &mut out);
        }
        tracing::trace!(context = %self.id, "context responded");
        deliver_all(out);
        true
    }

    #[must_use]
    pub fn has_response(&self) -> bool {
        self.tree.nodes.lock()[self.index].response.is_some()
    }

    #[must_use]
    pub fn response(&self) -> Option<ContextResponse> {
        self.tree.nodes.lock()[self.index].response.clone()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tree.nodes.lock()[self.index].complete
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.tree.nodes.lock()[self.index].terminated
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        self.tree.nodes.lock()[self.index].state()
    }

    /// Runs `callback` once the context has a response, or right away if it
    /// already has one.
    pub fn on_response(&self, callback: impl FnOnce(&ContextResponse) + Send + 'static) {
        self.register(
            Box::new(callback),
            |node| node.response.clone(),
            |node| &mut node.on_response,
        );
    }

    pub fn on_complete(&self, callback: impl FnOnce(&ContextResponse) + Send + 'static) {
        self.register(
            Box::new(callback),
            |node| node.complete.then(|| node.response.clone()).flatten(),
            |node| &mut node.on_complete,
        );
    }

    pub fn on_terminated(&self, callback: impl FnOnce(&ContextResponse) + Send + 'static) {
        self.register(
            Box::new(callback),
            |node| node.terminated.then(|| node.response.clone()).flatten(),
            |node| &mut node.on_terminated,
        );
    }

    fn register(
        &self,
        callback: Callback,
        fired: impl FnOnce(&ContextNode) -> Option<ContextResponse>,
        list: impl FnOnce(&mut ContextNode) -> &mut Vec<Callback>,
    ) {
        let ready = {
            let mut nodes = self.tree.nodes.lock();
            let node = &mut nodes[self.index];
            match fired(node) {
                Some(response) => response,
                None => {
                    list(node).push(callback);
                    return;
                }
            }
        };
        invoke(&self.id, callback, &ready);
    }

    /// Waits until the context has a response. Response callbacks have run by
    /// the time this resolves.
    pub async fn wait_for_response(&self) -> ContextResponse {
        let rx = {
            let mut nodes = self.tree.nodes.lock();
            let node = &mut nodes[self.index];
            if let Some(response) = &node.response {
                return response.clone();
            }
            let (tx, rx) = oneshot::channel();
            node.waiters.push(tx);
            rx
        };
        match rx.await {
            Ok(response) => response,
            // Waiters are only dropped after being sent to.
            Err(_) => self
                .response()
                .unwrap_or(ContextResponse::Success(None)),
        }
    }

    /// Tracks fire-and-forget work started on behalf of this context.
    /// The context cannot terminate until the returned guard is dropped.
    #[must_use]
    pub fn track_async_work(&self) -> AsyncWorkGuard {
        self.tree.nodes.lock()[self.index].pending_work += 1;
        AsyncWorkGuard {
            context: self.clone(),
        }
    }

    fn release_async_work(&self) {
        let mut out = Vec::new();
        {
            let mut nodes = self.tree.nodes.lock();
            let node = &mut nodes[self.index];
            node.pending_work = node.pending_work.saturating_sub(1);
            ContextTree::settle(&mut nodes, self.index, &mut out);
        }
        deliver_all(out);
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("id", &self.id)
            .field("correlation_id", &self.tree.correlation_id)
            .finish_non_exhaustive()
    }
}

/// RAII guard for asynchronous side work tracked by a context.
///
/// Dropping it, also during unwinding, releases the work and may terminate the
/// context.
#[derive(Debug)]
pub struct AsyncWorkGuard {
    context: EventContext,
}

impl Drop for AsyncWorkGuard {
    fn drop(&mut self) {
        self.context.release_async_work();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |label: &str| -> Callback {
                let log = Arc::clone(&log);
                let label = label.to_string();
                Box::new(move |_: &ContextResponse| log.lock().push(label))
            }
        };
        (log, make)
    }

    #[test]
    fn first_response_wins() {
        let ctx = EventContext::root();
        let event = Event::new(ctx.clone(), Message::of("first"));

        assert!(ctx.success_with(event));
        assert!(!ctx.error(Arc::new(std::io::Error::other("late"))));
        assert!(!ctx.success());

        assert!(ctx.response().is_some_and(|r| r.is_success()));
    }

    #[test]
    fn child_ids_derive_from_parent() {
        let root = EventContext::root();
        let a = root.child().unwrap();
        let b = root.child().unwrap();
        let aa = a.child().unwrap();

        assert_eq!(a.id(), format!("{}_0", root.id()));
        assert_eq!(b.id(), format!("{}_1", root.id()));
        assert_eq!(aa.id(), format!("{}_0_0", root.id()));
        assert_eq!(aa.correlation_id(), root.id());
        assert_eq!(aa.depth(), 2);
        assert_eq!(aa.parent().unwrap().id(), a.id());
        assert_eq!(aa.root_context().id(), root.id());
    }

    #[test]
    fn depth_limit_is_enforced() {
        let root = EventContext::root_with(ContextConfig {
            max_call_stack_depth: 2,
        });
        let one = root.child().unwrap();
        let two = one.child().unwrap();
        let err = two.child().unwrap_err();
        assert_eq!(err, ContextError::CallStackOverflow { depth: 3, max: 2 });
    }

    #[test]
    fn parent_completes_only_after_children() {
        let root = EventContext::root();
        let child = root.child().unwrap();

        root.success();
        assert_eq!(root.state(), ContextState::Responded);
        assert!(!root.is_complete());

        child.success();
        assert!(child.is_complete());
        assert!(root.is_complete());
        assert!(root.is_terminated());
    }

    #[test]
    fn complete_context_refuses_new_children() {
        let root = EventContext::root();
        let responded = root.child().unwrap();
        let pending = responded.child().unwrap();

        // Responded but waiting on a child: still open for more children.
        responded.success();
        let late = responded.child().unwrap();
        pending.success();
        assert!(!responded.is_complete());
        late.success();
        assert!(responded.is_complete());

        let err = responded.child().unwrap_err();
        assert_eq!(
            err,
            ContextError::AlreadyComplete {
                id: responded.id().to_string()
            }
        );
        assert!(responded.is_complete());
    }

    #[test]
    fn callbacks_fire_in_order_response_then_complete_then_terminated() {
        let ctx = EventContext::root();
        let (log, make) = recorder();

        ctx.on_terminated(make("terminated"));
        ctx.on_complete(make("complete-1"));
        ctx.on_response(make("response-1"));
        ctx.on_complete(make("complete-2"));
        ctx.on_response(make("response-2"));

        ctx.success();

        assert_eq!(
            *log.lock(),
            vec![
                "response-1",
                "response-2",
                "complete-1",
                "complete-2",
                "terminated"
            ]
        );
    }

    #[test]
    fn late_registration_fires_immediately() {
        let ctx = EventContext::root();
        ctx.success();
        let (log, make) = recorder();
        ctx.on_response(make("response"));
        ctx.on_terminated(make("terminated"));
        assert_eq!(*log.lock(), vec!["response", "terminated"]);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let ctx = EventContext::root();
        let (log, make) = recorder();
        ctx.on_response(|_| panic!("callback failure"));
        ctx.on_response(make("after"));

        assert!(ctx.success());
        assert_eq!(*log.lock(), vec!["after"]);
        assert!(ctx.is_terminated());
    }

    #[test]
    fn termination_waits_for_async_work() {
        let ctx = EventContext::root();
        let guard = ctx.track_async_work();

        ctx.success();
        assert!(ctx.is_complete());
        assert!(!ctx.is_terminated());

        drop(guard);
        assert!(ctx.is_terminated());
    }

    #[test]
    fn child_work_delays_parent_termination() {
        let root = EventContext::root();
        let child = root.child().unwrap();
        let guard = child.track_async_work();

        child.success();
        root.success();
        assert!(root.is_complete());
        assert!(!root.is_terminated());

        drop(guard);
        assert!(child.is_terminated());
        assert!(root.is_terminated());
    }

    #[test]
    fn termination_releases_result_event() {
        let ctx = EventContext::root();
        let event = Event::new(ctx.clone(), Message::of("payload"));
        ctx.success_with(event);

        assert!(ctx.is_terminated());
        let response = ctx.response().unwrap();
        assert!(response.is_success());
        assert!(response.event().is_none());
    }

    #[tokio::test]
    async fn waiters_resolve_after_response_callbacks() {
        let ctx = EventContext::root();
        let (log, make) = recorder();
        ctx.on_response(make("callback"));

        let waiter = {
            let ctx = ctx.clone();
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let response = ctx.wait_for_response().await;
                (response.is_success(), log.lock().len())
            })
        };
        // Let the waiter register before completing.
        tokio::task::yield_now().await;

        ctx.error(Arc::new(std::io::Error::other("failed")));
        let (success, seen) = waiter.await.unwrap();
        assert!(!success);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn wait_for_response_returns_existing_response() {
        let ctx = EventContext::root();
        ctx.success();
        assert!(ctx.wait_for_response().await.is_success());
    }
}
