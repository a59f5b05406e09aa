use super::state::ExecutionSnapshot;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Callback receiving a workflow snapshot
pub type SnapshotCallback = Arc<dyn Fn(&ExecutionSnapshot) + Send + Sync>;

/// Callback receiving a node name and a workflow snapshot
pub type NodeCallback = Arc<dyn Fn(&str, &ExecutionSnapshot) + Send + Sync>;

/// Terminal outcome callbacks. Unset callbacks are skipped.
#[derive(Clone, Default)]
pub struct CompletionListener {
    on_success: Option<SnapshotCallback>,
    on_failure: Option<SnapshotCallback>,
    on_stopped: Option<SnapshotCallback>,
}

impl CompletionListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl Fn(&ExecutionSnapshot) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl Fn(&ExecutionSnapshot) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn on_stopped(mut self, f: impl Fn(&ExecutionSnapshot) + Send + Sync + 'static) -> Self {
        self.on_stopped = Some(Arc::new(f));
        self
    }

    pub(crate) fn success(&self, snapshot: &ExecutionSnapshot) {
        invoke("on_success", self.on_success.as_ref(), snapshot);
    }

    pub(crate) fn failure(&self, snapshot: &ExecutionSnapshot) {
        invoke("on_failure", self.on_failure.as_ref(), snapshot);
    }

    pub(crate) fn stopped(&self, snapshot: &ExecutionSnapshot) {
        invoke("on_stopped", self.on_stopped.as_ref(), snapshot);
    }
}

/// Per-node callbacks fired around each attempt
#[derive(Clone, Default)]
pub struct NodeEventListener {
    before_node: Option<NodeCallback>,
    after_node: Option<NodeCallback>,
}

impl NodeEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_node(
        mut self,
        f: impl Fn(&str, &ExecutionSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.before_node = Some(Arc::new(f));
        self
    }

    pub fn after_node(
        mut self,
        f: impl Fn(&str, &ExecutionSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.after_node = Some(Arc::new(f));
        self
    }

    pub(crate) fn before(&self, node: &str, snapshot: &ExecutionSnapshot) {
        if let Some(f) = &self.before_node {
            guarded("before_node", || f(node, snapshot));
        }
    }

    pub(crate) fn after(&self, node: &str, snapshot: &ExecutionSnapshot) {
        if let Some(f) = &self.after_node {
            guarded("after_node", || f(node, snapshot));
        }
    }
}

fn invoke(name: &str, callback: Option<&SnapshotCallback>, snapshot: &ExecutionSnapshot) {
    if let Some(f) = callback {
        guarded(name, || f(snapshot));
    }
}

// A panicking listener must not take the scheduler task down with it
fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("Workflow listener panicked: listener={}", name);
    }
}
