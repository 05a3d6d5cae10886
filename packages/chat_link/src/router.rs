//! Inbound demultiplexing and listener fan-out.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{Inbound, decode_frame};
use crate::types::{GroupMessage, PrivateMessage};

/// Opaque token returned when a listener is registered.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ListenerHandle(pub(crate) u64);

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Observers of one event type, notified in registration order.
pub struct ListenerRegistry<T> {
    listeners: Vec<(ListenerHandle, Listener<T>)>,
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<T> ListenerRegistry<T> {
    pub fn insert(&mut self, handle: ListenerHandle, listener: Listener<T>) {
        self.listeners.push((handle, listener));
    }

    /// Exact-handle removal. Returns false if the handle was unknown.
    pub fn remove(&mut self, handle: ListenerHandle) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(h, _)| *h != handle);
        self.listeners.len() != before
    }

    pub fn emit(&self, event: &T) {
        for (_, listener) in &self.listeners {
            listener(event);
        }
    }
}

/// Counts from one dispatched frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub private: usize,
    pub group: usize,
    pub dropped: usize,
}

#[derive(Default)]
pub struct MessageRouter {
    pub(crate) private: ListenerRegistry<PrivateMessage>,
    pub(crate) group: ListenerRegistry<GroupMessage>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_private(&mut self, handle: ListenerHandle, listener: Listener<PrivateMessage>) {
        self.private.insert(handle, listener);
    }

    pub fn add_group(&mut self, handle: ListenerHandle, listener: Listener<GroupMessage>) {
        self.group.insert(handle, listener);
    }

    pub fn remove_private(&mut self, handle: ListenerHandle) -> bool {
        self.private.remove(handle)
    }

    pub fn remove_group(&mut self, handle: ListenerHandle) -> bool {
        self.group.remove(handle)
    }

    /// Decode a frame and dispatch its records strictly in array order.
    /// Malformed records are logged and skipped.
    pub fn dispatch_frame(&self, frame: &str) -> DispatchReport {
        let mut report = DispatchReport::default();

        let records = match decode_frame(frame) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "dropping inbound frame");
                report.dropped = 1;
                return report;
            }
        };

        for (index, record) in records.into_iter().enumerate() {
            match record {
                Ok(Inbound::Private(msg)) => {
                    report.private += 1;
                    self.private.emit(&msg);
                }
                Ok(Inbound::Group(msg)) => {
                    report.group += 1;
                    self.group.emit(&msg);
                }
                Err(e) => {
                    warn!(index, error = %e, "dropping inbound record");
                    report.dropped += 1;
                }
            }
        }

        debug!(
            private = report.private,
            group = report.group,
            dropped = report.dropped,
            "frame dispatched"
        );
        report
    }
}
