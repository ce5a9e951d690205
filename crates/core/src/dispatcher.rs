use std::sync::Arc;

use crate::payload::TransmissionPayload;

/// Hands a fully addressed outgoing payload to the communication layer.
///
/// Implementations must not block: the runtime calls `dispatch` from handler
/// completions and from the task loop.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, payload: TransmissionPayload);
}

/// Blanket implementation so `Arc<dyn Dispatcher>` can be used directly.
impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    fn dispatch(&self, payload: TransmissionPayload) {
        (**self).dispatch(payload)
    }
}
