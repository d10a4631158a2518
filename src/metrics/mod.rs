//! Metrics for stage runs.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP endpoint, off unless configured

pub mod events;
pub mod server;

pub use server::init;

/// Emit an internal event.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding metric. Without an installed recorder this is a no-op.
///
/// ```ignore
/// use avalanche::metrics::events::RecordsEnriched;
///
/// emit!(RecordsEnriched { count: 100 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
