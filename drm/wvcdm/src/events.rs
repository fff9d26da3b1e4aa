use crate::types::KeyStatusMap;

/// Session event sink supplied by the host.
///
/// Events are delivered synchronously from engine entry points and timer
/// ticks, in the order the underlying transitions occurred. Implementations
/// must not call back into the engine from the callback; post to a queue
/// instead.
pub trait EventListener: Send + Sync {
    /// The license wants a renewal round-trip.
    fn on_session_renewal_needed(&self, _session_id: &str) {}

    /// One or more keys changed status. `has_new_usable_key` is true when a
    /// key transitioned into `Usable`.
    fn on_session_keys_change(
        &self,
        _session_id: &str,
        _key_statuses: &KeyStatusMap,
        _has_new_usable_key: bool,
    ) {
    }

    /// The earliest expiry across the session's keys changed.
    /// `None` means the license never expires.
    fn on_expiration_update(&self, _session_id: &str, _expiry_time: Option<i64>) {}
}

/// Listener that ignores everything, for hosts that do not care.
pub struct NullEventListener;

impl EventListener for NullEventListener {}
