//! Event sink consumed by the session engine.
use crate::core::events::SessionEvent;
use crate::model::session::SessionOutcome;
use btleplug::api::BDAddr;

/// Push interface receiving session events in emission order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);

    /// The scan resolved the scale's address.
    fn device_found(&self, _address: BDAddr) {}

    /// Reported right before the terminal transition is emitted, ahead of
    /// teardown.
    fn outcome(&self, _outcome: &SessionOutcome) {}
}
