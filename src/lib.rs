//! Mi Scale Measurement Engine
//!
//! Acquires weight measurements from a Bluetooth Low Energy body composition
//! scale. A `SessionController` runs at most one measurement session at a
//! time, streams its progress as events and hands finalized readings to a
//! measurement store.

/// Ports implemented by the components.
pub mod api {
    /// Push interface for session events.
    pub mod events;
    /// Persistence port for finalized measurements.
    pub mod storage;
    /// Async BLE transport used by the session.
    pub mod transport;
}

/// Core utilities and types used throughout the crate.
pub mod core {
    /// Session and application configuration.
    pub mod config;
    /// Crate-wide constants.
    pub mod constants;
    /// Error taxonomy.
    pub mod errors;
    /// Session events.
    pub mod events;
}

/// Estimates derived from a reading.
pub mod math {
    /// BMI, BMR and body fat estimates.
    pub mod body;
}

/// Domain data of a measurement session.
pub mod model {
    /// Notification frames and their decoder.
    pub mod reading;
    /// Stored measurement record.
    pub mod record;
    /// Session lifecycle and snapshots.
    pub mod session;
    /// Stabilization policies.
    pub mod stability;
}

/// Implementations driving a measurement.
pub mod components {
    /// btleplug backed transport.
    pub mod bluetooth;
    /// Single slot session controller with event fan-out.
    pub mod controller;
    /// The measurement session state machine.
    pub mod session;
    /// Scripted transport for tests and the `mock` feature.
    pub mod simulated;
    /// Memory and JSON file measurement stores.
    pub mod storage;
}
