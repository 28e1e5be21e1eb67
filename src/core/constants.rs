use btleplug::api::bleuuid::uuid_from_u16;
use std::time::Duration;
use uuid::Uuid;

/// UUID for the Body Composition Service advertised by the scale.
pub const BODY_COMPOSITION_SERVICE_UUID: Uuid = uuid_from_u16(0x181B);
/// UUID for the Body Composition Measurement Characteristic.
pub const BODY_COMPOSITION_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A9C);

/// Length of a body composition notification in bytes.
pub const FRAME_LEN: usize = 13;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_STABLE_READINGS: usize = 7;
pub const DEFAULT_WEIGHT_TOLERANCE_KG: f64 = 0.1;
pub const DEFAULT_MIN_STABLE_DURATION: Duration = Duration::from_secs(3);

/// Capacity of the live event fan-out; slower subscribers skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

pub const DATE_TIME_STRING_FORMAT: &str = "[year]-[month]-[day] [hour]:[minute]:[second]";

/// Upper bound for the best-effort disconnect on teardown.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
