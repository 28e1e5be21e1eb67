//! Configuration
//!
//! Session tuning values with their documented defaults, the optional user
//! profile used for body composition estimates, and the command line /
//! environment configuration of the `miscale` binary.

use crate::core::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MIN_STABLE_DURATION, DEFAULT_OVERALL_TIMEOUT,
    DEFAULT_SCAN_TIMEOUT, DEFAULT_STABLE_READINGS, DEFAULT_WEIGHT_TOLERANCE_KG,
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

/// Decides when a decoded reading counts as final.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StabilizationPolicy {
    /// The first frame the scale flags as settled completes the session.
    #[default]
    ScaleFlag,
    /// The last `readings` weights stayed within `tolerance_kg` of each other
    /// for at least `min_duration`.
    Window {
        readings: usize,
        tolerance_kg: f64,
        min_duration: Duration,
    },
}

impl StabilizationPolicy {
    pub fn window() -> Self {
        StabilizationPolicy::Window {
            readings: DEFAULT_STABLE_READINGS,
            tolerance_kg: DEFAULT_WEIGHT_TOLERANCE_KG,
            min_duration: DEFAULT_MIN_STABLE_DURATION,
        }
    }
}

/// Per-session tuning passed to `SessionController::start`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound for finding the advertising scale.
    pub scan_timeout: Duration,
    /// Upper bound for the GATT connect handshake.
    pub connect_timeout: Duration,
    /// Upper bound from start to any terminal state.
    pub overall_timeout: Duration,
    pub stabilization: StabilizationPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            stabilization: StabilizationPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(format!("gender must be male or female, got {:?}", other)),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("male"),
            Gender::Female => f.write_str("female"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProfileError {
    #[error("age must be positive")]
    InvalidAge,

    #[error("height must be positive, got {0}")]
    InvalidHeight(f64),

    #[error("profile is incomplete: age, height and gender are all required")]
    Incomplete,
}

/// Person standing on the scale; enables body composition estimates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub age: u32,
    pub height_cm: f64,
    pub gender: Gender,
}

impl UserProfile {
    pub fn new(age: u32, height_cm: f64, gender: Gender) -> Result<Self, ProfileError> {
        if age == 0 {
            return Err(ProfileError::InvalidAge);
        }
        if !(height_cm > 0.0) {
            return Err(ProfileError::InvalidHeight(height_cm));
        }
        Ok(Self {
            age,
            height_cm,
            gender,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StabilizationMode {
    /// Trust the scale's settled bit.
    Scale,
    /// Require a window of consistent readings.
    Window,
}

/// Command line and environment configuration of the `miscale` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "miscale", version, about = "Acquire a weight measurement from a Mi body composition scale")]
pub struct AppConfig {
    /// MAC address of the scale. Without one, the first scale advertising
    /// the body composition service is used.
    #[arg(long, env = "SCALE_MAC")]
    pub address: Option<String>,

    #[arg(long = "scan-timeout-secs", env = "SCAN_TIMEOUT_SECS", value_parser = parse_secs, default_value = "10")]
    pub scan_timeout: Duration,

    #[arg(long = "connect-timeout-secs", env = "CONNECT_TIMEOUT_SECS", value_parser = parse_secs, default_value = "15")]
    pub connect_timeout: Duration,

    #[arg(long = "overall-timeout-secs", env = "OVERALL_TIMEOUT_SECS", value_parser = parse_secs, default_value = "120")]
    pub overall_timeout: Duration,

    #[arg(long, env = "STABILIZATION", value_enum, default_value_t = StabilizationMode::Scale)]
    pub stabilization: StabilizationMode,

    #[arg(long, env = "STABLE_READINGS_REQUIRED", default_value_t = DEFAULT_STABLE_READINGS)]
    pub stable_readings: usize,

    #[arg(long, env = "WEIGHT_TOLERANCE", default_value_t = DEFAULT_WEIGHT_TOLERANCE_KG)]
    pub weight_tolerance: f64,

    #[arg(long = "min-stable-duration-secs", env = "MIN_STABLE_DURATION_SECONDS", value_parser = parse_secs, default_value = "3")]
    pub min_stable_duration: Duration,

    #[arg(long, env = "AGE")]
    pub age: Option<u32>,

    #[arg(long, env = "HEIGHT_CM")]
    pub height_cm: Option<f64>,

    #[arg(long, env = "GENDER")]
    pub gender: Option<Gender>,

    /// JSON file the finalized measurements are appended to.
    #[arg(long, env = "MEASUREMENT_STORE", default_value = "measurements.json")]
    pub store: PathBuf,

    /// Print the N most recent stored measurements and exit.
    #[arg(long, value_name = "N")]
    pub list: Option<usize>,
}

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        let stabilization = match self.stabilization {
            StabilizationMode::Scale => StabilizationPolicy::ScaleFlag,
            StabilizationMode::Window => StabilizationPolicy::Window {
                readings: self.stable_readings.max(1),
                tolerance_kg: self.weight_tolerance,
                min_duration: self.min_stable_duration,
            },
        };
        SessionConfig {
            scan_timeout: self.scan_timeout,
            connect_timeout: self.connect_timeout,
            overall_timeout: self.overall_timeout,
            stabilization,
        }
    }

    /// The user profile, if one was configured.
    pub fn profile(&self) -> Result<Option<UserProfile>, ProfileError> {
        match (self.age, self.height_cm, self.gender) {
            (None, None, None) => Ok(None),
            (Some(age), Some(height), Some(gender)) => {
                UserProfile::new(age, height, gender).map(Some)
            }
            _ => Err(ProfileError::Incomplete),
        }
    }
}

/// Parses a non-negative, finite number of seconds.
fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("{:?} is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("{:?} is not a valid duration in seconds", value))
}
