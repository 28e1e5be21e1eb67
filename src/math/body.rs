//! Body Composition Computation
//!
//! This module contains the estimates derived from a weight reading and the
//! user's profile: BMI, basal metabolic rate and body fat percentage.

use crate::core::config::{Gender, UserProfile};
use crate::model::reading::Reading;
use log::trace;
use serde::{Deserialize, Serialize};

/// Estimates attached to a stored measurement.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyComposition {
    pub bmi: f64,
    /// Basal metabolic rate in kcal/day.
    pub bmr: f64,
    pub body_fat_percentage: f64,
}

impl BodyComposition {
    pub fn estimate(reading: &Reading, profile: &UserProfile) -> Self {
        let weight = reading.weight_kg();
        let bmi = calc_bmi(weight, profile.height_cm);
        let composition = Self {
            bmi,
            bmr: calc_bmr(weight, profile.height_cm, profile.age, profile.gender),
            body_fat_percentage: calc_body_fat(bmi, profile.age, profile.gender),
        };
        trace!("Estimated {:?} for {:.2} kg", composition, weight);
        composition
    }
}

/// Body Mass Index.
pub fn calc_bmi(weight_kg: f64, height_cm: f64) -> f64 {
    let height_m = height_cm / 100.0;
    weight_kg / (height_m * height_m)
}

/// Basal Metabolic Rate using the Mifflin-St Jeor equation.
pub fn calc_bmr(weight_kg: f64, height_cm: f64, age: u32, gender: Gender) -> f64 {
    let base = 10.0 * weight_kg + 6.25 * height_cm - 5.0 * age as f64;
    match gender {
        Gender::Male => base + 5.0,
        Gender::Female => base - 161.0,
    }
}

/// Body fat percentage using the Deurenberg formula.
///
/// This is a BMI based estimate; it does not use the impedance value.
pub fn calc_body_fat(bmi: f64, age: u32, gender: Gender) -> f64 {
    let base = 1.20 * bmi + 0.23 * age as f64;
    match gender {
        Gender::Male => base - 16.2,
        Gender::Female => base - 5.4,
    }
}
