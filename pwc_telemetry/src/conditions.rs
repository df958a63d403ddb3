//! Ride conditions and the composite correction factor applied to the RPM curve.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Result, TelemetryError};

/// Rider weight the calibration curves were recorded at.
pub const REFERENCE_WEIGHT_KG: f64 = 80.0;
const WEIGHT_FACTOR_PER_KG: f64 = 0.001;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EngineSize {
    Small,
    Large,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FuelLoad {
    Full,
    Half,
    Low,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DriveMode {
    Normal,
    Limited,
    NoWake,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WaterCondition {
    Calm,
    Rough,
}

impl EngineSize {
    pub fn factor(self) -> f64 {
        match self {
            EngineSize::Small => 1.00,
            EngineSize::Large => 1.05,
        }
    }
}

impl FuelLoad {
    pub fn factor(self) -> f64 {
        match self {
            FuelLoad::Full => 1.02,
            FuelLoad::Half => 1.01,
            FuelLoad::Low => 1.00,
        }
    }
}

impl DriveMode {
    pub fn factor(self) -> f64 {
        match self {
            DriveMode::Normal => 1.00,
            DriveMode::Limited => 0.85,
            DriveMode::NoWake => 0.30,
        }
    }
}

impl WaterCondition {
    pub fn factor(self) -> f64 {
        match self {
            WaterCondition::Calm => 1.00,
            WaterCondition::Rough => 1.03,
        }
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn invalid(field: &'static str, value: &str) -> TelemetryError {
    TelemetryError::InvalidConditionValue {
        field,
        value: value.to_string(),
    }
}

impl FromStr for EngineSize {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "small" | "1.8l" => Ok(EngineSize::Small),
            "large" | "1.9l" => Ok(EngineSize::Large),
            _ => Err(invalid("engine size", s)),
        }
    }
}

impl FromStr for FuelLoad {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "full" => Ok(FuelLoad::Full),
            "half" => Ok(FuelLoad::Half),
            "low" => Ok(FuelLoad::Low),
            _ => Err(invalid("fuel load", s)),
        }
    }
}

impl FromStr for DriveMode {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "normal" => Ok(DriveMode::Normal),
            "limited" | "l-mode" => Ok(DriveMode::Limited),
            "no-wake" | "nowake" | "no_wake" => Ok(DriveMode::NoWake),
            _ => Err(invalid("drive mode", s)),
        }
    }
}

impl FromStr for WaterCondition {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "calm" => Ok(WaterCondition::Calm),
            "rough" => Ok(WaterCondition::Rough),
            _ => Err(invalid("water condition", s)),
        }
    }
}

impl fmt::Display for EngineSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineSize::Small => "small",
            EngineSize::Large => "large",
        })
    }
}

impl fmt::Display for FuelLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FuelLoad::Full => "full",
            FuelLoad::Half => "half",
            FuelLoad::Low => "low",
        })
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriveMode::Normal => "normal",
            DriveMode::Limited => "limited",
            DriveMode::NoWake => "no-wake",
        })
    }
}

impl fmt::Display for WaterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaterCondition::Calm => "calm",
            WaterCondition::Rough => "rough",
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RideConditions {
    pub rider_weight_kg: f64,
    pub engine_size: EngineSize,
    pub fuel_load: FuelLoad,
    pub drive_mode: DriveMode,
    pub water_condition: WaterCondition,
}

impl Default for RideConditions {
    fn default() -> Self {
        Self {
            rider_weight_kg: 77.0,
            engine_size: EngineSize::Small,
            fuel_load: FuelLoad::Full,
            drive_mode: DriveMode::Normal,
            water_condition: WaterCondition::Calm,
        }
    }
}

impl RideConditions {
    /// Build conditions from user-entered values, matching enum names case-insensitively.
    pub fn parse(
        rider_weight_kg: f64,
        engine_size: &str,
        fuel_load: &str,
        drive_mode: &str,
        water_condition: &str,
    ) -> Result<Self> {
        if !rider_weight_kg.is_finite() || rider_weight_kg <= 0.0 {
            return Err(invalid("rider weight", &rider_weight_kg.to_string()));
        }
        Ok(Self {
            rider_weight_kg,
            engine_size: engine_size.parse()?,
            fuel_load: fuel_load.parse()?,
            drive_mode: drive_mode.parse()?,
            water_condition: water_condition.parse()?,
        })
    }

    /// Linear in rider weight around the 80 kg reference, unclamped.
    pub fn weight_factor(&self) -> f64 {
        1.0 + (self.rider_weight_kg - REFERENCE_WEIGHT_KG) * WEIGHT_FACTOR_PER_KG
    }

    pub fn total_factor(&self) -> f64 {
        self.engine_size.factor()
            * self.weight_factor()
            * self.fuel_load.factor()
            * self.water_condition.factor()
            * self.drive_mode.factor()
    }
}

impl fmt::Display for RideConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} kg, {} engine, {} fuel, {} mode, {} water",
            self.rider_weight_kg, self.engine_size, self.fuel_load, self.drive_mode, self.water_condition
        )
    }
}
