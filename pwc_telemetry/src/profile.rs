//! Named calibration profiles and their JSON document store.
//!
//! The persisted document maps each profile name to two models:
//!
//! ```json
//! { "GP1800R": { "rpm_model":  { "speed_mph": [0, 30], "rpm": [1000, 5000] },
//!                "fuel_model": { "rpm": [1000, 5000], "lph": [2, 10] } } }
//! ```
//!
//! Models are validated into [`Curve`]s when the document is read, so a
//! malformed profile is rejected at load time and never reaches the engine.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::curve::Curve;
use crate::{Result, TelemetryError};

#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub name: String,
    pub rpm_curve: Curve,
    pub fuel_curve: Curve,
}

impl Profile {
    pub fn new(name: impl Into<String>, rpm_curve: Curve, fuel_curve: Curve) -> Self {
        Self {
            name: name.into(),
            rpm_curve,
            fuel_curve,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RpmModelDoc {
    speed_mph: Vec<f64>,
    rpm: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FuelModelDoc {
    rpm: Vec<f64>,
    lph: Vec<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileDoc {
    rpm_model: RpmModelDoc,
    fuel_model: FuelModelDoc,
}

impl ProfileDoc {
    fn into_profile(self, name: &str) -> Result<Profile> {
        let rpm_curve = Curve::from_columns(
            &format!("{name}/rpm_model"),
            self.rpm_model.speed_mph,
            self.rpm_model.rpm,
        )?;
        let fuel_curve = Curve::from_columns(
            &format!("{name}/fuel_model"),
            self.fuel_model.rpm,
            self.fuel_model.lph,
        )?;
        Ok(Profile::new(name, rpm_curve, fuel_curve))
    }

    fn from_profile(profile: &Profile) -> Self {
        Self {
            rpm_model: RpmModelDoc {
                speed_mph: profile.rpm_curve.xs().to_vec(),
                rpm: profile.rpm_curve.ys().to_vec(),
            },
            fuel_model: FuelModelDoc {
                rpm: profile.fuel_curve.xs().to_vec(),
                lph: profile.fuel_curve.ys().to_vec(),
            },
        }
    }
}

/// In-memory set of profiles keyed by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProfileStore {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let docs: BTreeMap<String, ProfileDoc> =
            serde_json::from_str(text).map_err(|e| TelemetryError::ProfileStore(e.to_string()))?;
        let mut store = Self::new();
        for (name, doc) in docs {
            let profile = doc.into_profile(&name)?;
            store.profiles.insert(name, profile);
        }
        Ok(store)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let docs: BTreeMap<&str, ProfileDoc> = self
            .profiles
            .iter()
            .map(|(name, profile)| (name.as_str(), ProfileDoc::from_profile(profile)))
            .collect();
        serde_json::to_string_pretty(&docs).map_err(|e| TelemetryError::ProfileStore(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            TelemetryError::ProfileStore(format!("failed to read {}: {}", path.display(), e))
        })?;
        let store = Self::from_json_str(&text).map_err(|e| match e {
            TelemetryError::ProfileStore(msg) => {
                TelemetryError::ProfileStore(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        info!("Loaded {} profile(s) from {}", store.len(), path.display());
        Ok(store)
    }

    /// Load `path`, falling back to an empty store when the document is
    /// missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => store,
            Err(err) => {
                warn!("Could not load profiles ({}); starting with none", err);
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_json_string()?;
        fs::write(path, text).map_err(|e| {
            TelemetryError::ProfileStore(format!("failed to write {}: {}", path.display(), e))
        })?;
        info!("Saved {} profile(s) to {}", self.len(), path.display());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| TelemetryError::ProfileNotFound(name.to_string()))
    }

    /// First profile by name; used when the caller does not pick one.
    pub fn first(&self) -> Option<&Profile> {
        self.profiles.values().next()
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Insert or replace a profile, returning the previous one with that name.
    pub fn insert(&mut self, profile: Profile) -> Option<Profile> {
        self.profiles.insert(profile.name.clone(), profile)
    }

    pub fn remove(&mut self, name: &str) -> Result<Profile> {
        self.profiles
            .remove(name)
            .ok_or_else(|| TelemetryError::ProfileNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
