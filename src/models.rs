//! Typed domain records
//!
//! The engine moves opaque maps around; these structs are what the rest of
//! the application works with. Unknown fields survive a round trip through
//! `extra`, so a newer remote schema is never truncated by an older client.

use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncResult;
use crate::record::{self, Payload, Record};

/// Collections the application syncs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Appointments,
    Medications,
    Habits,
    CareLinks,
    Profiles,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Appointments,
        Collection::Medications,
        Collection::Habits,
        Collection::CareLinks,
        Collection::Profiles,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Appointments => "appointments",
            Collection::Medications => "medications",
            Collection::Habits => "habits",
            Collection::CareLinks => "care_links",
            Collection::Profiles => "profiles",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown collection '{}'", s))
    }
}

/// A typed record stored in one collection
pub trait Model: Serialize + DeserializeOwned {
    const COLLECTION: Collection;

    fn id(&self) -> &str;

    /// Fields to send, without the id
    fn to_payload(&self) -> SyncResult<Payload> {
        let mut payload = record::to_payload(self)?;
        payload.remove(record::ID_FIELD);
        Ok(payload)
    }

    fn from_record(record: &Record) -> SyncResult<Self> {
        record::from_record(record)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Model for Appointment {
    const COLLECTION: Collection = Collection::Appointments;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dosage: String,
    /// Times of day the dose is due
    #[serde(default)]
    pub schedule: Vec<NaiveTime>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_active() -> bool {
    true
}

impl Model for Medication {
    const COLLECTION: Collection = Collection::Medications;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: String,
    pub name: String,
    /// Days the habit was completed, as `YYYY-MM-DD`
    #[serde(default)]
    pub completed_on: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Model for Habit {
    const COLLECTION: Collection = Collection::Habits;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CareRole {
    #[default]
    Caregiver,
    Family,
    Clinician,
}

/// A member of someone's care network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CareLink {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub role: CareRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Model for CareLink {
    const COLLECTION: Collection = Collection::CareLinks;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Model for Profile {
    const COLLECTION: Collection = Collection::Profiles;

    fn id(&self) -> &str {
        &self.id
    }
}
