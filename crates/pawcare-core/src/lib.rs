//! Core domain model and filter types for the PawCare marketplace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "pawcare-core";

/// Legacy wildcard value sent by older clients for "no constraint".
pub const WILDCARD: &str = "Todos";

/// Backend table names.
pub mod tables {
    pub const PROVIDERS: &str = "hosts";
    pub const PETS: &str = "pets";
    pub const BOOKINGS: &str = "bookings";
    pub const ADOPTION_REQUESTS: &str = "adoption_requests";
    pub const LOST_PET_REPORTS: &str = "lost_pet_reports";
}

pub const BOOKING_COMPLETED: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCategory {
    Caregiver,
    Veterinary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PetCategory {
    /// Owned by a user, not listed on the marketplace.
    Personal,
    Adoption,
}

impl PetCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            PetCategory::Personal => "personal",
            PetCategory::Adoption => "adoption",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostReportStatus {
    Lost,
    Found,
}

impl LostReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LostReportStatus::Lost => "lost",
            LostReportStatus::Found => "found",
        }
    }
}

/// Caregiver or veterinary clinic offering pet care.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CareProvider {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub category: ProviderCategory,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub price_per_night: f64,
    #[serde(default, deserialize_with = "nullable_list")]
    pub pet_types: Vec<String>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub services: Vec<String>,
    #[serde(default)]
    pub certifications: Option<Vec<String>>,
    /// `None` until the provider has been reviewed.
    #[serde(default)]
    pub rating: Option<f64>,
}

impl CareProvider {
    pub fn is_certified(&self) -> bool {
        self.certifications
            .as_ref()
            .is_some_and(|certs| !certs.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptablePet {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub pet_type: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default = "default_pet_category")]
    pub category: PetCategory,
    #[serde(default)]
    pub is_lost: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_pet_category() -> PetCategory {
    PetCategory::Adoption
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LostPetReport {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub pet_id: String,
    #[serde(deserialize_with = "id_string")]
    pub owner_id: String,
    pub status: LostReportStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_seen_location: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Caller-supplied details for a new lost-pet report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLostReport {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_seen_location: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact_phone: Option<String>,
}

/// Partial update of a lost-pet report. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LostReportPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LostReportStatus>,
}

/// Authenticated account as returned by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }
}

/// Inclusive price bounds, per night.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, price: f64) -> bool {
        self.min <= price && price <= self.max
    }

    /// Both bounds finite and ordered. A NaN bound would match nothing.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Search constraints over care providers. `None` and empty mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderFilters {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub pet_type: Option<String>,
    #[serde(default)]
    pub price: Option<PriceRange>,
    /// Match-any: a provider offering at least one of these qualifies.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub certified_only: bool,
}

/// Search constraints over adoptable pets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PetFilters {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub pet_type: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub age: Option<String>,
}

/// Per-user dashboard counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStatsSummary {
    pub completed_bookings: u64,
    /// Mean over rated bookings only; `None` when nothing was rated.
    pub average_rating: Option<f64>,
    pub registered_pets: u64,
    pub adoption_requests: u64,
}

/// Normalizes a raw request parameter into an optional filter value.
///
/// Blank input and the legacy [`WILDCARD`] both mean "no constraint".
pub fn choice_param(raw: Option<&str>) -> Option<String> {
    let value = raw?.trim();
    if value.is_empty() || value == WILDCARD {
        None
    } else {
        Some(value.to_string())
    }
}

/// Splits a comma separated list parameter, dropping blanks and the wildcard.
pub fn list_param(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .filter_map(|part| choice_param(Some(part)))
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

// Backends hand out either uuid strings or bigint keys.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawId>::deserialize(deserializer).map(|raw| raw.map(String::from))
}

fn nullable_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer).map(Option::unwrap_or_default)
}
