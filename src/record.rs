//! Canonical provider document shared by both upstream sources.
//!
//! Every section is always serialized, with `null` members where a source
//! has nothing to say, so documents mapped from either source have the same
//! shape and can be merged field by field.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A leaf value. Historical documents carry numbers and numeric strings
/// interchangeably, so both shapes deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub type Field = Option<Scalar>;

impl Scalar {
    pub fn text(s: impl Into<String>) -> Self {
        Scalar::Text(s.into())
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// National Provider Identifier.
///
/// Parses from a JSON number, a numeric string, or a float-formatted
/// number (`1234567890.0`) so every historical representation resolves to
/// the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Npi(u64);

impl Npi {
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        let digits = s.strip_suffix(".0").unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Npi)
    }

    /// Canonical key stored in the unique index.
    pub fn key(self) -> String {
        self.0.to_string()
    }
}

impl From<u64> for Npi {
    fn from(v: u64) -> Self {
        Npi(v)
    }
}

impl fmt::Display for Npi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Npi {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Npi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NpiVisitor;

        impl Visitor<'_> for NpiVisitor {
            type Value = Npi;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an NPI as a number or numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Npi, E> {
                Ok(Npi(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Npi, E> {
                u64::try_from(v)
                    .map(Npi)
                    .map_err(|_| E::custom(format!("negative NPI {v}")))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Npi, E> {
                if v.fract() == 0.0 && v >= 0.0 && v < u64::MAX as f64 {
                    Ok(Npi(v as u64))
                } else {
                    Err(E::custom(format!("non-integral NPI {v}")))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Npi, E> {
                Npi::parse(v).ok_or_else(|| E::custom(format!("unparsable NPI {v:?}")))
            }
        }

        deserializer.deserialize_any(NpiVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderIdentification {
    #[serde(alias = "identifier")]
    pub npi: Npi,
    pub pac_id: Field,
    pub enrollment_id: Field,
    pub entity_type_code: Field,
    pub organization_name: Field,
}

impl ProviderIdentification {
    pub fn new(npi: Npi) -> Self {
        Self {
            npi,
            pac_id: None,
            enrollment_id: None,
            entity_type_code: None,
            organization_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderPersonalInfo {
    pub last_name: Field,
    pub first_name: Field,
    pub middle_name: Field,
    pub suffix: Field,
    pub gender: Field,
    pub credentials: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfessionalInfo {
    pub medical_school: Field,
    pub graduation_year: Field,
    pub primary_specialty: Field,
    #[serde(default)]
    pub secondary_specialties: Vec<Scalar>,
    #[serde(default, alias = "taxonomy_code")]
    pub taxonomy_codes: Vec<Scalar>,
    pub taxonomy_primary: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderLicensing {
    pub license_number: Field,
    pub license_state: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub line_1: Field,
    pub line_2: Field,
    pub city: Field,
    pub state: Field,
    pub zip_code: Field,
    pub country: Field,
    pub phone: Field,
    pub fax: Field,
}

impl Address {
    pub fn has_data(&self) -> bool {
        [
            &self.line_1,
            &self.line_2,
            &self.city,
            &self.state,
            &self.zip_code,
            &self.country,
            &self.phone,
            &self.fax,
        ]
        .iter()
        .any(|f| f.is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessAddresses {
    pub mailing_address: Option<Address>,
    pub practice_location: Option<Address>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PracticeAddress {
    pub line_1: Field,
    pub line_2: Field,
    pub city: Field,
    pub state: Field,
    pub zip_code: Field,
    pub phone: Field,
    pub address_id: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentPracticeInfo {
    pub facility_name: Field,
    pub facility_pac_id: Field,
    pub organization_members_count: Field,
    #[serde(default)]
    pub practice_address: PracticeAddress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicareParticipation {
    pub individual_assignment: Field,
    pub group_assignment: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub active: Field,
    pub deactivation_reason: Field,
    pub deactivation_date: Field,
    pub reactivation_date: Field,
    pub enumeration_date: Field,
    pub last_update_date: Field,
    pub certification_date: Field,
    pub is_sole_proprietor: Field,
    pub is_organization_subpart: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelehealthServices {
    pub telehealth_eligible: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalIdentifier {
    pub identifier: Field,
    pub type_code: Field,
    pub state: Field,
    pub issuer: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedOfficial {
    pub last_name: Field,
    pub first_name: Field,
    pub middle_name: Field,
    pub title: Field,
    pub phone: Field,
    pub credentials: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentOrganization {
    pub legal_business_name: Field,
    pub tax_id: Field,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub data_hash: Option<String>,
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProviderRecord {
    pub provider_identification: ProviderIdentification,
    #[serde(default)]
    pub provider_personal_info: ProviderPersonalInfo,
    #[serde(default)]
    pub provider_professional_info: ProviderProfessionalInfo,
    #[serde(default)]
    pub provider_licensing: ProviderLicensing,
    #[serde(default)]
    pub business_addresses: BusinessAddresses,
    #[serde(default)]
    pub current_practice_info: CurrentPracticeInfo,
    #[serde(default)]
    pub medicare_participation: MedicareParticipation,
    #[serde(default)]
    pub provider_status: ProviderStatus,
    #[serde(default)]
    pub telehealth_services: TelehealthServices,
    #[serde(default)]
    pub additional_identifiers: Vec<AdditionalIdentifier>,
    #[serde(default)]
    pub authorized_official: AuthorizedOfficial,
    #[serde(default)]
    pub parent_organization: ParentOrganization,
    #[serde(default)]
    pub meta_info: MetaInfo,
}

impl CanonicalProviderRecord {
    /// An otherwise empty record for `npi`.
    pub fn empty(npi: Npi) -> Self {
        Self {
            provider_identification: ProviderIdentification::new(npi),
            provider_personal_info: ProviderPersonalInfo::default(),
            provider_professional_info: ProviderProfessionalInfo::default(),
            provider_licensing: ProviderLicensing::default(),
            business_addresses: BusinessAddresses::default(),
            current_practice_info: CurrentPracticeInfo::default(),
            medicare_participation: MedicareParticipation::default(),
            provider_status: ProviderStatus::default(),
            telehealth_services: TelehealthServices::default(),
            additional_identifiers: Vec::new(),
            authorized_official: AuthorizedOfficial::default(),
            parent_organization: ParentOrganization::default(),
            meta_info: MetaInfo::default(),
        }
    }

    pub fn npi(&self) -> Npi {
        self.provider_identification.npi
    }

    /// Decode a raw document, flattening self-nested addresses first.
    pub fn from_json(mut doc: Value) -> serde_json::Result<Self> {
        normalize_business_addresses(&mut doc);
        serde_json::from_value(doc)
    }

    /// SHA-256 over the key-sorted JSON of every section except `meta_info`.
    pub fn content_hash(&self) -> String {
        let mut doc = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut doc {
            map.remove("meta_info");
        }
        // serde_json's default map is a BTreeMap, so keys serialize sorted.
        hex::encode(Sha256::digest(doc.to_string().as_bytes()))
    }

    /// Same record with `meta_info` cleared, for content comparisons.
    pub fn without_meta(&self) -> Self {
        Self {
            meta_info: MetaInfo::default(),
            ..self.clone()
        }
    }
}

/// Replace `{"<kind>": {...}}` address values with the inner object.
///
/// Some producers wrapped each address under its own name, sometimes next to
/// stray flat fields. The wrapped object wins; non-null siblings fill the
/// gaps. Stored documents must always hold the fields directly.
pub fn normalize_business_addresses(doc: &mut Value) {
    let Some(addresses) = doc
        .get_mut("business_addresses")
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    for kind in ["mailing_address", "practice_location"] {
        let Some(Value::Object(outer)) = addresses.get_mut(kind) else {
            continue;
        };
        if !outer.get(kind).is_some_and(Value::is_object) {
            continue;
        }
        let Some(Value::Object(mut inner)) = outer.remove(kind) else {
            continue;
        };
        for (key, value) in std::mem::take(outer) {
            if value.is_null() {
                continue;
            }
            let slot = inner.entry(key).or_insert(Value::Null);
            if slot.is_null() {
                *slot = value;
            }
        }
        addresses.insert(kind.to_string(), Value::Object(inner));
    }
}
