//! Field-by-field merge of a freshly mapped record into the stored one.
//!
//! Precedence, applied recursively from the document root:
//!
//! 1. an empty or missing existing value takes a non-empty candidate value;
//! 2. an empty candidate value never displaces what is stored;
//! 3. nested sections recurse;
//! 4. lists become the order-preserving union of existing then candidate;
//! 5. `meta_info.last_update` keeps the chronologically later timestamp;
//! 6. other scalars compare after [`normalize_for_comparison`], and the
//!    candidate wins only on a genuine difference.
//!
//! Because empty never overwrites non-empty and equal values never
//! overwrite, merging the same candidate twice is a no-op the second time.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::record::{
    Address, AuthorizedOfficial, BusinessAddresses, CanonicalProviderRecord, CurrentPracticeInfo,
    MedicareParticipation, MetaInfo, Npi, ParentOrganization, PracticeAddress,
    ProviderIdentification, ProviderLicensing, ProviderPersonalInfo, ProviderProfessionalInfo,
    ProviderStatus, Scalar, TelehealthServices,
};

/// Uniform emptiness: null, empty string, empty list, empty map.
pub trait Emptiness {
    fn is_empty_value(&self) -> bool;
}

impl Emptiness for Scalar {
    fn is_empty_value(&self) -> bool {
        matches!(self, Scalar::Text(s) if s.is_empty())
    }
}

impl<T: Emptiness> Emptiness for Option<T> {
    fn is_empty_value(&self) -> bool {
        self.as_ref().is_none_or(Emptiness::is_empty_value)
    }
}

impl<T> Emptiness for Vec<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

/// An address with every field null is an empty map.
impl Emptiness for Address {
    fn is_empty_value(&self) -> bool {
        !self.has_data()
    }
}

pub trait DeepMerge {
    /// Combine `self` (stored) with `candidate` (incoming) into a new value.
    fn deep_merge(&self, candidate: &Self) -> Self;
}

/// Comparison form of a scalar: digit-only strings and integers compare as
/// the same number, everything else compares as-is.
#[derive(Debug, PartialEq)]
pub enum Normalized<'a> {
    Int(i64),
    Other(&'a Scalar),
}

pub fn normalize_for_comparison(value: &Scalar) -> Normalized<'_> {
    match value {
        Scalar::Int(i) => Normalized::Int(*i),
        Scalar::Text(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s
            .parse()
            .map(Normalized::Int)
            .unwrap_or(Normalized::Other(value)),
        other => Normalized::Other(other),
    }
}

impl DeepMerge for Scalar {
    fn deep_merge(&self, candidate: &Self) -> Self {
        if normalize_for_comparison(self) == normalize_for_comparison(candidate) {
            self.clone()
        } else {
            candidate.clone()
        }
    }
}

impl<T: DeepMerge + Emptiness + Clone> DeepMerge for Option<T> {
    fn deep_merge(&self, candidate: &Self) -> Self {
        if candidate.is_empty_value() {
            return self.clone();
        }
        match (self, candidate) {
            (Some(existing), Some(incoming)) if !existing.is_empty_value() => {
                Some(existing.deep_merge(incoming))
            }
            _ => candidate.clone(),
        }
    }
}

impl<T: PartialEq + Clone> DeepMerge for Vec<T> {
    fn deep_merge(&self, candidate: &Self) -> Self {
        if candidate.is_empty() {
            return self.clone();
        }
        let mut merged: Vec<T> = Vec::with_capacity(self.len() + candidate.len());
        for item in self.iter().chain(candidate) {
            if !merged.contains(item) {
                merged.push(item.clone());
            }
        }
        merged
    }
}

impl DeepMerge for Npi {
    fn deep_merge(&self, _candidate: &Self) -> Self {
        *self
    }
}

macro_rules! deep_merge_fields {
    ($($ty:ident { $($field:ident),+ $(,)? })+) => {
        $(
            impl DeepMerge for $ty {
                fn deep_merge(&self, candidate: &Self) -> Self {
                    Self {
                        $($field: self.$field.deep_merge(&candidate.$field),)+
                    }
                }
            }
        )+
    };
}

deep_merge_fields! {
    ProviderIdentification { npi, pac_id, enrollment_id, entity_type_code, organization_name }
    ProviderPersonalInfo { last_name, first_name, middle_name, suffix, gender, credentials }
    ProviderProfessionalInfo {
        medical_school,
        graduation_year,
        primary_specialty,
        secondary_specialties,
        taxonomy_codes,
        taxonomy_primary,
    }
    ProviderLicensing { license_number, license_state }
    Address { line_1, line_2, city, state, zip_code, country, phone, fax }
    BusinessAddresses { mailing_address, practice_location }
    PracticeAddress { line_1, line_2, city, state, zip_code, phone, address_id }
    CurrentPracticeInfo {
        facility_name,
        facility_pac_id,
        organization_members_count,
        practice_address,
    }
    MedicareParticipation { individual_assignment, group_assignment }
    ProviderStatus {
        active,
        deactivation_reason,
        deactivation_date,
        reactivation_date,
        enumeration_date,
        last_update_date,
        certification_date,
        is_sole_proprietor,
        is_organization_subpart,
    }
    TelehealthServices { telehealth_eligible }
    AuthorizedOfficial { last_name, first_name, middle_name, title, phone, credentials }
    ParentOrganization { legal_business_name, tax_id }
}

/// Parse the timestamp shapes seen in `last_update`: RFC 3339 with an
/// offset, or a naive ISO-8601 datetime taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Keep the later of two `last_update` values.
///
/// When only one side parses, the parsable one is kept; a malformed
/// candidate never replaces a valid stored timestamp. When neither parses
/// the candidate wins.
pub fn merge_last_update(existing: Option<&str>, candidate: Option<&str>) -> Option<String> {
    let Some(candidate) = candidate.filter(|s| !s.is_empty()) else {
        return existing.map(str::to_string);
    };
    let Some(existing) = existing.filter(|s| !s.is_empty()) else {
        return Some(candidate.to_string());
    };

    let winner = match (parse_timestamp(existing), parse_timestamp(candidate)) {
        (Some(old), Some(new)) if new > old => candidate,
        (Some(_), Some(_)) => existing,
        (Some(_), None) => existing,
        (None, _) => candidate,
    };
    Some(winner.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: CanonicalProviderRecord,
    pub changed: bool,
}

/// Merge `candidate` into `existing`.
///
/// `changed` is decided by structural equality with `existing`, not by the
/// content hash. `meta_info` only moves when the data sections did: a fresh
/// mapping timestamp on identical data is not a change.
pub fn merge(
    existing: &CanonicalProviderRecord,
    candidate: &CanonicalProviderRecord,
) -> MergeOutcome {
    let mut merged = CanonicalProviderRecord {
        provider_identification: existing
            .provider_identification
            .deep_merge(&candidate.provider_identification),
        provider_personal_info: existing
            .provider_personal_info
            .deep_merge(&candidate.provider_personal_info),
        provider_professional_info: existing
            .provider_professional_info
            .deep_merge(&candidate.provider_professional_info),
        provider_licensing: existing
            .provider_licensing
            .deep_merge(&candidate.provider_licensing),
        business_addresses: existing
            .business_addresses
            .deep_merge(&candidate.business_addresses),
        current_practice_info: existing
            .current_practice_info
            .deep_merge(&candidate.current_practice_info),
        medicare_participation: existing
            .medicare_participation
            .deep_merge(&candidate.medicare_participation),
        provider_status: existing.provider_status.deep_merge(&candidate.provider_status),
        telehealth_services: existing
            .telehealth_services
            .deep_merge(&candidate.telehealth_services),
        additional_identifiers: existing
            .additional_identifiers
            .deep_merge(&candidate.additional_identifiers),
        authorized_official: existing
            .authorized_official
            .deep_merge(&candidate.authorized_official),
        parent_organization: existing
            .parent_organization
            .deep_merge(&candidate.parent_organization),
        meta_info: existing.meta_info.clone(),
    };

    if merged.without_meta() != existing.without_meta() {
        merged.meta_info = MetaInfo {
            data_hash: Some(merged.content_hash()),
            last_update: merge_last_update(
                existing.meta_info.last_update.as_deref(),
                candidate.meta_info.last_update.as_deref(),
            ),
        };
    }

    let changed = merged != *existing;
    MergeOutcome {
        record: merged,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AdditionalIdentifier;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn npi() -> Npi {
        Npi::from(1000000001)
    }

    fn text(s: &str) -> Option<Scalar> {
        Some(Scalar::text(s))
    }

    fn list(items: &[i64]) -> Vec<Scalar> {
        items.iter().map(|i| Scalar::Int(*i)).collect()
    }

    fn sample_existing() -> CanonicalProviderRecord {
        let mut r = CanonicalProviderRecord::empty(npi());
        r.provider_personal_info.last_name = text("SMITH");
        r.provider_personal_info.first_name = text("JANE");
        r.business_addresses.mailing_address = Some(Address {
            line_1: text("1 MAIN ST"),
            city: text("AUSTIN"),
            state: text("TX"),
            ..Address::default()
        });
        r.provider_professional_info.taxonomy_codes = vec![Scalar::text("207R00000X")];
        r.meta_info = MetaInfo {
            data_hash: Some(r.content_hash()),
            last_update: Some("2024-01-01T00:00:00".into()),
        };
        r
    }

    fn sample_candidate() -> CanonicalProviderRecord {
        let mut r = CanonicalProviderRecord::empty(npi());
        r.provider_personal_info.last_name = text("SMITH-JONES");
        r.provider_personal_info.first_name = text("");
        r.provider_professional_info.primary_specialty = text("CARDIOLOGY");
        r.provider_professional_info.taxonomy_codes =
            vec![Scalar::text("207RC0000X"), Scalar::text("207R00000X")];
        r.meta_info = MetaInfo {
            data_hash: Some(r.content_hash()),
            last_update: Some("2024-06-01T00:00:00".into()),
        };
        r
    }

    #[test]
    fn merge_is_idempotent() {
        let a = sample_existing();
        let b = sample_candidate();
        let once = merge(&a, &b);
        assert!(once.changed);
        let twice = merge(&once.record, &b);
        assert!(!twice.changed);
        assert_eq!(twice.record, once.record);
    }

    #[test]
    fn empty_fields_are_filled_and_never_erase() {
        let a = sample_existing();
        let b = sample_candidate();
        let merged = merge(&a, &b).record;

        // existing empty, candidate non-empty
        assert_eq!(merged.provider_professional_info.primary_specialty, text("CARDIOLOGY"));
        // candidate empty string and null keep existing
        assert_eq!(merged.provider_personal_info.first_name, text("JANE"));
        assert_eq!(
            merged.business_addresses.mailing_address,
            a.business_addresses.mailing_address
        );
        // genuine conflict: candidate wins
        assert_eq!(merged.provider_personal_info.last_name, text("SMITH-JONES"));
    }

    #[test]
    fn lists_union_in_first_seen_order() {
        let merged = list(&[1, 2, 3]).deep_merge(&list(&[2, 3, 4]));
        assert_eq!(merged, list(&[1, 2, 3, 4]));

        let merged = list(&[1, 2]).deep_merge(&Vec::new());
        assert_eq!(merged, list(&[1, 2]));

        let merged = Vec::<Scalar>::new().deep_merge(&list(&[5]));
        assert_eq!(merged, list(&[5]));
    }

    #[test]
    fn digit_strings_and_integers_compare_equal() {
        let stored = Scalar::Int(1998);
        let incoming = Scalar::text("1998");
        assert_eq!(stored.deep_merge(&incoming), Scalar::Int(1998));

        let stored = Scalar::text("02139");
        let incoming = Scalar::text("2139");
        assert_eq!(stored.deep_merge(&incoming), Scalar::text("02139"));

        let stored = Scalar::text("Y");
        let incoming = Scalar::text("N");
        assert_eq!(stored.deep_merge(&incoming), Scalar::text("N"));
    }

    #[test]
    fn later_last_update_wins_regardless_of_arrival_order() {
        assert_eq!(
            merge_last_update(Some("2024-01-01T00:00:00"), Some("2023-01-01T00:00:00")),
            Some("2024-01-01T00:00:00".to_string())
        );
        assert_eq!(
            merge_last_update(Some("2023-01-01T00:00:00"), Some("2024-01-01T00:00:00+00:00")),
            Some("2024-01-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn older_candidate_does_not_rewind_last_update_on_a_real_change() {
        let a = sample_existing();
        let mut b = sample_candidate();
        b.meta_info.last_update = Some("2023-01-01T00:00:00".into());
        let merged = merge(&a, &b);
        assert!(merged.changed);
        assert_eq!(
            merged.record.meta_info.last_update.as_deref(),
            Some("2024-01-01T00:00:00")
        );
        assert_eq!(
            merged.record.meta_info.data_hash,
            Some(merged.record.content_hash())
        );
    }

    #[test]
    fn unparsable_timestamps_fall_back_to_the_valid_side() {
        assert_eq!(
            merge_last_update(Some("2024-01-01T00:00:00"), Some("yesterday")),
            Some("2024-01-01T00:00:00".to_string())
        );
        assert_eq!(
            merge_last_update(Some("garbage"), Some("2024-01-01T00:00:00")),
            Some("2024-01-01T00:00:00".to_string())
        );
        assert_eq!(
            merge_last_update(Some("garbage"), Some("also garbage")),
            Some("also garbage".to_string())
        );
        assert_eq!(
            merge_last_update(Some("2024-01-01T00:00:00"), None).as_deref(),
            Some("2024-01-01T00:00:00")
        );
    }

    #[test]
    fn identical_data_with_newer_timestamp_is_unchanged() {
        let a = sample_existing();
        let mut b = a.clone();
        b.meta_info.last_update = Some("2031-01-01T00:00:00Z".into());
        let merged = merge(&a, &b);
        assert!(!merged.changed);
        assert_eq!(merged.record, a);
    }

    #[test]
    fn self_nested_practice_address_merges_flat() {
        let nested = json!({
            "provider_identification": { "npi": 1000000001u64 },
            "business_addresses": {
                "practice_location": {
                    "practice_location": { "line_1": "9 ELM ST", "city": "BOSTON", "state": "MA" }
                }
            }
        });
        let flat = json!({
            "provider_identification": { "npi": "1000000001" },
            "business_addresses": {
                "practice_location": { "zip_code": "02139", "city": "BOSTON" }
            }
        });
        let existing = CanonicalProviderRecord::from_json(nested).unwrap();
        let candidate = CanonicalProviderRecord::from_json(flat).unwrap();

        let pre = serde_json::to_value(&existing).unwrap();
        assert!(pre["business_addresses"]["practice_location"].get("practice_location").is_none());

        let merged = merge(&existing, &candidate).record;
        let post = serde_json::to_value(&merged).unwrap();
        let practice = &post["business_addresses"]["practice_location"];
        assert!(practice.get("practice_location").is_none());
        assert_eq!(practice["line_1"], json!("9 ELM ST"));
        assert_eq!(practice["zip_code"], json!("02139"));
        assert_eq!(practice["city"], json!("BOSTON"));
    }

    #[test]
    fn absent_address_is_taken_from_candidate() {
        let a = CanonicalProviderRecord::empty(npi());
        let b = sample_existing();
        let merged = merge(&a, &b).record;
        assert_eq!(
            merged.business_addresses.mailing_address,
            b.business_addresses.mailing_address
        );
    }

    #[test]
    fn empty_address_never_displaces_a_stored_one() {
        let mut a = CanonicalProviderRecord::empty(npi());
        a.provider_personal_info.last_name = text("SMITH");
        let candidate = CanonicalProviderRecord::from_json(json!({
            "provider_identification": { "npi": 1000000001u64 },
            "business_addresses": { "mailing_address": {} }
        }))
        .unwrap();
        assert_eq!(candidate.business_addresses.mailing_address, Some(Address::default()));

        let merged = merge(&a, &candidate);
        assert!(!merged.changed);
        assert_eq!(merged.record.business_addresses.mailing_address, None);

        let b = sample_existing();
        let merged = merge(&b, &candidate);
        assert!(!merged.changed);
        assert_eq!(
            merged.record.business_addresses.mailing_address,
            b.business_addresses.mailing_address
        );
    }

    #[test]
    fn additional_identifiers_collapse_duplicates_across_sources() {
        let id = AdditionalIdentifier {
            identifier: text("A123"),
            type_code: text("05"),
            state: text("TX"),
            issuer: None,
        };
        let other = AdditionalIdentifier {
            identifier: text("B456"),
            ..AdditionalIdentifier::default()
        };
        let merged = vec![id.clone()].deep_merge(&vec![other.clone(), id.clone()]);
        assert_eq!(merged, vec![id, other]);
    }
}
