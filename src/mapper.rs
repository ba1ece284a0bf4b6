//! Source row -> canonical provider record.
//!
//! Column names follow the published layouts of the CMS Doctors & Clinicians
//! national file (enrollment) and the NPPES dissemination file (registry).
//! Columns a source does not carry simply map to null.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::MapError;
use crate::reader::Row;
use crate::record::{
    AdditionalIdentifier, Address, AuthorizedOfficial, BusinessAddresses, CanonicalProviderRecord,
    CurrentPracticeInfo, Field, MedicareParticipation, MetaInfo, Npi, ParentOrganization,
    PracticeAddress, ProviderIdentification, ProviderLicensing, ProviderPersonalInfo,
    ProviderProfessionalInfo, ProviderStatus, Scalar, TelehealthServices,
};
use crate::schema::SourceKind;

pub const NPI_COLUMN: &str = "NPI";

const MAX_SECONDARY_SPECIALTIES: usize = 4;
const MAX_TAXONOMY_CODES: usize = 15;
const MAX_OTHER_IDENTIFIERS: usize = 50;

/// Map one row. Fails only when the NPI is missing or unparsable.
pub fn map_row(
    row: &Row<'_>,
    kind: SourceKind,
    mapped_at: DateTime<Utc>,
) -> Result<CanonicalProviderRecord, MapError> {
    let raw_npi = row.get(NPI_COLUMN);
    let npi = raw_npi
        .and_then(Npi::parse)
        .ok_or_else(|| MapError::RequiredFieldMissing {
            row: row.number(),
            field: NPI_COLUMN,
            value: raw_npi.map(str::to_string),
        })?;

    let mut record = match kind {
        SourceKind::Enrollment => map_enrollment(row, npi),
        SourceKind::Registry => map_registry(row, npi),
        SourceKind::Unknown => CanonicalProviderRecord::empty(npi),
    };

    record.meta_info = MetaInfo {
        data_hash: Some(record.content_hash()),
        last_update: Some(mapped_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
    };
    Ok(record)
}

fn field(row: &Row<'_>, column: &str) -> Field {
    row.get(column).map(Scalar::from)
}

/// Values of `<base>1..=max` (or `<base>_1..`), skipping blanks, in column
/// order.
fn indexed(row: &Row<'_>, base: &str, max: usize) -> Vec<Scalar> {
    (1..=max)
        .filter_map(|i| row.get(&format!("{base}{i}")))
        .map(Scalar::from)
        .collect()
}

fn push_unique(list: &mut Vec<Scalar>, value: Scalar) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn map_enrollment(row: &Row<'_>, npi: Npi) -> CanonicalProviderRecord {
    let mut secondary = Vec::new();
    for spec in indexed(row, "sec_spec_", MAX_SECONDARY_SPECIALTIES) {
        push_unique(&mut secondary, spec);
    }
    if let Some(all) = row.get("sec_spec_all") {
        for spec in all.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            push_unique(&mut secondary, Scalar::from(spec));
        }
    }

    CanonicalProviderRecord {
        provider_identification: ProviderIdentification {
            pac_id: field(row, "Ind_PAC_ID"),
            enrollment_id: field(row, "Ind_enrl_ID"),
            ..ProviderIdentification::new(npi)
        },
        provider_personal_info: ProviderPersonalInfo {
            last_name: field(row, "Provider Last Name"),
            first_name: field(row, "Provider First Name"),
            middle_name: field(row, "Provider Middle Name"),
            suffix: field(row, "suff"),
            gender: field(row, "gndr"),
            credentials: field(row, "Cred"),
        },
        provider_professional_info: ProviderProfessionalInfo {
            medical_school: field(row, "Med_sch"),
            graduation_year: field(row, "Grd_yr"),
            primary_specialty: field(row, "pri_spec"),
            secondary_specialties: secondary,
            ..ProviderProfessionalInfo::default()
        },
        current_practice_info: CurrentPracticeInfo {
            facility_name: field(row, "Facility Name"),
            facility_pac_id: field(row, "org_pac_id"),
            organization_members_count: field(row, "num_org_mem"),
            practice_address: PracticeAddress {
                line_1: field(row, "adr_ln_1"),
                line_2: field(row, "adr_ln_2"),
                city: field(row, "City/Town"),
                state: field(row, "State"),
                zip_code: field(row, "ZIP Code"),
                phone: field(row, "Telephone Number"),
                address_id: field(row, "adrs_id"),
            },
        },
        medicare_participation: MedicareParticipation {
            individual_assignment: field(row, "ind_assgn"),
            group_assignment: field(row, "grp_assgn"),
        },
        telehealth_services: TelehealthServices {
            telehealth_eligible: field(row, "Telehlth"),
        },
        ..CanonicalProviderRecord::empty(npi)
    }
}

fn registry_address(row: &Row<'_>, kind: &str) -> Option<Address> {
    let address = Address {
        line_1: field(row, &format!("Provider First Line Business {kind} Address")),
        line_2: field(row, &format!("Provider Second Line Business {kind} Address")),
        city: field(row, &format!("Provider Business {kind} Address City Name")),
        state: field(row, &format!("Provider Business {kind} Address State Name")),
        zip_code: field(row, &format!("Provider Business {kind} Address Postal Code")),
        country: field(
            row,
            &format!("Provider Business {kind} Address Country Code (If outside U.S.)"),
        ),
        phone: field(row, &format!("Provider Business {kind} Address Telephone Number")),
        fax: field(row, &format!("Provider Business {kind} Address Fax Number")),
    };
    address.has_data().then_some(address)
}

fn other_identifiers(row: &Row<'_>) -> Vec<AdditionalIdentifier> {
    let mut out: Vec<AdditionalIdentifier> = Vec::new();
    for i in 1..=MAX_OTHER_IDENTIFIERS {
        let Some(identifier) = row.get(&format!("Other Provider Identifier_{i}")) else {
            continue;
        };
        let entry = AdditionalIdentifier {
            identifier: Some(Scalar::from(identifier)),
            type_code: field(row, &format!("Other Provider Identifier Type Code_{i}")),
            state: field(row, &format!("Other Provider Identifier State_{i}")),
            issuer: field(row, &format!("Other Provider Identifier Issuer_{i}")),
        };
        if !out.contains(&entry) {
            out.push(entry);
        }
    }
    out
}

fn map_registry(row: &Row<'_>, npi: Npi) -> CanonicalProviderRecord {
    let deactivation_date = field(row, "NPI Deactivation Date");

    CanonicalProviderRecord {
        provider_identification: ProviderIdentification {
            entity_type_code: field(row, "Entity Type Code"),
            organization_name: field(row, "Provider Organization Name (Legal Business Name)"),
            ..ProviderIdentification::new(npi)
        },
        provider_personal_info: ProviderPersonalInfo {
            last_name: field(row, "Provider Last Name (Legal Name)"),
            first_name: field(row, "Provider First Name"),
            middle_name: field(row, "Provider Middle Name"),
            suffix: field(row, "Provider Name Suffix Text"),
            gender: field(row, "Provider Sex Code")
                .or_else(|| field(row, "Provider Sex Code (Deprecated)")),
            credentials: field(row, "Provider Credential Text"),
        },
        provider_professional_info: ProviderProfessionalInfo {
            taxonomy_codes: indexed(row, "Healthcare Provider Taxonomy Code_", MAX_TAXONOMY_CODES),
            taxonomy_primary: field(row, "Healthcare Provider Primary Taxonomy Switch_1"),
            ..ProviderProfessionalInfo::default()
        },
        provider_licensing: ProviderLicensing {
            license_number: field(row, "Provider License Number_1"),
            license_state: field(row, "Provider License Number State Code_1"),
        },
        business_addresses: BusinessAddresses {
            mailing_address: registry_address(row, "Mailing"),
            practice_location: registry_address(row, "Practice Location"),
        },
        provider_status: ProviderStatus {
            active: Some(Scalar::Bool(deactivation_date.is_none())),
            deactivation_reason: field(row, "NPI Deactivation Reason Code"),
            deactivation_date,
            reactivation_date: field(row, "NPI Reactivation Date"),
            enumeration_date: field(row, "Provider Enumeration Date"),
            last_update_date: field(row, "Last Update Date"),
            certification_date: field(row, "Certification Date"),
            is_sole_proprietor: field(row, "Is Sole Proprietor"),
            is_organization_subpart: field(row, "Is Organization Subpart"),
        },
        additional_identifiers: other_identifiers(row),
        authorized_official: AuthorizedOfficial {
            last_name: field(row, "Authorized Official Last Name"),
            first_name: field(row, "Authorized Official First Name"),
            middle_name: field(row, "Authorized Official Middle Name"),
            title: field(row, "Authorized Official Title or Position"),
            phone: field(row, "Authorized Official Telephone Number"),
            credentials: field(row, "Authorized Official Credential Text"),
        },
        parent_organization: ParentOrganization {
            legal_business_name: field(row, "Parent Organization LBN"),
            tax_id: field(row, "Parent Organization TIN"),
        },
        ..CanonicalProviderRecord::empty(npi)
    }
}
