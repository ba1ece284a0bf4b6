use std::collections::HashSet;
use std::fmt;

/// Which upstream dataset a tabular source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// CMS payer-enrollment extract (Doctors & Clinicians national file).
    Enrollment,
    /// NPPES national provider registry dissemination file.
    Registry,
    Unknown,
}

const ENROLLMENT_KEY_COLUMNS: &[&str] = &["NPI", "Ind_PAC_ID"];
const REGISTRY_KEY_COLUMNS: &[&str] = &["NPI", "Entity Type Code"];

/// Classify a source by its column names. Enrollment is checked first.
pub fn classify<S: AsRef<str>>(columns: &[S]) -> SourceKind {
    let present: HashSet<&str> = columns.iter().map(|c| c.as_ref().trim()).collect();
    let has_all = |keys: &[&str]| keys.iter().all(|k| present.contains(k));

    if has_all(ENROLLMENT_KEY_COLUMNS) {
        SourceKind::Enrollment
    } else if has_all(REGISTRY_KEY_COLUMNS) {
        SourceKind::Registry
    } else {
        SourceKind::Unknown
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Enrollment => "enrollment",
            SourceKind::Registry => "registry",
            SourceKind::Unknown => "unknown",
        })
    }
}
