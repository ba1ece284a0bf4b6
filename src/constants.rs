pub const NPPES_LISTING_URL: &str = "https://download.cms.gov/nppes/NPI_Files.html";
pub const NPPES_BASE_URL: &str = "https://download.cms.gov/nppes/";
/// Entry-name prefix of the main data CSV inside an NPPES archive.
pub const NPPES_ENTRY_PREFIX: &str = "npidata";

/// Doctors & Clinicians national downloadable file.
pub const CMS_DATASET_ID: &str = "mj5m-pzi6";
pub const CMS_META_URL: &str =
    "https://data.cms.gov/provider-data/api/1/metastore/schemas/dataset/items/mj5m-pzi6";
pub const CMS_CSV_URL: &str =
    "https://data.cms.gov/provider-data/api/1/datastore_export/csv?dataset=mj5m-pzi6";

pub const DEFAULT_DB_FILE: &str = "providers.sqlite";
