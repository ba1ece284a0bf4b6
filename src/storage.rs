use std::path::{Path, PathBuf};

use crate::constants::{CMS_DATASET_ID, DEFAULT_DB_FILE};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub db_path: PathBuf,
}

impl StoragePaths {
    /// `db_path` defaults to a file inside `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, db_path: Option<PathBuf>) -> Self {
        let data_dir: PathBuf = data_dir.into();
        let downloads_dir = data_dir.join("downloads");
        let db_path = db_path.unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE));

        Self {
            data_dir,
            downloads_dir,
            db_path,
        }
    }

    /// Last-seen `modified` stamp of the CMS dataset.
    pub fn cms_marker(&self) -> PathBuf {
        self.data_dir.join(format!("{CMS_DATASET_ID}.meta"))
    }

    pub fn cms_csv(&self) -> PathBuf {
        self.downloads_dir.join(format!("{CMS_DATASET_ID}.csv"))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.downloads_dir)?;
        Ok(())
    }
}

/// A download counts as present only when it is a regular file with content.
pub fn file_present_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() > 0)
}
