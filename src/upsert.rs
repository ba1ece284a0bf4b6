use serde::Serialize;

use crate::error::{StoreError, UpsertError};
use crate::merge::merge;
use crate::record::CanonicalProviderRecord;
use crate::store::ProviderStore;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub action: UpsertAction,
}

/// Inserts new providers and merges into existing ones.
///
/// The read / merge / write cycle is optimistic: a lost race surfaces as
/// [`StoreError::Conflict`] and the whole cycle is repeated against the
/// fresh document, up to `max_attempts` times.
pub struct Upserter<'a, S: ProviderStore + ?Sized> {
    store: &'a S,
    max_attempts: u32,
}

impl<'a, S: ProviderStore + ?Sized> Upserter<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn upsert(&self, candidate: &CanonicalProviderRecord) -> Result<UpsertOutcome, UpsertError> {
        let npi = candidate.npi();
        for attempt in 1..=self.max_attempts {
            match self.try_once(candidate) {
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(%npi, attempt, "write conflict, retrying");
                }
                other => return other.map_err(UpsertError::from),
            }
        }
        Err(UpsertError::RetriesExhausted {
            npi: npi.key(),
            attempts: self.max_attempts,
        })
    }

    fn try_once(&self, candidate: &CanonicalProviderRecord) -> Result<UpsertOutcome, StoreError> {
        let Some(existing) = self.store.find_by_npi(candidate.npi())? else {
            let id = self.store.insert(candidate)?;
            return Ok(UpsertOutcome {
                id,
                action: UpsertAction::Inserted,
            });
        };

        let outcome = merge(&existing.record, candidate);
        if !outcome.changed {
            return Ok(UpsertOutcome {
                id: existing.id,
                action: UpsertAction::Unchanged,
            });
        }

        self.store
            .replace(existing.id, existing.revision, &outcome.record)?;
        Ok(UpsertOutcome {
            id: existing.id,
            action: UpsertAction::Updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::thread;

    use super::*;
    use crate::record::{Npi, Scalar};
    use crate::store::{SqliteStore, StoredProvider};
    use pretty_assertions::assert_eq;

    fn with_last_name(npi: u64, last_name: &str) -> CanonicalProviderRecord {
        let mut r = CanonicalProviderRecord::empty(Npi::from(npi));
        r.provider_personal_info.last_name = Some(Scalar::text(last_name));
        r
    }

    fn with_specialty(npi: u64, specialty: &str) -> CanonicalProviderRecord {
        let mut r = CanonicalProviderRecord::empty(Npi::from(npi));
        r.provider_professional_info.primary_specialty = Some(Scalar::text(specialty));
        r
    }

    /// Lets another writer slip in between our read and our replace a fixed
    /// number of times.
    struct RacingStore {
        inner: SqliteStore,
        races_left: Cell<u32>,
    }

    impl ProviderStore for RacingStore {
        fn find_by_npi(&self, npi: Npi) -> Result<Option<StoredProvider>, StoreError> {
            self.inner.find_by_npi(npi)
        }

        fn insert(&self, record: &CanonicalProviderRecord) -> Result<i64, StoreError> {
            self.inner.insert(record)
        }

        fn replace(
            &self,
            id: i64,
            expected_revision: i64,
            record: &CanonicalProviderRecord,
        ) -> Result<(), StoreError> {
            if self.races_left.get() > 0 {
                self.races_left.set(self.races_left.get() - 1);
                let current = self.inner.find_by_npi(record.npi())?.unwrap();
                let mut theirs = current.record.clone();
                theirs.provider_personal_info.gender = Some(Scalar::text("F"));
                self.inner.replace(id, current.revision, &theirs)?;
            }
            self.inner.replace(id, expected_revision, record)
        }
    }

    #[test]
    fn insert_then_update_then_unchanged() {
        let store = SqliteStore::open_in_memory().unwrap();
        let upserter = Upserter::new(&store);

        let first = upserter.upsert(&with_last_name(1000000001, "SMITH")).unwrap();
        assert_eq!(first.action, UpsertAction::Inserted);

        let second = upserter.upsert(&with_specialty(1000000001, "CARDIOLOGY")).unwrap();
        assert_eq!(second, UpsertOutcome { id: first.id, action: UpsertAction::Updated });

        let third = upserter.upsert(&with_specialty(1000000001, "CARDIOLOGY")).unwrap();
        assert_eq!(third.action, UpsertAction::Unchanged);

        let stored = store.find_by_npi(Npi::from(1000000001)).unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.record.provider_personal_info.last_name, Some(Scalar::text("SMITH")));
    }

    #[test]
    fn conflicting_writer_is_merged_not_overwritten() {
        let racing = RacingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            races_left: Cell::new(2),
        };
        racing.inner.insert(&with_last_name(1000000001, "SMITH")).unwrap();

        let outcome = Upserter::new(&racing)
            .upsert(&with_specialty(1000000001, "CARDIOLOGY"))
            .unwrap();
        assert_eq!(outcome.action, UpsertAction::Updated);

        let stored = racing.inner.find_by_npi(Npi::from(1000000001)).unwrap().unwrap();
        let record = stored.record;
        assert_eq!(record.provider_personal_info.last_name, Some(Scalar::text("SMITH")));
        assert_eq!(record.provider_personal_info.gender, Some(Scalar::text("F")));
        assert_eq!(
            record.provider_professional_info.primary_specialty,
            Some(Scalar::text("CARDIOLOGY"))
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let racing = RacingStore {
            inner: SqliteStore::open_in_memory().unwrap(),
            races_left: Cell::new(u32::MAX),
        };
        racing.inner.insert(&with_last_name(1000000001, "SMITH")).unwrap();

        let err = Upserter::new(&racing)
            .with_max_attempts(3)
            .upsert(&with_specialty(1000000001, "CARDIOLOGY"))
            .unwrap_err();
        assert!(matches!(err, UpsertError::RetriesExhausted { attempts: 3, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn numeric_and_string_identifiers_hit_the_same_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .connection()
            .execute(
                "INSERT INTO providers (npi, document) VALUES ('1000000001', ?1)",
                [r#"{"provider_identification":{"npi":1000000001},
                    "provider_personal_info":{"last_name":"SMITH"}}"#],
            )
            .unwrap();

        let candidate = CanonicalProviderRecord::from_json(serde_json::json!({
            "provider_identification": { "npi": "1000000001" },
            "provider_professional_info": { "primary_specialty": "CARDIOLOGY" }
        }))
        .unwrap();
        let outcome = Upserter::new(&store).upsert(&candidate).unwrap();

        assert_eq!(outcome.action, UpsertAction::Updated);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn concurrent_writers_on_one_database_converge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.sqlite");
        SqliteStore::open(&path).unwrap();

        let npis: Vec<u64> = (1000000001..=1000000040).collect();
        let handles: Vec<_> = [0, 1]
            .into_iter()
            .map(|writer| {
                let path = path.clone();
                let npis = npis.clone();
                thread::spawn(move || {
                    let store = SqliteStore::open(&path).unwrap();
                    let upserter = Upserter::new(&store).with_max_attempts(50);
                    for npi in npis {
                        let record = if writer == 0 {
                            with_last_name(npi, "SMITH")
                        } else {
                            with_specialty(npi, "CARDIOLOGY")
                        };
                        upserter.upsert(&record).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), npis.len() as u64);
        for npi in npis {
            let record = store.find_by_npi(Npi::from(npi)).unwrap().unwrap().record;
            assert_eq!(record.provider_personal_info.last_name, Some(Scalar::text("SMITH")));
            assert_eq!(
                record.provider_professional_info.primary_specialty,
                Some(Scalar::text("CARDIOLOGY"))
            );
        }
    }
}
