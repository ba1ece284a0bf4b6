//! Read-side queries over the provider table.
//!
//! Documents are stored as JSON text, so every filter and sort key is a
//! `json_extract` expression. Free-text search goes through a `REGEXP`
//! function registered on each connection.

use std::sync::Arc;

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;

use crate::error::QueryError;
use crate::record::{CanonicalProviderRecord, Npi};
use crate::store::decode_document;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1000;

const ORGANIZATION_NAME: &str = "json_extract(document, '$.provider_identification.organization_name')";
const FACILITY_NAME: &str = "json_extract(document, '$.current_practice_info.facility_name')";
const FIRST_NAME: &str = "json_extract(document, '$.provider_personal_info.first_name')";
const MIDDLE_NAME: &str = "json_extract(document, '$.provider_personal_info.middle_name')";
const LAST_NAME: &str = "json_extract(document, '$.provider_personal_info.last_name')";
const PRIMARY_SPECIALTY: &str = "json_extract(document, '$.provider_professional_info.primary_specialty')";
const CITY: &str = "coalesce(\
    json_extract(document, '$.business_addresses.practice_location.city'), \
    json_extract(document, '$.current_practice_info.practice_address.city'), \
    json_extract(document, '$.business_addresses.mailing_address.city'))";
const STATE: &str = "coalesce(\
    json_extract(document, '$.business_addresses.practice_location.state'), \
    json_extract(document, '$.current_practice_info.practice_address.state'), \
    json_extract(document, '$.business_addresses.mailing_address.state'))";

const ADDRESS_PATHS: [&str; 3] = [
    "$.business_addresses.practice_location",
    "$.current_practice_info.practice_address",
    "$.business_addresses.mailing_address",
];

/// Register `REGEXP` (case handling is up to the pattern) on `conn`.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(
                0,
                |pattern| -> Result<_, Box<dyn std::error::Error + Send + Sync>> {
                    Ok(Regex::new(pattern.as_str()?)?)
                },
            )?;
            let text = ctx
                .get_raw(1)
                .as_str_or_null()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            Ok(text.is_some_and(|t| re.is_match(t)))
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Id,
    Npi,
    LastName,
    FirstName,
    OrganizationName,
    State,
    City,
}

impl SortField {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "id" | "_id" => Ok(SortField::Id),
            "npi" => Ok(SortField::Npi),
            "last_name" => Ok(SortField::LastName),
            "first_name" => Ok(SortField::FirstName),
            "organization_name" => Ok(SortField::OrganizationName),
            "state" => Ok(SortField::State),
            "city" => Ok(SortField::City),
            _ => Err(QueryError::UnknownSortField(raw.to_string())),
        }
    }

    fn expr(self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::Npi => "npi",
            SortField::LastName => LAST_NAME,
            SortField::FirstName => FIRST_NAME,
            SortField::OrganizationName => ORGANIZATION_NAME,
            SortField::State => STATE,
            SortField::City => CITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Accepts `asc`/`desc` as well as `1`/`-1`; anything else is ascending.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "desc" | "-1" => SortDirection::Desc,
            _ => SortDirection::Asc,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort: SortField,
    pub direction: SortDirection,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            direction: SortDirection::default(),
        }
    }
}

impl PageRequest {
    /// Page clamped to >= 1; size 0 means the default, capped at the max.
    fn normalized(&self) -> (u32, u32) {
        let page = self.page.max(1);
        let page_size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        (page, page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub current_page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl Pagination {
    fn new(page: u32, page_size: u32, total_items: u64) -> Self {
        let total_pages = total_items.div_ceil(u64::from(page_size));
        Self {
            current_page: page,
            page_size,
            total_items,
            total_pages,
            has_next: u64::from(page) < total_pages,
            has_previous: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Full document plus its row id.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: CanonicalProviderRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSummary {
    pub id: i64,
    pub npi: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub primary_specialty: Option<String>,
}

/// Field filters; all given fields must match. Comparisons ignore case.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    /// Matches any address on the record.
    pub state: Option<String>,
    pub city: Option<String>,
    /// Primary or any secondary specialty.
    pub specialty: Option<String>,
    /// Substring of the organization or facility name.
    pub organization_name: Option<String>,
}

#[derive(Debug, Default)]
struct Where {
    clauses: Vec<String>,
    params: Vec<String>,
}

impl Where {
    fn from_criteria(criteria: &FilterCriteria) -> Self {
        let mut w = Where::default();
        let given = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if let Some(state) = given(&criteria.state) {
            w.any_address("state", state);
        }
        if let Some(city) = given(&criteria.city) {
            w.any_address("city", city);
        }
        if let Some(specialty) = given(&criteria.specialty) {
            w.clauses.push(format!(
                "(upper({PRIMARY_SPECIALTY}) = upper(?) OR EXISTS (\
                 SELECT 1 FROM json_each(document, '$.provider_professional_info.secondary_specialties') \
                 WHERE upper(value) = upper(?)))"
            ));
            w.params.push(specialty.clone());
            w.params.push(specialty);
        }
        if let Some(org) = given(&criteria.organization_name) {
            w.clauses.push(format!(
                "(instr(upper(coalesce({ORGANIZATION_NAME}, '')), upper(?)) > 0 \
                 OR instr(upper(coalesce({FACILITY_NAME}, '')), upper(?)) > 0)"
            ));
            w.params.push(org.clone());
            w.params.push(org);
        }
        w
    }

    fn any_address(&mut self, field: &str, value: String) {
        let tests: Vec<String> = ADDRESS_PATHS
            .iter()
            .map(|path| format!("upper(json_extract(document, '{path}.{field}')) = upper(?)"))
            .collect();
        self.clauses.push(format!("({})", tests.join(" OR ")));
        for _ in ADDRESS_PATHS {
            self.params.push(value.clone());
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn text_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    })
}

pub struct ProviderQueries<'a> {
    conn: &'a Connection,
}

impl<'a> ProviderQueries<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get_by_npi(&self, npi: Npi) -> Result<Option<ProviderEntry>, QueryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, document FROM providers WHERE npi = ?1")?;
        let mut rows = stmt.query([npi.key()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let id: i64 = row.get(0)?;
        let document: String = row.get(1)?;
        Ok(Some(ProviderEntry {
            id,
            record: decode_document(id, &document)?,
        }))
    }

    pub fn list(&self, req: &PageRequest) -> Result<Page<ProviderEntry>, QueryError> {
        self.documents(&Where::default(), req)
    }

    /// Case-insensitive regex over organization and personal names. A blank
    /// term lists everything.
    pub fn search(&self, term: &str, req: &PageRequest) -> Result<Page<ProviderEntry>, QueryError> {
        let term = term.trim();
        if term.is_empty() {
            return self.list(req);
        }
        let pattern = format!("(?i){term}");
        Regex::new(&pattern).map_err(|source| QueryError::InvalidPattern {
            pattern: term.to_string(),
            source,
        })?;

        let fields = [ORGANIZATION_NAME, FIRST_NAME, MIDDLE_NAME, LAST_NAME];
        let tests: Vec<String> = fields
            .iter()
            .map(|f| format!("regexp(?, {f})"))
            .collect();
        let filter = Where {
            clauses: vec![format!("({})", tests.join(" OR "))],
            params: vec![pattern; fields.len()],
        };
        self.documents(&filter, req)
    }

    pub fn filter(
        &self,
        criteria: &FilterCriteria,
        req: &PageRequest,
    ) -> Result<Page<ProviderEntry>, QueryError> {
        self.documents(&Where::from_criteria(criteria), req)
    }

    pub fn count(&self, criteria: &FilterCriteria) -> Result<u64, QueryError> {
        self.count_where(&Where::from_criteria(criteria))
    }

    pub fn list_summary(
        &self,
        criteria: &FilterCriteria,
        req: &PageRequest,
    ) -> Result<Page<ProviderSummary>, QueryError> {
        let columns = format!(
            "id, npi, {FIRST_NAME}, {LAST_NAME}, {ORGANIZATION_NAME}, {CITY}, {STATE}, {PRIMARY_SPECIALTY}"
        );
        self.page(&Where::from_criteria(criteria), req, &columns, |row| {
            Ok(ProviderSummary {
                id: row.get(0)?,
                npi: row.get(1)?,
                first_name: text_at(row, 2)?,
                last_name: text_at(row, 3)?,
                organization_name: text_at(row, 4)?,
                city: text_at(row, 5)?,
                state: text_at(row, 6)?,
                primary_specialty: text_at(row, 7)?,
            })
        })
    }

    fn documents(&self, filter: &Where, req: &PageRequest) -> Result<Page<ProviderEntry>, QueryError> {
        let raw = self.page(filter, req, "id, document", |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let data = raw
            .data
            .into_iter()
            .map(|(id, document)| -> Result<ProviderEntry, QueryError> {
                Ok(ProviderEntry {
                    id,
                    record: decode_document(id, &document)?,
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;
        Ok(Page {
            data,
            pagination: raw.pagination,
        })
    }

    fn page<T, F>(
        &self,
        filter: &Where,
        req: &PageRequest,
        columns: &str,
        map: F,
    ) -> Result<Page<T>, QueryError>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let (page, page_size) = req.normalized();
        let total_items = self.count_where(filter)?;
        let offset = u64::from(page - 1) * u64::from(page_size);

        let sql = format!(
            "SELECT {columns} FROM providers {} ORDER BY {} {}, id ASC LIMIT {page_size} OFFSET {offset}",
            filter.sql(),
            req.sort.expr(),
            req.direction.sql(),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let data = stmt
            .query_map(params_from_iter(filter.params.iter()), map)?
            .collect::<rusqlite::Result<Vec<T>>>()?;

        Ok(Page {
            data,
            pagination: Pagination::new(page, page_size, total_items),
        })
    }

    fn count_where(&self, filter: &Where) -> Result<u64, QueryError> {
        let sql = format!("SELECT COUNT(*) FROM providers {}", filter.sql());
        let n: i64 = self
            .conn
            .query_row(&sql, params_from_iter(filter.params.iter()), |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}
