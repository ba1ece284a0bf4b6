use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;
use crate::error::QueryError;
use crate::query::{FilterCriteria, PageRequest, ProviderQueries, SortDirection, SortField};
use crate::record::Npi;
use crate::storage::StoragePaths;
use crate::store::SqliteStore;

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<SqliteStore>>,
}

pub async fn run(opts: ServeArgs, paths: &StoragePaths) -> anyhow::Result<()> {
    let store = SqliteStore::open(&paths.db_path)
        .with_context(|| format!("open provider store at {}", paths.db_path.display()))?;
    let providers = store.count().context("count providers")?;
    tracing::info!("Serving {} providers from {}", providers, paths.db_path.display());

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(store)).await?;
    Ok(())
}

pub fn router(store: SqliteStore) -> Router {
    let state = AppState {
        store: Arc::new(Mutex::new(store)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/providers", get(api_list))
        .route("/api/providers/search", get(api_search))
        .route("/api/providers/filter", get(api_filter))
        .route("/api/providers/count", get(api_count))
        .route("/api/providers/summary", get(api_summary))
        .route("/api/providers/:npi", get(api_provider_detail))
        .layer(cors)
        .with_state(state)
}

fn query_error(e: QueryError) -> Response {
    if e.is_client_error() {
        (StatusCode::BAD_REQUEST, e.to_string()).into_response()
    } else {
        tracing::error!("query failed: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    providers: u64,
}

async fn health(State(st): State<AppState>) -> Response {
    let store = st.store.lock().await;
    match store.count() {
        Ok(providers) => Json(HealthResponse {
            status: "ok",
            providers,
        })
        .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Query string shared by the provider routes; each route reads the parts
/// it needs.
#[derive(Debug, Default, Deserialize)]
struct ProviderParams {
    q: Option<String>,
    state: Option<String>,
    city: Option<String>,
    specialty: Option<String>,
    organization_name: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
    sort: Option<String>,
    order: Option<String>,
}

impl ProviderParams {
    fn page_request(&self) -> Result<PageRequest, QueryError> {
        let defaults = PageRequest::default();
        Ok(PageRequest {
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            sort: self
                .sort
                .as_deref()
                .map(SortField::parse)
                .transpose()?
                .unwrap_or_default(),
            direction: self
                .order
                .as_deref()
                .map(SortDirection::parse)
                .unwrap_or_default(),
        })
    }

    fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            state: self.state.clone(),
            city: self.city.clone(),
            specialty: self.specialty.clone(),
            organization_name: self.organization_name.clone(),
        }
    }
}

async fn api_list(State(st): State<AppState>, Query(p): Query<ProviderParams>) -> Response {
    let req = match p.page_request() {
        Ok(req) => req,
        Err(e) => return query_error(e),
    };
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).list(&req) {
        Ok(page) => Json(page).into_response(),
        Err(e) => query_error(e),
    }
}

async fn api_search(State(st): State<AppState>, Query(p): Query<ProviderParams>) -> Response {
    let req = match p.page_request() {
        Ok(req) => req,
        Err(e) => return query_error(e),
    };
    let term = p.q.as_deref().unwrap_or_default();
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).search(term, &req) {
        Ok(page) => Json(page).into_response(),
        Err(e) => query_error(e),
    }
}

async fn api_filter(State(st): State<AppState>, Query(p): Query<ProviderParams>) -> Response {
    let req = match p.page_request() {
        Ok(req) => req,
        Err(e) => return query_error(e),
    };
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).filter(&p.criteria(), &req) {
        Ok(page) => Json(page).into_response(),
        Err(e) => query_error(e),
    }
}

#[derive(Debug, Serialize)]
struct CountResponse {
    count: u64,
}

async fn api_count(State(st): State<AppState>, Query(p): Query<ProviderParams>) -> Response {
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).count(&p.criteria()) {
        Ok(count) => Json(CountResponse { count }).into_response(),
        Err(e) => query_error(e),
    }
}

async fn api_summary(State(st): State<AppState>, Query(p): Query<ProviderParams>) -> Response {
    let req = match p.page_request() {
        Ok(req) => req,
        Err(e) => return query_error(e),
    };
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).list_summary(&p.criteria(), &req) {
        Ok(page) => Json(page).into_response(),
        Err(e) => query_error(e),
    }
}

async fn api_provider_detail(
    State(st): State<AppState>,
    AxumPath(npi): AxumPath<String>,
) -> Response {
    let Some(npi) = Npi::parse(&npi) else {
        return (StatusCode::BAD_REQUEST, format!("invalid NPI {npi:?}")).into_response();
    };
    let store = st.store.lock().await;
    match ProviderQueries::new(store.connection()).get_by_npi(npi) {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("no provider with NPI {npi}")).into_response(),
        Err(e) => query_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CanonicalProviderRecord, Scalar};
    use crate::store::ProviderStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let store = SqliteStore::open_in_memory().unwrap();
        for (npi, last, state) in [
            (1000000001u64, "SMITH", "TX"),
            (1000000002, "SMITHERS", "CA"),
            (1000000003, "DOE", "TX"),
        ] {
            let mut r = CanonicalProviderRecord::empty(Npi::from(npi));
            r.provider_personal_info.last_name = Some(Scalar::text(last));
            r.current_practice_info.practice_address.state = Some(Scalar::text(state));
            store.insert(&r).unwrap();
        }
        router(store)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_provider_count() {
        let (status, body) = get(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["providers"], 3);
    }

    #[tokio::test]
    async fn list_is_paginated() {
        let (status, body) = get(app(), "/api/providers?page=2&page_size=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["pagination"]["total_items"], 3);
        assert_eq!(body["pagination"]["has_previous"], true);
        assert_eq!(body["pagination"]["has_next"], false);
        assert_eq!(
            body["data"][0]["provider_identification"]["npi"],
            1000000003u64
        );
    }

    #[tokio::test]
    async fn search_and_filter_routes() {
        let (_, body) = get(app(), "/api/providers/search?q=smith&sort=last_name&order=desc").await;
        let names: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["provider_personal_info"]["last_name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["SMITHERS", "SMITH"]);

        let (_, body) = get(app(), "/api/providers/filter?state=tx").await;
        assert_eq!(body["pagination"]["total_items"], 2);

        let (_, body) = get(app(), "/api/providers/count?state=ca").await;
        assert_eq!(body["count"], 1);

        let (_, body) = get(app(), "/api/providers/summary?state=ca").await;
        assert_eq!(body["data"][0]["last_name"], "SMITHERS");
        assert_eq!(body["data"][0]["npi"], "1000000002");
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let (status, _) = get(app(), "/api/providers/search?q=(").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app(), "/api/providers?sort=document").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app(), "/api/providers/not-a-number").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detail_by_npi() {
        let (status, body) = get(app(), "/api/providers/1000000001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider_personal_info"]["last_name"], "SMITH");
        assert_eq!(body["id"], 1);

        let (status, _) = get(app(), "/api/providers/1999999999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
