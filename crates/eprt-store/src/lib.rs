//! External I/O clients for EPRT: an HTTP JSON fetcher for the government
//! open-data registry and a Postgres client for the internal permits store.
//!
//! Both are plain constructor-injected values; nothing in here is a
//! process-wide singleton.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "eprt-store";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin GET-and-decode wrapper around `reqwest`. The upstream registry is a
/// read-only open-data endpoint; a failed call degrades to "source found
/// nothing" at the orchestrator, so there is no retry machinery here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.json::<JsonValue>().await?;
        Ok(body)
    }
}

pub fn is_client_error(err: &FetchError) -> bool {
    match err {
        FetchError::HttpStatus { status, .. } => {
            StatusCode::from_u16(*status).map(|s| s.is_client_error()).unwrap_or(false)
        }
        FetchError::Request(_) => false,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Row of the internal `water_permits` table, columns as ingested upstream.
/// Nullable columns stay `Option`; normalization happens in `eprt-sources`.
#[derive(Debug, Clone, Default)]
pub struct WaterPermitRow {
    pub ban: Option<String>,
    pub ems_no: Option<String>,
    pub per_no: Option<String>,
    pub per_sdate: Option<String>,
    pub per_edate: Option<String>,
    pub per_type: Option<String>,
    pub fac_name: Option<String>,
    pub address: Option<String>,
}

/// Row of the internal `air_permits` table.
#[derive(Debug, Clone, Default)]
pub struct AirPermitRow {
    pub ems_no: Option<String>,
    pub permit_no: Option<String>,
    pub category: Option<String>,
    pub expiry_date: Option<String>,
    pub process_name: Option<String>,
}

/// Row of the internal `factories` table. The `*releasedate` columns are the
/// only internal source for air/waste/toxic permit end dates.
#[derive(Debug, Clone, Default)]
pub struct FactoryRow {
    pub uniformno: Option<String>,
    pub company_name: Option<String>,
    pub water_service: Option<String>,
    pub air_service: Option<String>,
    pub waste_service: Option<String>,
    pub toxic_service: Option<String>,
    pub waterreleasedate: Option<String>,
    pub airreleasedate: Option<String>,
    pub wastereleasedate: Option<String>,
    pub toxicreleasedate: Option<String>,
}

/// Read-only client for the internal permits database.
#[derive(Debug, Clone)]
pub struct PermitStore {
    pool: PgPool,
}

impl PermitStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Water permits matching either the literal 8-digit tax id or the same
    /// id with leading zeros stripped.
    pub async fn water_permits_by_tax_id(
        &self,
        tax_id: &str,
        unpadded: &str,
    ) -> Result<Vec<WaterPermitRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ban, ems_no, per_no, per_sdate, per_edate, per_type, fac_name, address
              FROM water_permits
             WHERE ban = $1 OR ban = $2
             ORDER BY per_no
            "#,
        )
        .bind(tax_id)
        .bind(unpadded)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(water_row_from_pg).collect()
    }

    pub async fn water_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> Result<Vec<WaterPermitRow>, StoreError> {
        if facility_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT ban, ems_no, per_no, per_sdate, per_edate, per_type, fac_name, address
              FROM water_permits
             WHERE ems_no = ANY($1)
             ORDER BY per_no
            "#,
        )
        .bind(facility_ids)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(water_row_from_pg).collect()
    }

    pub async fn air_permits_by_facility_ids(
        &self,
        facility_ids: &[String],
    ) -> Result<Vec<AirPermitRow>, StoreError> {
        if facility_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT ems_no, permit_no, category, expiry_date, process_name
              FROM air_permits
             WHERE ems_no = ANY($1)
             ORDER BY permit_no
            "#,
        )
        .bind(facility_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AirPermitRow {
                ems_no: row.try_get("ems_no")?,
                permit_no: row.try_get("permit_no")?,
                category: row.try_get("category")?,
                expiry_date: row.try_get("expiry_date")?,
                process_name: row.try_get("process_name")?,
            });
        }
        Ok(out)
    }

    pub async fn factory_by_tax_id(&self, tax_id: &str) -> Result<Option<FactoryRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT uniformno, company_name,
                   water_service, air_service, waste_service, toxic_service,
                   waterreleasedate, airreleasedate, wastereleasedate, toxicreleasedate
              FROM factories
             WHERE uniformno = $1
             LIMIT 1
            "#,
        )
        .bind(tax_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(FactoryRow {
            uniformno: row.try_get("uniformno")?,
            company_name: row.try_get("company_name")?,
            water_service: row.try_get("water_service")?,
            air_service: row.try_get("air_service")?,
            waste_service: row.try_get("waste_service")?,
            toxic_service: row.try_get("toxic_service")?,
            waterreleasedate: row.try_get("waterreleasedate")?,
            airreleasedate: row.try_get("airreleasedate")?,
            wastereleasedate: row.try_get("wastereleasedate")?,
            toxicreleasedate: row.try_get("toxicreleasedate")?,
        }))
    }
}

fn water_row_from_pg(row: sqlx::postgres::PgRow) -> Result<WaterPermitRow, StoreError> {
    Ok(WaterPermitRow {
        ban: row.try_get("ban")?,
        ems_no: row.try_get("ems_no")?,
        per_no: row.try_get("per_no")?,
        per_sdate: row.try_get("per_sdate")?,
        per_edate: row.try_get("per_edate")?,
        per_type: row.try_get("per_type")?,
        fac_name: row.try_get("fac_name")?,
        address: row.try_get("address")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_http_config_has_sane_timeout() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn http_status_errors_classify_client_side() {
        let not_found = FetchError::HttpStatus {
            status: 404,
            url: "https://data.example.gov/api".to_string(),
        };
        let server = FetchError::HttpStatus {
            status: 503,
            url: "https://data.example.gov/api".to_string(),
        };
        assert!(is_client_error(&not_found));
        assert!(!is_client_error(&server));
    }
}
