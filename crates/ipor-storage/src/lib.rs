//! Postgres access and retrying HTTP fetch utilities.

use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use ipor_core::{Category, FieldChange, FieldValue, IpoRecord};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ipor-storage";

/// Connect a pool sized for a small sync service.
pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(15))
        .connect(database_url)
        .await
}

/// Apply the workspace migrations embedded at compile time.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}

const RECORD_COLUMNS: &str = "id, name, category, details_ipo_id, url_slug, status, subscription, \
     gmp, price_band, offer_start_date, offer_end_date, allotment_date, listing_date, image_url";

#[derive(sqlx::FromRow)]
struct IpoRow {
    id: i64,
    name: String,
    category: String,
    details_ipo_id: Option<i64>,
    url_slug: Option<String>,
    status: Option<String>,
    subscription: Option<String>,
    gmp: Option<String>,
    price_band: Option<String>,
    offer_start_date: Option<NaiveDate>,
    offer_end_date: Option<NaiveDate>,
    allotment_date: Option<NaiveDate>,
    listing_date: Option<NaiveDate>,
    image_url: Option<String>,
}

impl From<IpoRow> for IpoRecord {
    fn from(row: IpoRow) -> Self {
        let category = Category::parse(&row.category).unwrap_or_else(|| {
            warn!(id = row.id, category = %row.category, "unknown category on persisted row");
            Category::Mainboard
        });
        IpoRecord {
            id: row.id,
            name: row.name,
            category,
            details_ipo_id: row.details_ipo_id,
            url_slug: row.url_slug,
            status: row.status,
            subscription: row.subscription,
            gmp: row.gmp,
            price_band: row.price_band,
            offer_start_date: row.offer_start_date,
            offer_end_date: row.offer_end_date,
            allotment_date: row.allotment_date,
            listing_date: row.listing_date,
            image_url: row.image_url,
        }
    }
}

/// Load the whole `ipos` table. Called once per sync batch so matching is a
/// single in-memory lookup per incoming record.
pub async fn load_all_records(pool: &PgPool) -> Result<Vec<IpoRecord>, sqlx::Error> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM ipos");
    let rows: Vec<IpoRow> = sqlx::query_as(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// List records for the read API, newest id first, optionally filtered to a
/// set of categories.
pub async fn list_records(
    pool: &PgPool,
    categories: &[Category],
) -> Result<Vec<IpoRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {RECORD_COLUMNS} FROM ipos"));
    if !categories.is_empty() {
        builder.push(" WHERE category IN (");
        let mut separated = builder.separated(", ");
        for category in categories {
            separated.push_bind(category.as_str());
        }
        separated.push_unseparated(")");
    }
    builder.push(" ORDER BY id DESC");
    let rows: Vec<IpoRow> = builder.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Insert a full row inside the caller's transaction.
pub async fn insert_record_tx(
    tx: &mut Transaction<'_, Postgres>,
    record: &IpoRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ipos \
           (id, name, category, details_ipo_id, url_slug, status, subscription, gmp, price_band, \
            offer_start_date, offer_end_date, allotment_date, listing_date, image_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(record.id)
    .bind(&record.name)
    .bind(record.category.as_str())
    .bind(record.details_ipo_id)
    .bind(&record.url_slug)
    .bind(&record.status)
    .bind(&record.subscription)
    .bind(&record.gmp)
    .bind(&record.price_band)
    .bind(record.offer_start_date)
    .bind(record.offer_end_date)
    .bind(record.allotment_date)
    .bind(record.listing_date)
    .bind(&record.image_url)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Update exactly the columns named in the change set, inside the caller's
/// transaction. A no-op for an empty change set.
pub async fn update_record_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    changes: &[FieldChange],
) -> Result<(), sqlx::Error> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut builder = QueryBuilder::<Postgres>::new("UPDATE ipos SET ");
    let mut separated = builder.separated(", ");
    for change in changes {
        separated.push(format!("{} = ", change.column));
        match &change.new {
            FieldValue::Text(value) => separated.push_bind_unseparated(value.clone()),
            FieldValue::Date(value) => separated.push_bind_unseparated(*value),
            FieldValue::BigInt(value) => separated.push_bind_unseparated(*value),
        };
    }
    builder.push(" WHERE id = ");
    builder.push_bind(id);
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// Insert `ipo_details` rows for offerings whose cross-reference id has no
/// details row yet. Runs in its own transaction; returns the inserted count.
pub async fn backfill_missing_details(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let missing: Vec<(String, i64, Option<String>)> = sqlx::query_as(
        "SELECT i.name, i.details_ipo_id, i.url_slug \
           FROM ipos i \
           LEFT JOIN ipo_details d ON i.details_ipo_id = d.details_ipo_id \
          WHERE i.details_ipo_id IS NOT NULL \
            AND d.details_ipo_id IS NULL",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut inserted = 0u64;
    for (name, details_ipo_id, url_slug) in &missing {
        let result = sqlx::query(
            "INSERT INTO ipo_details (ipo_name, details_ipo_id, url_slug) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (details_ipo_id) DO NOTHING",
        )
        .bind(name)
        .bind(details_ipo_id)
        .bind(url_slug)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    if inserted > 0 {
        info!(inserted, "backfilled missing ipo_details rows");
    }
    Ok(inserted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin GET client with a per-request timeout, retry classification, and
/// capped exponential backoff. The upstream sites expect browser-like
/// headers, so each call site passes its own header pairs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(query);
            }
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, attempt, error = %err, "retrying failed fetch");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }
}
