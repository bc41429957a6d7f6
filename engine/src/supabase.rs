//! Relational-side store adapter, speaking the Supabase REST interface
//! with a service key. Rows travel as loose JSON objects; the typed shape
//! lives in the per-entity declarations, not here.

use crate::error::{SyncError, SyncResult};
use crate::payload::Record;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

const PAGE_SIZE: usize = 1000;

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn fetch_table(&self, table: &str) -> SyncResult<Vec<Record>>;
    async fn insert(&self, table: &str, payload: &Record) -> SyncResult<Record>;
    async fn update(&self, table: &str, id: &str, payload: &Record) -> SyncResult<Record>;
    async fn delete(&self, table: &str, id: &str) -> SyncResult<()>;
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_key: String
}

impl SupabaseClient {
    pub fn new(base_url: String, service_key: String) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(SyncError::Http)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response
    ) -> SyncResult<T> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(SyncError::RateLimited {
                retry_after_seconds: retry_after
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::SupabaseApi {
                status: status.as_u16(),
                message: body
            });
        }
        Ok(response.json::<T>().await?)
    }

    fn single_row(table: &str, id: &str, rows: Vec<Record>) -> SyncResult<Record> {
        rows.into_iter().next().ok_or_else(|| SyncError::SupabaseApi {
            status: 404,
            message: format!("{table} write returned no row for id {id}")
        })
    }
}

#[async_trait]
impl RelationalStore for SupabaseClient {
    async fn fetch_table(&self, table: &str) -> SyncResult<Vec<Record>> {
        let mut rows: Vec<Record> = Vec::new();
        let mut offset = 0usize;
        loop {
            let response = self
                .request(self.client.get(self.table_url(table)))
                .query(&[
                    ("select", "*".to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                    ("offset", offset.to_string())
                ])
                .send()
                .await?;
            let page: Vec<Record> = Self::parse_response(response).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, payload: &Record) -> SyncResult<Record> {
        let response = self
            .request(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(payload)
            .send()
            .await?;
        let rows: Vec<Record> = Self::parse_response(response).await?;
        Self::single_row(table, "(new)", rows)
    }

    async fn update(&self, table: &str, id: &str, payload: &Record) -> SyncResult<Record> {
        let response = self
            .request(self.client.patch(self.table_url(table)))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(payload)
            .send()
            .await?;
        let rows: Vec<Record> = Self::parse_response(response).await?;
        Self::single_row(table, id, rows)
    }

    async fn delete(&self, table: &str, id: &str) -> SyncResult<()> {
        let response = self
            .request(self.client.delete(self.table_url(table)))
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::SupabaseApi {
                status: status.as_u16(),
                message: body
            });
        }
        Ok(())
    }
}
