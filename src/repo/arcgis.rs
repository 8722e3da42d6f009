//! Upstream feature-service client.
//!
//! Authenticated access to the portal feature service: token generation,
//! filtered feature queries, and paginated bulk fetching with a bounded
//! worker pool. Page fetches retry a small number of times before their
//! failure counts against the whole bulk fetch.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};

use crate::config::Config;
use crate::error::{LrsError, Result};

/// Deadline for feature queries.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for token acquisition.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Rows per page for bulk fetches.
pub const PAGE_SIZE: u64 = 250;
/// Concurrent page fetchers.
pub const FETCH_WORKERS: usize = 4;
const MAX_PAGE_RETRIES: u32 = 3;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[allow(dead_code)]
    expires: Option<i64>,
    error: Option<UpstreamError>,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Client for the upstream feature service.
#[derive(Clone)]
pub struct FeatureServiceClient {
    http: Client,
    token_url: String,
    feature_url: String,
    username: String,
    password: String,
    referer: String,
}

impl FeatureServiceClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| LrsError::upstream(format!("failed to build http client: {}", e), None))?;

        Ok(FeatureServiceClient {
            http,
            token_url: config.token_url.clone(),
            feature_url: config.feature_url.clone(),
            username: config.arcgis_user.clone(),
            password: config.arcgis_password.clone(),
            referer: config.referer.clone(),
        })
    }

    /// Acquire a portal token.
    pub async fn generate_token(&self) -> Result<String> {
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("f", "json"),
            ("expiration", "60"),
            ("client", "referer"),
            ("referer", self.referer.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .timeout(TOKEN_TIMEOUT)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LrsError::upstream(
                "token request failed",
                Some(response.status().as_u16()),
            ));
        }

        let body: TokenResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(LrsError::upstream(
                format!("portal error: {} (code {})", err.message, err.code),
                None,
            ));
        }
        body.token
            .ok_or_else(|| LrsError::upstream("token response carried no token", None))
    }

    fn where_clause(route_ids: &[String]) -> String {
        match route_ids {
            [] => "1=1".to_string(),
            [only] => format!("RouteId='{}'", only),
            many => {
                let quoted: Vec<String> = many.iter().map(|id| format!("'{}'", id)).collect();
                format!("RouteId IN ({})", quoted.join(","))
            }
        }
    }

    /// Fetch raw feature JSON for the given route ids.
    pub async fn fetch_features(&self, token: &str, route_ids: &[String]) -> Result<Bytes> {
        let where_clause = Self::where_clause(route_ids);
        self.query_features(token, &where_clause, None).await
    }

    /// Total feature count behind the service.
    pub async fn fetch_count(&self, token: &str) -> Result<u64> {
        let response = self
            .http
            .get(&self.feature_url)
            .timeout(FETCH_TIMEOUT)
            .query(&[
                ("where", "1=1"),
                ("f", "json"),
                ("token", token),
                ("returnCountOnly", "true"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LrsError::upstream(
                "count request failed",
                Some(response.status().as_u16()),
            ));
        }

        let body: CountResponse = response.json().await?;
        Ok(body.count)
    }

    async fn query_features(
        &self,
        token: &str,
        where_clause: &str,
        page: Option<(u64, u64)>,
    ) -> Result<Bytes> {
        let mut params = vec![
            ("where", where_clause.to_string()),
            ("outfields", "LINKID,LINK_NAME,SK_LENGTH".to_string()),
            ("f", "json".to_string()),
            ("token", token.to_string()),
            ("returnGeometry", "true".to_string()),
            ("returnM", "true".to_string()),
            ("returnZ", "true".to_string()),
        ];
        if let Some((offset, count)) = page {
            params.push(("resultOffset", offset.to_string()));
            params.push(("resultRecordCount", count.to_string()));
        }

        let response = self
            .http
            .get(&self.feature_url)
            .timeout(FETCH_TIMEOUT)
            .query(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LrsError::upstream(
                "feature request failed",
                Some(response.status().as_u16()),
            ));
        }

        Ok(response.bytes().await?)
    }

    /// Fetch one page, retrying transient failures with a short backoff.
    async fn fetch_page(&self, token: &str, offset: u64) -> Result<Bytes> {
        let mut attempt = 0;
        loop {
            match self
                .query_features(token, "1=1", Some((offset, PAGE_SIZE)))
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    attempt += 1;
                    if attempt > MAX_PAGE_RETRIES {
                        return Err(err);
                    }
                    warn!(
                        "[FeatureService] page at offset {} failed (attempt {}): {}",
                        offset, attempt, err
                    );
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
            }
        }
    }

    /// Fetch every page of the service with a bounded worker pool.
    ///
    /// Pages are fetched concurrently and delivered unordered through a
    /// bounded channel; worker errors are aggregated into one composite
    /// failure after all pages complete.
    pub async fn fetch_all(&self, token: &str) -> Result<Vec<Bytes>> {
        let total = self.fetch_count(token).await?;
        if total == 0 {
            return Ok(Vec::new());
        }

        let page_count = total.div_ceil(PAGE_SIZE);
        info!(
            "[FeatureService] fetching {} features in {} pages with {} workers",
            total, page_count, FETCH_WORKERS
        );

        let semaphore = Arc::new(Semaphore::new(FETCH_WORKERS));
        let (tx, mut rx) = mpsc::channel::<(u64, Result<Bytes>)>(FETCH_WORKERS);

        for page in 0..page_count {
            let offset = page * PAGE_SIZE;
            let client = self.clone();
            let token = token.to_string();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok();
                let result = client.fetch_page(&token, offset).await;
                let _ = tx.send((offset, result)).await;
            });
        }
        drop(tx);

        let mut pages = Vec::with_capacity(page_count as usize);
        let mut failures = Vec::new();
        while let Some((offset, result)) = rx.recv().await {
            match result {
                Ok(bytes) => pages.push(bytes),
                Err(err) => failures.push(format!("offset {}: {}", offset, err)),
            }
        }

        if !failures.is_empty() {
            return Err(LrsError::upstream(
                format!(
                    "{} of {} pages failed: {}",
                    failures.len(),
                    page_count,
                    failures.join("; ")
                ),
                None,
            ));
        }

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause() {
        assert_eq!(FeatureServiceClient::where_clause(&[]), "1=1");
        assert_eq!(
            FeatureServiceClient::where_clause(&["01001".to_string()]),
            "RouteId='01001'"
        );
        assert_eq!(
            FeatureServiceClient::where_clause(&["01001".to_string(), "01002".to_string()]),
            "RouteId IN ('01001','01002')"
        );
    }

    #[test]
    fn test_token_error_decoding() {
        let body = r#"{"error": {"code": 400, "message": "Invalid credentials"}}"#;
        let parsed: TokenResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.token.is_none());
        let err = parsed.error.unwrap();
        assert_eq!(err.code, 400);
        assert!(err.message.contains("Invalid"));
    }
}
