//! HTTP control-plane client: roster fetch and traffic reports.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::server::roster::{users_from_records, RosterSource, UserKey, UserRecord};
use crate::server::traffic::{TrafficRecord, TrafficSink};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ATTEMPTS: usize = 3;
const USERS_PATH: &str = "/api/SsGetUsers";
const REPORT_PATH: &str = "/api/SsRepoTice";

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(alias = "Data", default)]
    data: Vec<UserRecord>,
}

#[derive(Serialize)]
struct ReportEntry<'a> {
    #[serde(rename = "UID")]
    uid: &'a str,
    #[serde(rename = "U")]
    up: u64,
    #[serde(rename = "D")]
    down: u64,
}

/// Client for the node's control plane.
///
/// Every request carries `n=<node_id>` and `t=<api_key>` query parameters.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    api_host: String,
    node_id: u32,
    api_key: String,
}

impl ControlPlaneClient {
    /// Create a client for `api_host` (scheme and host, no trailing path).
    pub fn new(api_host: impl Into<String>, node_id: u32, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_host: api_host.into().trim_end_matches('/').to_string(),
            node_id,
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_host, path)
    }

    fn auth(&self) -> [(&'static str, String); 2] {
        [("n", self.node_id.to_string()), ("t", self.api_key.clone())]
    }

    /// Send a request built by `make`, retrying transport failures.
    async fn send<F>(&self, path: &str, make: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;
        for _ in 0..ATTEMPTS {
            match make().send().await {
                Ok(resp) if resp.status().as_u16() >= 400 => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::roster(format!(
                        "{} returned {}: {}",
                        path,
                        status,
                        body.trim()
                    )));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => last_error = Some(e),
            }
        }

        Err(Error::roster(format!(
            "{} failed: {}",
            path,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl RosterSource for ControlPlaneClient {
    async fn fetch(&self) -> Result<Vec<UserKey>> {
        let url = self.url(USERS_PATH);
        let query = self.auth();
        let resp = self
            .send(USERS_PATH, || self.client.get(&url).query(&query))
            .await?;

        let body: UsersResponse = resp
            .json()
            .await
            .map_err(|e| Error::roster(format!("{}: malformed body: {}", USERS_PATH, e)))?;
        Ok(users_from_records(body.data))
    }
}

#[async_trait]
impl TrafficSink for ControlPlaneClient {
    async fn report(&self, batch: &[TrafficRecord]) -> Result<()> {
        let entries: Vec<ReportEntry<'_>> = batch
            .iter()
            .map(|r| ReportEntry {
                uid: &r.user_id,
                up: r.bytes_up,
                down: r.bytes_down,
            })
            .collect();
        let url = self.url(REPORT_PATH);
        let query = self.auth();

        self.send(REPORT_PATH, || {
            self.client.post(&url).query(&query).json(&entries)
        })
        .await?;
        Ok(())
    }
}
