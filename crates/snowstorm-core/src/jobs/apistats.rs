//! Access-log collector
//!
//! Queries the log-analytics service for front-door access logs and
//! upserts them through the idempotent store. Query attempts are bounded;
//! partial results are retried like failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use snowstorm_common::SnowstormError;

use super::should_log_progress;
use crate::lock::LeaderElection;
use crate::records::AccessLogRecord;
use crate::store::Store;

/// Job name used for the collector's lock entry
pub const JOB_NAME: &str = "apistats";

/// Source seam over the log-analytics query service
#[async_trait]
pub trait AccessLogSource: Send + Sync {
    /// Fetch access-log rows covering the last `days` days
    async fn fetch(&self, days: i64) -> Result<Vec<AccessLogRecord>, SnowstormError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    tables: Vec<QueryTable>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryTable {
    rows: Vec<Vec<Value>>,
}

/// Log-analytics REST client
pub struct LogAnalyticsClient {
    http: reqwest::Client,
    base_url: String,
    workspace_id: String,
    token: String,
    domain: String,
    retries: u32,
}

impl LogAnalyticsClient {
    pub fn new(workspace_id: &str, token: &str, domain: &str, retries: u32) -> Self {
        Self::with_base_url(
            "https://api.loganalytics.io".to_string(),
            workspace_id.to_string(),
            token.to_string(),
            domain.to_string(),
            retries,
        )
    }

    /// Client against an explicit base URL (test servers)
    pub fn with_base_url(
        base_url: String,
        workspace_id: String,
        token: String,
        domain: String,
        retries: u32,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            workspace_id,
            token,
            domain,
            retries,
        }
    }

    /// The access-log query, with numeric path segments and content hashes
    /// collapsed so paths aggregate.
    fn query(&self) -> String {
        format!(
            r#"AzureDiagnostics
| where Category == "FrontDoorAccessLog"
| where requestUri_s startswith "https://{domain}:443/ubiquity"
     or requestUri_s startswith "https://{domain}:443/v2"
| extend path = replace_regex(
    replace_regex(tostring(parse_url(requestUri_s)["Path"]), @"hash-.+", @"{{id}}"), @"/\d+", @"/{{id}}")
| project
    _ItemId,
    TimeGenerated,
    httpMethod_s,
    path,
    httpStatusCode_d,
    timeTaken_s,
    userAgent_s,
    clientIp_s,
    pop_s,
    clientCountry_s"#,
            domain = self.domain
        )
    }

    async fn run_query(&self, days: i64) -> Result<QueryResponse, SnowstormError> {
        let url = format!(
            "{}/v1/workspaces/{}/query",
            self.base_url, self.workspace_id
        );

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "query": self.query(),
                // The collection window plus an hour of overlap
                "timespan": format!("P{days}DT1H"),
            }))
            .send()
            .await
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))?
            .error_for_status()
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))
    }
}

#[async_trait]
impl AccessLogSource for LogAnalyticsClient {
    async fn fetch(&self, days: i64) -> Result<Vec<AccessLogRecord>, SnowstormError> {
        for attempt in 1..=self.retries {
            warn!(attempt, retries = self.retries, "Running query");

            let response = match self.run_query(days).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Query attempt failed");
                    continue;
                }
            };

            // An error alongside tables means partial results; retried
            // like a failure.
            if response.error.is_some() {
                warn!("Partial results, retrying");
                continue;
            }

            let Some(table) = response.tables.into_iter().next() else {
                warn!("Query returned no tables, retrying");
                continue;
            };

            let mut records = Vec::with_capacity(table.rows.len());
            for row in &table.rows {
                match parse_row(row) {
                    Some(record) => records.push(record),
                    None => warn!("Dropping unparseable access-log row"),
                }
            }
            return Ok(records);
        }

        Err(SnowstormError::ExternalApi(
            "log-analytics query retries exhausted".to_string(),
        ))
    }
}

/// Map one projected result row onto an access-log record.
///
/// Column order matches the query projection.
fn parse_row(row: &[Value]) -> Option<AccessLogRecord> {
    if row.len() != 10 {
        return None;
    }

    Some(AccessLogRecord {
        id: row[0].as_str()?.to_string(),
        date_time: row[1]
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())?,
        method: row[2].as_str()?.to_string(),
        path: row[3].as_str()?.to_string(),
        status_code: row[4].as_f64()? as i32,
        response_time: row[5].as_f64()?,
        user_agent: row[6].as_str().unwrap_or_default().to_string(),
        client_ip: row[7].as_str().unwrap_or_default().to_string(),
        pop: row[8].as_str().unwrap_or_default().to_string(),
        client_country: row[9].as_str().unwrap_or_default().to_string(),
    })
}

/// Collects access logs and stores them, gated by leader election
pub struct ApiStatsJob<S> {
    source: S,
    days: i64,
}

impl<S: AccessLogSource> ApiStatsJob<S> {
    pub fn new(source: S, days: i64) -> Self {
        Self { source, days }
    }

    pub async fn run(&self, election: &LeaderElection, store: &Store) -> anyhow::Result<()> {
        if !election.acquire(JOB_NAME).await {
            return Ok(());
        }

        let logs = self.source.fetch(self.days).await?;
        let total = logs.len();
        info!(record_count = total, "Access logs fetched");

        for (iteration, record) in logs.iter().enumerate() {
            let iteration = iteration + 1;
            if should_log_progress(iteration, total) {
                info!(iteration, total, "Inserting access-log record");
            }
            if let Err(e) = store.upsert_access_log(record).await {
                warn!(log_id = %record.id, error = %e, "Failed to store access log");
            }
        }

        Ok(())
    }
}
