//! Ticket collector
//!
//! Pages ticket snapshots out of the FreshService API and upserts them
//! through the idempotent store. Rate-limit responses sleep and retry the
//! same page; a bad ticket is skipped, never the batch.

use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, warn};

use snowstorm_common::SnowstormError;

use super::should_log_progress;
use crate::lock::LeaderElection;
use crate::records::{TicketRecord, TicketStatus};
use crate::store::Store;

/// Job name used for the collector's lock entry
pub const JOB_NAME: &str = "freshservice";

/// Tickets fetched per page, the API maximum
const PAGE_SIZE: u32 = 100;

/// One page of the paged ticket listing
enum Page {
    Tickets(Vec<ApiTicket>),
    RateLimited,
}

#[derive(Debug, Deserialize)]
struct TicketsResponse {
    tickets: Vec<ApiTicket>,
}

/// Ticket as the API returns it
#[derive(Debug, Deserialize)]
struct ApiTicket {
    id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: i64,
    custom_fields: CustomFields,
}

#[derive(Debug, Deserialize)]
struct CustomFields {
    channel: Option<String>,
    service: Option<String>,
    mi: Option<String>,
    incident_sla_resolution: Option<String>,
}

/// Thin client over the FreshService ticket listing
pub struct FreshServiceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FreshServiceClient {
    pub fn new(domain: &str, api_key: &str) -> Self {
        Self::with_base_url(format!("https://{domain}"), api_key.to_string())
    }

    /// Client against an explicit base URL (test servers)
    pub fn with_base_url(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    async fn fetch_page(
        &self,
        page: u32,
        updated_since: DateTime<Utc>,
    ) -> Result<Page, SnowstormError> {
        let response = self
            .http
            .get(format!("{}/api/v2/tickets", self.base_url))
            .query(&[
                ("page", page.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("updated_since", updated_since.to_rfc3339()),
            ])
            .basic_auth(&self.api_key, Some("X"))
            .send()
            .await
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Ok(Page::RateLimited);
        }

        let response = response
            .error_for_status()
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))?;

        let body: TicketsResponse = response
            .json()
            .await
            .map_err(|e| SnowstormError::ExternalApi(e.to_string()))?;

        Ok(Page::Tickets(body.tickets))
    }
}

/// Collects recently updated tickets and stores their snapshots
pub struct FreshServiceJob {
    client: FreshServiceClient,
    days: i64,
    rate_limit_timeout: std::time::Duration,
}

impl FreshServiceJob {
    pub fn new(client: FreshServiceClient, days: i64, rate_limit_timeout: std::time::Duration) -> Self {
        Self {
            client,
            days,
            rate_limit_timeout,
        }
    }

    /// Fetch all pages of tickets updated within the collection window.
    ///
    /// HTTP 429 sleeps the configured timeout and retries the same page.
    /// Tickets that fail to map are logged and skipped.
    pub async fn collect(&self) -> Result<Vec<TicketRecord>, SnowstormError> {
        let updated_since = Utc::now() - Duration::days(self.days) - Duration::hours(1);

        let mut tickets = Vec::new();
        let mut page = 1u32;

        loop {
            info!(page, "Processing page");
            match self.client.fetch_page(page, updated_since).await? {
                Page::RateLimited => {
                    warn!(
                        timeout_secs = self.rate_limit_timeout.as_secs(),
                        "Rate limit hit, sleeping"
                    );
                    sleep(self.rate_limit_timeout).await;
                }
                Page::Tickets(batch) if batch.is_empty() => {
                    info!(ticket_count = tickets.len(), "No pages remaining");
                    break;
                }
                Page::Tickets(batch) => {
                    for ticket in batch {
                        match map_ticket(ticket) {
                            Some(record) => tickets.push(record),
                            None => warn!("Ticket has an unknown status code, skipping"),
                        }
                    }
                    page += 1;
                }
            }
        }

        Ok(tickets)
    }

    /// Collect and persist, gated by leader election.
    pub async fn run(&self, election: &LeaderElection, store: &Store) -> anyhow::Result<()> {
        if !election.acquire(JOB_NAME).await {
            return Ok(());
        }

        let tickets = self.collect().await?;
        let total = tickets.len();

        for (iteration, ticket) in tickets.iter().enumerate() {
            let iteration = iteration + 1;
            if should_log_progress(iteration, total) {
                info!(iteration, total, "Inserting ticket record");
            }
            if let Err(e) = store.upsert_ticket(ticket).await {
                warn!(ticket_id = ticket.id, error = %e, "Failed to store ticket");
            }
        }

        Ok(())
    }
}

/// Map an API ticket onto the stored snapshot shape.
///
/// Returns None for status codes outside the known lifecycle.
fn map_ticket(ticket: ApiTicket) -> Option<TicketRecord> {
    let status = TicketStatus::from_api_code(ticket.status)?;

    let channel = ticket
        .custom_fields
        .channel
        .filter(|channel| channel != "N/A");

    let sla_breached = match ticket.custom_fields.incident_sla_resolution.as_deref() {
        Some("Breached") => Some(true),
        Some("Achieved") => Some(false),
        _ => None,
    };

    Some(TicketRecord {
        id: ticket.id,
        created_at: ticket.created_at,
        updated_at: ticket.updated_at,
        status,
        channel,
        service: ticket.custom_fields.service,
        mi: ticket.custom_fields.mi,
        sla_breached,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_ticket(id: i64, status: i64, channel: &str, sla: &str) -> serde_json::Value {
        json!({
            "id": id,
            "created_at": "2026-07-01T08:00:00Z",
            "updated_at": "2026-07-20T10:30:00Z",
            "status": status,
            "custom_fields": {
                "channel": channel,
                "service": "api",
                "mi": "mi-1",
                "incident_sla_resolution": sla,
            }
        })
    }

    #[tokio::test]
    async fn test_collect_pages_until_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [
                    api_ticket(1, 2, "bink", "Achieved"),
                    api_ticket(2, 5, "N/A", "Breached"),
                ]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "tickets": [] })),
            )
            .mount(&server)
            .await;

        let client = FreshServiceClient::with_base_url(server.uri(), "key".to_string());
        let job = FreshServiceJob::new(client, 1, std::time::Duration::ZERO);

        let tickets = job.collect().await.unwrap();

        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].id, 1);
        assert_eq!(tickets[0].status, TicketStatus::Open);
        assert_eq!(tickets[0].channel.as_deref(), Some("bink"));
        assert_eq!(tickets[0].sla_breached, Some(false));
        assert_eq!(tickets[1].status, TicketStatus::Closed);
        // "N/A" collapses to no channel
        assert_eq!(tickets[1].channel, None);
        assert_eq!(tickets[1].sla_breached, Some(true));
    }

    #[tokio::test]
    async fn test_collect_retries_page_after_rate_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "tickets": [] })),
            )
            .mount(&server)
            .await;

        let client = FreshServiceClient::with_base_url(server.uri(), "key".to_string());
        let job = FreshServiceJob::new(client, 1, std::time::Duration::ZERO);

        let tickets = job.collect().await.unwrap();
        assert!(tickets.is_empty());

        // The rate-limited request plus the retried page
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_collect_skips_unknown_status_codes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tickets": [api_ticket(1, 99, "bink", "Achieved"), api_ticket(2, 3, "bink", "")]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "tickets": [] })),
            )
            .mount(&server)
            .await;

        let client = FreshServiceClient::with_base_url(server.uri(), "key".to_string());
        let job = FreshServiceJob::new(client, 1, std::time::Duration::ZERO);

        let tickets = job.collect().await.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, TicketStatus::Pending);
        assert_eq!(tickets[0].sla_breached, None);
    }

    #[tokio::test]
    async fn test_collect_surfaces_server_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/tickets"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = FreshServiceClient::with_base_url(server.uri(), "key".to_string());
        let job = FreshServiceJob::new(client, 1, std::time::Duration::ZERO);

        assert!(job.collect().await.is_err());
    }
}
