//! Measurements computed from GrimoireLab commit events stored in OpenSearch

use super::events::{GitEvent, GitEventsAnalyzer, COMMIT_EVENT_TYPE};
use super::MetricSource;
use crate::config::{NetworkConfig, SourceConfig};
use crate::error::{Result, TrustError};
use crate::types::{Measurements, RawMeasurement};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const SCROLL_KEEP_ALIVE: &str = "2m";
const DEFAULT_WINDOW_DAYS: i64 = 365;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: GitEvent,
}

/// Reads commit events for a repository and turns them into activity metrics
pub struct OpenSearchSource {
    client: Client,
    base_url: String,
    config: SourceConfig,
    network: NetworkConfig,
    name: String,
}

impl OpenSearchSource {
    pub fn new(config: &SourceConfig, network: &NetworkConfig) -> Result<Self> {
        // Fail early on a bad pattern instead of once per project
        GitEventsAnalyzer::new(&config.code_file_pattern)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(network.timeout())
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()
            .map_err(|e| TrustError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.opensearch_url.trim_end_matches('/').to_string(),
            config: config.clone(),
            network: network.clone(),
            name: format!("opensearch:{}", config.opensearch_index),
        })
    }

    /// Start and end of the analysis window, and its length in days
    fn window(&self) -> (NaiveDate, Option<NaiveDate>, i64) {
        analysis_window(self.config.from_date, self.config.to_date, Utc::now().date_naive())
    }

    fn search_query(&self, project: &str, from: NaiveDate, to: Option<NaiveDate>) -> Value {
        let mut range = json!({ "gte": from.to_string() });
        if let Some(to) = to {
            range["lt"] = json!(to.to_string());
        }

        json!({
            "size": self.config.page_size,
            "query": {
                "bool": {
                    "filter": [
                        { "match": { "source": project } },
                        { "term": { "type": COMMIT_EVENT_TYPE } },
                        { "range": { "time": range } }
                    ]
                }
            }
        })
    }

    async fn fetch_events(&self, project: &str, analyzer: &mut GitEventsAnalyzer) -> Result<()> {
        let (from, to, _) = self.window();
        let url = format!(
            "{}/{}/_search?scroll={}",
            self.base_url,
            urlencoding::encode(&self.config.opensearch_index),
            SCROLL_KEEP_ALIVE
        );
        let query = self.search_query(project, from, to);

        let mut page: SearchResponse =
            read_json(self.send_with_retry(|| self.client.post(&url).json(&query)).await?).await?;
        let mut scroll_id = page.scroll_id.take();
        let mut total = 0usize;

        loop {
            if page.hits.hits.is_empty() {
                break;
            }
            total += page.hits.hits.len();
            analyzer.process_events(page.hits.hits.into_iter().map(|h| h.source));

            let Some(id) = scroll_id.clone() else {
                break;
            };
            let scroll_url = format!("{}/_search/scroll", self.base_url);
            let body = json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": id });
            page = read_json(
                self.send_with_retry(|| self.client.post(&scroll_url).json(&body))
                    .await?,
            )
            .await?;
            if page.scroll_id.is_some() {
                scroll_id = page.scroll_id.take();
            }
        }

        if let Some(id) = scroll_id {
            self.clear_scroll(&id).await;
        }

        debug!("Read {} events for {}", total, project);
        Ok(())
    }

    async fn clear_scroll(&self, scroll_id: &str) {
        let url = format!("{}/_search/scroll", self.base_url);
        if let Err(e) = self
            .client
            .delete(&url)
            .json(&json!({ "scroll_id": scroll_id }))
            .send()
            .await
        {
            debug!("Failed to clear scroll context: {}", e);
        }
    }

    /// Send a request, retrying transport errors and throttling with exponential backoff
    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempts = 0;
        let mut delay = self.network.request_delay();

        loop {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable || attempts >= self.network.max_retries {
                        return Ok(response);
                    }
                    warn!("OpenSearch answered {}, retrying after {:?}", status, delay);
                }
                Err(e) => {
                    if attempts >= self.network.max_retries {
                        return Err(TrustError::from(e));
                    }
                    warn!("OpenSearch request failed, retrying: {}", e);
                }
            }
            tokio::time::sleep(delay).await;
            attempts += 1;
            delay *= 2;
        }
    }
}

/// Without a start date the window opens a year before today; its length runs to the
/// end date, or to today when the window is open-ended
fn analysis_window(
    from_date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
    today: NaiveDate,
) -> (NaiveDate, Option<NaiveDate>, i64) {
    let from = from_date.unwrap_or_else(|| today - Duration::days(DEFAULT_WINDOW_DAYS));
    let days = (to_date.unwrap_or(today) - from).num_days();
    (from, to_date, days)
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrustError::api(
            "OpenSearch",
            format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
        ));
    }
    Ok(response.json().await?)
}

#[async_trait]
impl MetricSource for OpenSearchSource {
    async fn fetch(&self, project: &str) -> Result<Measurements> {
        let mut analyzer = GitEventsAnalyzer::new(&self.config.code_file_pattern)?;

        self.fetch_events(project, &mut analyzer)
            .await
            .map_err(|e| match e {
                TrustError::SourceUnavailable { .. } => e,
                other => TrustError::source_unavailable(project, other.to_string()),
            })?;

        if analyzer.commit_count() == 0 {
            debug!("No commit events for {}", project);
            return Ok(Measurements::empty());
        }

        let (_, _, days) = self.window();
        let measured_at = Utc::now();
        let measurements: Vec<RawMeasurement> = analyzer
            .metrics(days)
            .into_iter()
            .map(|(metric, value)| RawMeasurement::new(project, metric, value, measured_at, self.name.as_str()))
            .collect();

        Ok(measurements.into())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricValue;
    use mockito::Matcher;

    const REPO: &str = "https://github.com/chaoss/grimoirelab-perceval";

    fn source(url: &str) -> OpenSearchSource {
        source_with_retries(url, 0)
    }

    fn source_with_retries(url: &str, max_retries: u32) -> OpenSearchSource {
        let config = SourceConfig {
            opensearch_url: url.to_string(),
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            to_date: NaiveDate::from_ymd_opt(2024, 1, 29),
            ..Default::default()
        };
        let network = NetworkConfig {
            max_retries,
            request_delay_ms: 1,
            ..Default::default()
        };
        OpenSearchSource::new(&config, &network).unwrap()
    }

    fn event(author: &str) -> Value {
        json!({
            "_source": {
                "type": COMMIT_EVENT_TYPE,
                "source": REPO,
                "data": { "Author": author, "message": "Fix bug", "files": [{ "file": "src/main.rs", "added": "3", "removed": "1" }] }
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_scrolls_all_pages() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .match_body(Matcher::Regex(format!(r#""source":"{}""#, REPO)))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "_scroll_id": "scroll-1",
                    "hits": { "hits": [event("Ann <ann@a.org>"), event("Bob <bob@b.org>")] }
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("POST", "/_search/scroll")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({ "_scroll_id": "scroll-1", "hits": { "hits": [event("Ann <ann@a.org>")] } }).to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let last = server
            .mock("POST", "/_search/scroll")
            .match_body(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "_scroll_id": "scroll-1", "hits": { "hits": [] } }).to_string())
            .create_async()
            .await;
        let _clear = server
            .mock("DELETE", "/_search/scroll")
            .with_status(200)
            .create_async()
            .await;

        let measurements: Vec<_> = source(&server.url()).fetch(REPO).await.unwrap().collect();

        first.assert_async().await;
        second.assert_async().await;
        last.assert_async().await;

        let value = |key: &str| {
            measurements
                .iter()
                .find(|m| m.metric == key)
                .map(|m| m.value.clone())
                .unwrap()
        };
        assert_eq!(value("total_commits"), MetricValue::Number(3.0));
        assert_eq!(value("total_contributors"), MetricValue::Number(2.0));
        assert_eq!(value("commit_size_added_lines"), MetricValue::Number(9.0));
        // 3 commits over 28 days
        assert_eq!(value("commits_week_mean"), MetricValue::Number(0.75));
        assert!(measurements.iter().all(|m| m.project == REPO));
    }

    #[tokio::test]
    async fn test_no_events_is_empty() {
        let mut server = mockito::Server::new_async().await;
        let _search = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "hits": { "hits": [] } }).to_string())
            .create_async()
            .await;

        let measurements = source(&server.url()).fetch(REPO).await.unwrap();
        assert_eq!(measurements.remaining(), 0);
    }

    #[tokio::test]
    async fn test_server_error_is_source_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _search = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let err = source(&server.url()).fetch(REPO).await.unwrap_err();
        assert!(matches!(err, TrustError::SourceUnavailable { ref project, .. } if project == REPO));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create_async()
            .await;
        let recovered = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "hits": { "hits": [event("Ann <ann@a.org>")] } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let measurements: Vec<_> = source_with_retries(&server.url(), 2)
            .fetch(REPO)
            .await
            .unwrap()
            .collect();

        failing.assert_async().await;
        recovered.assert_async().await;
        assert!(measurements
            .iter()
            .any(|m| m.metric == "total_commits" && m.value == MetricValue::Number(1.0)));
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_source_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let search = server
            .mock("POST", Matcher::Regex(r"^/events/_search".to_string()))
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let err = source_with_retries(&server.url(), 2).fetch(REPO).await.unwrap_err();
        search.assert_async().await;
        assert!(matches!(err, TrustError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_window_defaults() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();

        let (from, to, days) = analysis_window(None, None, today);
        assert_eq!(from, NaiveDate::from_ymd_opt(2025, 10, 19).unwrap());
        assert_eq!(to, None);
        assert_eq!(days, 365);

        let start = NaiveDate::from_ymd_opt(2026, 9, 19).unwrap();
        assert_eq!(analysis_window(Some(start), None, today).2, 30);
    }

    #[test]
    fn test_window_with_only_end_date() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let end = today - Duration::days(180);

        let (from, to, days) = analysis_window(None, Some(end), today);
        assert_eq!(from, today - Duration::days(365));
        assert_eq!(to, Some(end));
        assert_eq!(days, 185);
    }

    #[test]
    fn test_invalid_code_pattern_rejected() {
        let config = SourceConfig {
            code_file_pattern: "(unclosed".to_string(),
            ..Default::default()
        };
        assert!(OpenSearchSource::new(&config, &NetworkConfig::default()).is_err());
    }
}
