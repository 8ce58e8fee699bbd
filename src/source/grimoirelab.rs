//! GrimoireLab API client and a source that waits for repositories to be collected

use super::MetricSource;
use crate::config::{GrimoireLabConfig, NetworkConfig};
use crate::error::{Result, TrustError};
use crate::types::Measurements;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const SERVICE: &str = "GrimoireLab";

#[derive(Debug, Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryList {
    #[serde(default)]
    results: Vec<RepositoryEntry>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    task: Option<RepositoryTask>,
}

#[derive(Debug, Deserialize)]
struct RepositoryTask {
    last_run: Option<String>,
}

/// Client for the GrimoireLab datasources API
#[derive(Debug)]
pub struct GrimoireLabClient {
    client: Client,
    base_url: String,
    tokens: RwLock<Tokens>,
}

impl GrimoireLabClient {
    /// Create a client and, when credentials are configured, obtain an access token
    pub async fn connect(config: &GrimoireLabConfig, network: &NetworkConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| TrustError::config("GrimoireLab URL is not configured"))?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(network.timeout())
            .build()
            .map_err(|e| TrustError::config(format!("Failed to build HTTP client: {}", e)))?;

        let this = Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            tokens: RwLock::new(Tokens::default()),
        };

        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            let response = this
                .send(
                    Method::POST,
                    "token/",
                    Some(&json!({ "username": user, "password": password })),
                    &[],
                )
                .await?;
            let tokens: TokenResponse = read_json(response).await?;
            *this.tokens.write().await = Tokens {
                access: tokens.access,
                refresh: tokens.refresh,
            };
            debug!("Authenticated against {} as {}", this.base_url, user);
        }

        Ok(this)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.client.request(method, url).query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(token) = &self.tokens.read().await.access {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Send an authenticated request, refreshing the access token once on 403
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let response = self.send(method.clone(), path, body, query).await?;
        if response.status() != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        let has_refresh = self.tokens.read().await.refresh.is_some();
        if !has_refresh {
            return Ok(response);
        }

        self.refresh_token().await?;
        self.send(method, path, body, query).await
    }

    async fn refresh_token(&self) -> Result<()> {
        debug!("Refreshing GrimoireLab token");
        let refresh = self.tokens.read().await.refresh.clone();
        let response = self
            .send(Method::POST, "token/refresh/", Some(&json!({ "refresh": refresh })), &[])
            .await?;
        let tokens: TokenResponse = read_json(response).await?;

        let mut current = self.tokens.write().await;
        current.access = tokens.access;
        if tokens.refresh.is_some() {
            current.refresh = tokens.refresh;
        }
        Ok(())
    }

    /// Ask GrimoireLab to collect the commits of a git repository.
    ///
    /// A repository that is already registered is not an error.
    pub async fn schedule_repository(&self, uri: &str) -> Result<()> {
        debug!("Scheduling task to fetch commits from {}", uri);
        let body = json!({
            "uri": uri,
            "datasource_type": "git",
            "datasource_category": "commit",
        });
        let response = self
            .request(Method::POST, "datasources/add_repository", Some(&body), &[])
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::METHOD_NOT_ALLOWED && already_exists(&text) {
            debug!("Repository {} already scheduled", uri);
            return Ok(());
        }

        Err(TrustError::api(
            SERVICE,
            format!("scheduling {} failed with HTTP {}: {}", uri, status, text),
        ))
    }

    /// Whether the repository's collection task last ran after `after`
    pub async fn repository_ready(&self, uri: &str, after: DateTime<Utc>) -> Result<bool> {
        let response = self
            .request(Method::GET, "datasources/repositories/", None, &[("uri", uri)])
            .await?;

        if !response.status().is_success() {
            warn!(
                "Error checking repository status for {}: HTTP {}",
                uri,
                response.status()
            );
            return Ok(false);
        }

        let list: RepositoryList = read_json(response).await?;
        let last_run = list
            .results
            .into_iter()
            .next()
            .and_then(|entry| entry.task)
            .and_then(|task| task.last_run);

        Ok(match last_run.as_deref().and_then(parse_timestamp) {
            Some(last_run) => last_run > after,
            None => false,
        })
    }

    /// Poll until the repository is ready or `timeout` elapses
    pub async fn wait_until_ready(
        &self,
        uri: &str,
        after: DateTime<Utc>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.repository_ready(uri, after).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() + poll_interval >= deadline {
                return Err(TrustError::source_unavailable(
                    uri,
                    format!("repository not analyzed within {}s", timeout.as_secs()),
                ));
            }
            info!("Waiting for {} to be ready", uri);
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn already_exists(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .is_some_and(|error| error.contains("already exists"))
}

/// ISO 8601 timestamps; naive ones are taken as UTC
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.and_utc())
        })
}

async fn read_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrustError::api(SERVICE, format!("HTTP {}: {}", status, body)));
    }
    Ok(response.json().await?)
}

/// Source that makes sure GrimoireLab has collected a repository before
/// delegating to the source reading the collected events
pub struct GrimoireLabSource<S> {
    client: GrimoireLabClient,
    inner: S,
    after: DateTime<Utc>,
    poll_interval: Duration,
    repository_timeout: Duration,
    name: String,
}

impl<S: MetricSource> GrimoireLabSource<S> {
    pub fn new(client: GrimoireLabClient, inner: S, config: &GrimoireLabConfig) -> Self {
        let name = format!("grimoirelab+{}", inner.name());
        Self {
            client,
            inner,
            after: Utc::now() - ChronoDuration::days(1),
            poll_interval: config.poll_interval(),
            repository_timeout: config.repository_timeout(),
            name,
        }
    }

    /// Collection runs finishing after this instant count as fresh
    pub fn with_fresh_after(mut self, after: DateTime<Utc>) -> Self {
        self.after = after;
        self
    }
}

#[async_trait]
impl<S: MetricSource> MetricSource for GrimoireLabSource<S> {
    async fn fetch(&self, project: &str) -> Result<Measurements> {
        let unavailable = |e: TrustError| match e {
            TrustError::SourceUnavailable { .. } => e,
            other => TrustError::source_unavailable(project, other.to_string()),
        };

        self.client
            .schedule_repository(project)
            .await
            .map_err(unavailable)?;
        self.client
            .wait_until_ready(project, self.after, self.poll_interval, self.repository_timeout)
            .await
            .map_err(unavailable)?;

        self.inner.fetch(project).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MetricsDocument, StaticSource};
    use chrono::TimeZone;
    use mockito::Matcher;

    const REPO: &str = "https://github.com/chaoss/grimoirelab-sortinghat";

    fn config(url: &str, credentials: bool) -> GrimoireLabConfig {
        GrimoireLabConfig {
            url: Some(url.to_string()),
            user: credentials.then(|| "admin".to_string()),
            password: credentials.then(|| "secret".to_string()),
            poll_interval_secs: 0,
            repository_timeout_secs: 0,
        }
    }

    fn after() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn repository_status(last_run: Option<&str>) -> String {
        json!({ "results": [{ "uri": REPO, "task": { "last_run": last_run } }] }).to_string()
    }

    #[tokio::test]
    async fn test_connect_and_schedule_with_token() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token/")
            .match_body(Matcher::Json(json!({ "username": "admin", "password": "secret" })))
            .with_status(200)
            .with_body(json!({ "access": "a1", "refresh": "r1" }).to_string())
            .create_async()
            .await;
        let schedule = server
            .mock("POST", "/datasources/add_repository")
            .match_header("authorization", "Bearer a1")
            .match_body(Matcher::PartialJson(json!({
                "uri": REPO,
                "datasource_type": "git",
                "datasource_category": "commit"
            })))
            .with_status(201)
            .create_async()
            .await;

        let client = GrimoireLabClient::connect(&config(&server.url(), true), &NetworkConfig::default())
            .await
            .unwrap();
        client.schedule_repository(REPO).await.unwrap();

        token.assert_async().await;
        schedule.assert_async().await;
    }

    #[tokio::test]
    async fn test_schedule_already_exists_is_ok() {
        let mut server = mockito::Server::new_async().await;
        let _schedule = server
            .mock("POST", "/datasources/add_repository")
            .with_status(405)
            .with_body(json!({ "error": "Repository already exists" }).to_string())
            .create_async()
            .await;

        let client = GrimoireLabClient::connect(&config(&server.url(), false), &NetworkConfig::default())
            .await
            .unwrap();
        client.schedule_repository(REPO).await.unwrap();
    }

    #[tokio::test]
    async fn test_schedule_other_error_fails() {
        let mut server = mockito::Server::new_async().await;
        let _schedule = server
            .mock("POST", "/datasources/add_repository")
            .with_status(400)
            .with_body(json!({ "error": "invalid uri" }).to_string())
            .create_async()
            .await;

        let client = GrimoireLabClient::connect(&config(&server.url(), false), &NetworkConfig::default())
            .await
            .unwrap();
        assert!(client.schedule_repository(REPO).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(json!({ "access": "old", "refresh": "r1" }).to_string())
            .create_async()
            .await;
        let _rejected = server
            .mock("GET", "/datasources/repositories/")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer old")
            .with_status(403)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .match_body(Matcher::Json(json!({ "refresh": "r1" })))
            .with_status(200)
            .with_body(json!({ "access": "new" }).to_string())
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/datasources/repositories/")
            .match_query(Matcher::UrlEncoded("uri".into(), REPO.into()))
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(repository_status(Some("2024-05-02T10:00:00+00:00")))
            .create_async()
            .await;

        let client = GrimoireLabClient::connect(&config(&server.url(), true), &NetworkConfig::default())
            .await
            .unwrap();
        assert!(client.repository_ready(REPO, after()).await.unwrap());

        refresh.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_or_missing_run_is_not_ready() {
        let mut server = mockito::Server::new_async().await;
        let _status = server
            .mock("GET", "/datasources/repositories/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(repository_status(Some("2024-04-30T10:00:00.123456")))
            .create_async()
            .await;

        let client = GrimoireLabClient::connect(&config(&server.url(), false), &NetworkConfig::default())
            .await
            .unwrap();
        assert!(!client.repository_ready(REPO, after()).await.unwrap());

        let err = client
            .wait_until_ready(REPO, after(), Duration::ZERO, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_source_waits_then_delegates() {
        let mut server = mockito::Server::new_async().await;
        let _schedule = server
            .mock("POST", "/datasources/add_repository")
            .with_status(201)
            .create_async()
            .await;
        let _status = server
            .mock("GET", "/datasources/repositories/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(repository_status(Some("2024-05-02T10:00:00Z")))
            .create_async()
            .await;

        let config = config(&server.url(), false);
        let client = GrimoireLabClient::connect(&config, &NetworkConfig::default())
            .await
            .unwrap();
        let mut inner = StaticSource::new("memory", MetricsDocument::default());
        inner.insert(REPO, "total_commits", 12.0);

        let source = GrimoireLabSource::new(client, inner, &config).with_fresh_after(after());
        assert_eq!(source.name(), "grimoirelab+memory");
        let measurements: Vec<_> = source.fetch(REPO).await.unwrap().collect();
        assert_eq!(measurements.len(), 1);
    }

    #[test]
    fn test_parse_timestamp() {
        assert!(parse_timestamp("2024-05-02T10:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-05-02T10:00:00.5").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
