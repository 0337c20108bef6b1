//! REST client for the marketplace's blocked-period endpoints.
//!
//! Remote ids are integers. They are carried as ULIDs whose 128-bit value
//! is the integer, so `Ulid::from(42u128)` is blocked period 42.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use ulid::Ulid;
use url::Url;

use crate::config::{ApiConfig, Credentials};
use crate::gateway::{Deletion, GatewayError, PersistenceGateway};
use crate::model::*;

const COLLECTION_PATH: &str = "api/places/blocked-periods/";

/// Integer id of a remote record or listing.
pub fn remote_id(id: Ulid) -> Result<u64, GatewayError> {
    u64::try_from(u128::from(id)).map_err(|_| GatewayError::Rejected(format!("{id} is not a remote id")))
}

pub fn local_id(remote: u64) -> Ulid {
    Ulid::from(u128::from(remote))
}

/// A blocked period as the API serializes it.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockedPeriodDto {
    pub id: u64,
    pub place: u64,
    pub start_datetime: DateTime<Utc>,
    pub end_datetime: DateTime<Utc>,
    pub block_type: BlockKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurring_pattern: Option<RecurrencePattern>,
    #[serde(default)]
    pub recurring_end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BlockedPeriodDto> for BlockedInterval {
    type Error = GatewayError;

    fn try_from(dto: BlockedPeriodDto) -> Result<Self, GatewayError> {
        let start = dto.start_datetime.timestamp_millis();
        let end = dto.end_datetime.timestamp_millis();
        if end <= start {
            return Err(GatewayError::InvalidResponse(format!(
                "blocked period {} ends before it starts",
                dto.id
            )));
        }
        let recurrence = match (dto.is_recurring, dto.recurring_pattern) {
            (false, _) => None,
            (true, Some(pattern)) => Some(Recurrence {
                pattern,
                // No end date means it recurs indefinitely.
                until: dto.recurring_end_date.unwrap_or(NaiveDate::MAX),
            }),
            (true, None) => {
                return Err(GatewayError::InvalidResponse(format!(
                    "blocked period {} is recurring without a pattern",
                    dto.id
                )));
            }
        };
        Ok(BlockedInterval {
            id: local_id(dto.id),
            resource_id: local_id(dto.place),
            span: Span::new(start, end),
            kind: dto.block_type,
            reason: dto.reason.filter(|r| !r.is_empty()),
            recurrence,
            created_at: dto.created_at.timestamp_millis(),
            updated_at: dto.updated_at.timestamp_millis(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    place_id: u64,
    start_datetime: DateTime<Utc>,
    end_datetime: DateTime<Utc>,
    block_type: BlockKind,
    reason: &'a str,
    is_recurring: bool,
    recurring_pattern: Option<RecurrencePattern>,
    recurring_end_date: Option<NaiveDate>,
}

fn to_utc(ms: Ms) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| GatewayError::Rejected(format!("timestamp {ms} out of range")))
}

impl<'a> CreateRequest<'a> {
    fn new(place_id: u64, candidate: &'a Candidate) -> Result<Self, GatewayError> {
        Ok(Self {
            place_id,
            start_datetime: to_utc(candidate.start)?,
            end_datetime: to_utc(candidate.end)?,
            block_type: candidate.kind,
            reason: candidate.reason.as_deref().unwrap_or(""),
            is_recurring: candidate.recurrence.is_some(),
            recurring_pattern: candidate.recurrence.map(|r| r.pattern),
            recurring_end_date: candidate.recurrence.map(|r| r.until),
        })
    }
}

fn session_headers(credentials: &Credentials) -> Result<HeaderMap, GatewayError> {
    let invalid = |what: &str| GatewayError::Rejected(format!("{what} contains invalid header characters"));
    let mut headers = HeaderMap::new();
    headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));

    let mut cookies = Vec::new();
    if let Some(session) = &credentials.session_id {
        cookies.push(format!("sessionid={session}"));
    }
    if let Some(csrf) = &credentials.csrf_token {
        cookies.push(format!("csrftoken={csrf}"));
        let mut value = HeaderValue::from_str(csrf).map_err(|_| invalid("CSRF token"))?;
        value.set_sensitive(true);
        headers.insert("X-CSRFToken", value);
    }
    if !cookies.is_empty() {
        let mut value = HeaderValue::from_str(&cookies.join("; ")).map_err(|_| invalid("session cookie"))?;
        value.set_sensitive(true);
        headers.insert(COOKIE, value);
    }
    Ok(headers)
}

/// [`PersistenceGateway`] over the marketplace REST API.
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    pub fn new(api: &ApiConfig, credentials: &Credentials) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(api.timeout)
            .default_headers(session_headers(credentials)?)
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to create HTTP client: {e}")))?;

        let mut base = api.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn collection_url(&self) -> Result<Url, GatewayError> {
        self.base
            .join(COLLECTION_PATH)
            .map_err(|e| GatewayError::Rejected(format!("bad API URL: {e}")))
    }

    fn detail_url(&self, remote: u64) -> Result<Url, GatewayError> {
        self.base
            .join(&format!("{COLLECTION_PATH}{remote}/"))
            .map_err(|e| GatewayError::Rejected(format!("bad API URL: {e}")))
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<Response, GatewayError> {
        request
            .send()
            .await
            .map_err(|e| GatewayError::Network(format!("request failed: {e}")))
    }

    /// Pass successful responses through; turn everything else into `Status`.
    async fn check(response: Response) -> Result<Response, GatewayError> {
        let status = response.status();
        trace!(%status, url = %response.url(), "received response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, body = %body, "blocked-period request failed");
        Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn read_period(response: Response) -> Result<BlockedInterval, GatewayError> {
        let dto: BlockedPeriodDto = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        dto.try_into()
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn list_intervals(&self, resource_id: Ulid) -> Result<Vec<BlockedInterval>, GatewayError> {
        let place_id = remote_id(resource_id)?;
        let request = self
            .client
            .get(self.collection_url()?)
            .query(&[("place_id", place_id)]);
        let response = Self::check(Self::send(request).await?).await?;
        let dtos: Vec<BlockedPeriodDto> = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        debug!(place_id, count = dtos.len(), "listed blocked periods");
        dtos.into_iter().map(BlockedInterval::try_from).collect()
    }

    async fn create_interval(
        &self,
        resource_id: Ulid,
        candidate: &Candidate,
    ) -> Result<BlockedInterval, GatewayError> {
        let body = CreateRequest::new(remote_id(resource_id)?, candidate)?;
        let request = self.client.post(self.collection_url()?).json(&body);
        let response = Self::check(Self::send(request).await?).await?;
        Self::read_period(response).await
    }

    async fn delete_interval(&self, id: Ulid) -> Result<Deletion, GatewayError> {
        let request = self.client.delete(self.detail_url(remote_id(id)?)?);
        let response = Self::send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%id, "blocked period already deleted");
            return Ok(Deletion::NotFound);
        }
        Self::check(response).await?;
        Ok(Deletion::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PERIOD_JSON: &str = r#"{
        "id": 17,
        "place": 4,
        "start_datetime": "2024-06-03T09:00:00Z",
        "end_datetime": "2024-06-03T17:00:00Z",
        "block_type": "maintenance",
        "block_type_display": "Maintenance",
        "reason": "line painting",
        "is_recurring": true,
        "recurring_pattern": "weekly",
        "recurring_pattern_display": "Weekly",
        "recurring_end_date": "2024-08-31",
        "booking": null,
        "created_at": "2024-05-01T10:00:00.123456Z",
        "updated_at": "2024-05-01T10:00:00.123456Z"
    }"#;

    fn api(base: &str) -> ApiConfig {
        ApiConfig {
            base_url: Url::parse(base).unwrap(),
            timeout: Duration::from_secs(5),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            session_id: Some("s3ss10n".into()),
            csrf_token: Some("csrf-tok".into()),
        }
    }

    /// Serve one canned response; yields the raw request text.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (base, handle)
    }

    #[test]
    fn dto_converts_to_interval() {
        let dto: BlockedPeriodDto = serde_json::from_str(PERIOD_JSON).unwrap();
        let interval = BlockedInterval::try_from(dto).unwrap();
        assert_eq!(interval.id, local_id(17));
        assert_eq!(interval.resource_id, local_id(4));
        assert_eq!(interval.kind, BlockKind::Maintenance);
        assert_eq!(interval.span.duration_ms(), 8 * 3_600_000);
        assert_eq!(interval.reason.as_deref(), Some("line painting"));
        assert_eq!(
            interval.recurrence,
            Some(Recurrence {
                pattern: RecurrencePattern::Weekly,
                until: NaiveDate::from_ymd_opt(2024, 8, 31).unwrap(),
            })
        );
    }

    #[test]
    fn dto_edge_cases() {
        let mut v: serde_json::Value = serde_json::from_str(PERIOD_JSON).unwrap();
        v["reason"] = "".into();
        v["recurring_end_date"] = serde_json::Value::Null;
        let interval = BlockedInterval::try_from(serde_json::from_value::<BlockedPeriodDto>(v.clone()).unwrap()).unwrap();
        assert_eq!(interval.reason, None);
        assert_eq!(interval.recurrence.unwrap().until, NaiveDate::MAX);

        v["recurring_pattern"] = serde_json::Value::Null;
        let err = BlockedInterval::try_from(serde_json::from_value::<BlockedPeriodDto>(v.clone()).unwrap()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));

        v["is_recurring"] = false.into();
        v["end_datetime"] = "2024-06-03T08:00:00Z".into();
        let err = BlockedInterval::try_from(serde_json::from_value::<BlockedPeriodDto>(v).unwrap()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[test]
    fn unknown_block_type_is_rejected() {
        let json = PERIOD_JSON.replace("\"maintenance\"", "\"vacation\"");
        assert!(serde_json::from_str::<BlockedPeriodDto>(&json).is_err());
    }

    #[test]
    fn ids_round_trip() {
        assert_eq!(remote_id(local_id(42)).unwrap(), 42);
        assert!(matches!(remote_id(Ulid::new()), Err(GatewayError::Rejected(_))));
    }

    #[test]
    fn urls_keep_base_path() {
        let gw = HttpGateway::new(&api("https://parkshare.example/app"), &Credentials::default()).unwrap();
        assert_eq!(gw.base_url().as_str(), "https://parkshare.example/app/");
        assert_eq!(
            gw.collection_url().unwrap().as_str(),
            "https://parkshare.example/app/api/places/blocked-periods/"
        );
        assert_eq!(
            gw.detail_url(9).unwrap().as_str(),
            "https://parkshare.example/app/api/places/blocked-periods/9/"
        );
    }

    #[test]
    fn create_request_body() {
        let candidate = Candidate::new(1_717_405_200_000, 1_717_434_000_000, BlockKind::OwnerBlock);
        let body = serde_json::to_value(CreateRequest::new(4, &candidate).unwrap()).unwrap();
        assert_eq!(body["place_id"], 4);
        assert_eq!(body["start_datetime"], "2024-06-03T09:00:00Z");
        assert_eq!(body["block_type"], "owner-block");
        assert_eq!(body["reason"], "");
        assert_eq!(body["is_recurring"], false);
        assert!(body["recurring_pattern"].is_null());
    }

    #[test]
    fn session_headers_carry_credentials() {
        let headers = session_headers(&credentials()).unwrap();
        assert_eq!(headers["X-CSRFToken"], "csrf-tok");
        assert_eq!(headers["X-Requested-With"], "XMLHttpRequest");
        assert_eq!(headers[COOKIE], "sessionid=s3ss10n; csrftoken=csrf-tok");
        assert!(headers[COOKIE].is_sensitive());

        let anonymous = session_headers(&Credentials::default()).unwrap();
        assert!(anonymous.get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn list_sends_place_and_credentials() {
        let body: &'static str = Box::leak(format!("[{PERIOD_JSON}]").into_boxed_str());
        let (base, server) = serve_once("200 OK", body).await;
        let gw = HttpGateway::new(&api(&base), &credentials()).unwrap();

        let listed = gw.list_intervals(local_id(4)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, local_id(17));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/places/blocked-periods/?place_id=4 HTTP/1.1"));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("x-csrftoken: csrf-tok"));
        assert!(lower.contains("cookie: sessionid=s3ss10n; csrftoken=csrf-tok"));
    }

    #[tokio::test]
    async fn delete_not_found_is_not_an_error() {
        let (base, server) = serve_once("404 Not Found", r#"{"error":"Blocked period not found"}"#).await;
        let gw = HttpGateway::new(&api(&base), &credentials()).unwrap();
        assert_eq!(gw.delete_interval(local_id(17)).await.unwrap(), Deletion::NotFound);
        assert!(server.await.unwrap().starts_with("DELETE /api/places/blocked-periods/17/ HTTP/1.1"));
    }

    #[tokio::test]
    async fn create_maps_error_status() {
        let (base, server) = serve_once("400 Bad Request", r#"{"error":"End time must be after start time"}"#).await;
        let gw = HttpGateway::new(&api(&base), &credentials()).unwrap();
        let candidate = Candidate::new(1_717_405_200_000, 1_717_434_000_000, BlockKind::OwnerBlock);
        let err = gw.create_interval(local_id(4), &candidate).await.unwrap_err();
        match err {
            GatewayError::Status { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("End time must be after start time"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert!(!GatewayError::Status { status: 400, body: String::new() }.is_retryable());
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/places/blocked-periods/ HTTP/1.1"));
        assert!(request.contains("\"place_id\":4"));
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let gw = HttpGateway::new(&api(&base), &credentials()).unwrap();
        let err = gw.list_intervals(local_id(4)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert!(err.is_retryable());
    }
}
