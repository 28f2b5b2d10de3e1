//! Portal client contract, the live Inovar client, a fixture-backed client and
//! the record normalizer.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{ACCEPT, AUTHORIZATION, ORIGIN, REFERER};
use reqwest::StatusCode;
use sapn_core::EventType;
use sapn_storage::{build_http_client, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{normalize_record, NormalizeError};

pub const CRATE_NAME: &str = "sapn-adapters";

pub const DEFAULT_BASE_URL: &str = "https://aevf.inovarmais.com/consulta";
/// Static request token the portal's web app sends with the login call.
pub const DEFAULT_REQUEST_TOKEN: &str = "BOEVWPDJeXR53H99PvF/X7noUsWl4ajpSDiNAk6QeYU=";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

const CHALLENGE_MARKERS: [&str; 6] = [
    "cf-chl",
    "challenge-platform",
    "just a moment",
    "attention required",
    "cf-browser-verification",
    "captcha",
];

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("blocked by anti-automation challenge: {0}")]
    Blocked(String),
    #[error("portal transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PortalError {
    pub fn is_blocked(&self) -> bool {
        matches!(self, PortalError::Blocked(_))
    }
}

#[async_trait]
pub trait PortalClient: Send + Sync {
    fn portal_id(&self) -> &str;

    async fn fetch_absences(&self) -> Result<Vec<JsonValue>, PortalError>;

    async fn fetch_behavior_alerts(&self) -> Result<Vec<JsonValue>, PortalError>;

    async fn fetch(&self, event_type: EventType) -> Result<Vec<JsonValue>, PortalError> {
        match event_type {
            EventType::Absence => self.fetch_absences().await,
            EventType::BehaviorAlert => self.fetch_behavior_alerts().await,
        }
    }
}

/// Heuristic for anti-bot interstitials served instead of API JSON.
pub fn looks_like_challenge(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    // record text may mention any marker; a successful JSON body is never a challenge
    if status.is_success() && serde_json::from_str::<serde::de::IgnoredAny>(body).is_ok() {
        return false;
    }
    let head: String = body.chars().take(4096).collect::<String>().to_ascii_lowercase();
    if CHALLENGE_MARKERS.iter().any(|marker| head.contains(marker)) {
        return true;
    }
    let is_html = head.trim_start().starts_with("<!doctype html") || head.trim_start().starts_with("<html");
    is_html && matches!(status, StatusCode::FORBIDDEN | StatusCode::SERVICE_UNAVAILABLE)
}

/// Plain 401/403 from the API, as opposed to a challenge page.
fn is_auth_rejection(status: StatusCode, body: &str) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        && !looks_like_challenge(status, body)
}

fn check_response(status: StatusCode, body: &str, what: &str) -> Result<(), PortalError> {
    if looks_like_challenge(status, body) {
        return Err(PortalError::Blocked(format!("{what}: http {}", status.as_u16())));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PortalError::Upstream(format!(
            "{what}: authentication rejected (http {})",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(PortalError::Upstream(format!("{what}: http {}", status.as_u16())));
    }
    Ok(())
}

fn parse_json_body(body: &str, what: &str) -> Result<JsonValue, PortalError> {
    serde_json::from_str(body)
        .map_err(|e| PortalError::Upstream(format!("{what}: response is not JSON: {e}")))
}

/// Authenticated portal session for one student enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSession {
    pub token: String,
    pub student_id: Option<i64>,
    pub enrollment_id: i64,
    pub teaching_type: i64,
}

pub fn parse_login_response(value: &JsonValue) -> Result<PortalSession, PortalError> {
    let token = value
        .get("TokenLogin")
        .or_else(|| value.get("token"))
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PortalError::Upstream("login: no token in response".to_string()))?;

    // first enrollment is the current school year
    let enrollment = value
        .get("Matriculas")
        .and_then(JsonValue::as_array)
        .and_then(|list| list.first())
        .ok_or_else(|| PortalError::Upstream("login: no enrollments in response".to_string()))?;
    let enrollment_id = enrollment
        .get("MatriculaId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| PortalError::Upstream("login: enrollment without MatriculaId".to_string()))?;

    Ok(PortalSession {
        token: token.to_string(),
        student_id: value
            .get("Aluno")
            .and_then(|a| a.get("AlunoId"))
            .and_then(JsonValue::as_i64),
        enrollment_id,
        teaching_type: enrollment
            .get("TipoEnsino")
            .and_then(JsonValue::as_i64)
            .unwrap_or(1),
    })
}

#[derive(Debug, Clone)]
pub struct InovarPortalConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_token: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct InovarPortalClient {
    config: InovarPortalConfig,
    http: reqwest::Client,
    session: Mutex<Option<PortalSession>>,
}

impl InovarPortalClient {
    pub fn new(config: InovarPortalConfig) -> Result<Self> {
        let mut http_config = config.http.clone();
        if http_config.user_agent.is_none() {
            http_config.user_agent = Some(DEFAULT_USER_AGENT.to_string());
        }
        let http = build_http_client(&http_config)?;
        Ok(Self {
            config,
            http,
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn login(&self) -> Result<PortalSession, PortalError> {
        let username = &self.config.username;
        let password = &self.config.password;
        let payload = json!({
            "username": BASE64.encode(username),
            "password": BASE64.encode(password),
            "sessionId": BASE64.encode(Uuid::new_v4().to_string()),
        });
        let basic = BASE64.encode(format!("{username}:{password}"));

        info!(username = %username, "logging in to portal");
        let resp = self
            .http
            .post(self.url("/api/loginFU/"))
            .header(AUTHORIZATION, format!("Basic {basic}"))
            .header("x-festmani", &self.config.request_token)
            .header(ACCEPT, "application/json, text/plain, */*")
            .header(ORIGIN, self.config.base_url.as_str())
            .header(REFERER, self.url("/app/index.html"))
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        check_response(status, &body, "login")?;

        let session = parse_login_response(&parse_json_body(&body, "login")?)?;
        info!(
            enrollment_id = session.enrollment_id,
            teaching_type = session.teaching_type,
            "portal login succeeded"
        );
        Ok(session)
    }

    async fn session(&self) -> Result<PortalSession, PortalError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Fetches one list, logging in again once if the cached token was rejected.
    async fn fetch_list(&self, resource: &str, list_key: &str) -> Result<Vec<JsonValue>, PortalError> {
        if let Some(records) = self.fetch_list_once(resource, list_key).await? {
            return Ok(records);
        }
        warn!(resource, "session token rejected, logging in again");
        self.invalidate_session().await;
        self.fetch_list_once(resource, list_key)
            .await?
            .ok_or_else(|| {
                PortalError::Upstream(format!(
                    "{resource}: authentication rejected after a fresh login"
                ))
            })
    }

    /// `Ok(None)` means the portal rejected the session token.
    async fn fetch_list_once(
        &self,
        resource: &str,
        list_key: &str,
    ) -> Result<Option<Vec<JsonValue>>, PortalError> {
        let session = self.session().await?;
        let url = self.url(&format!(
            "/api/{resource}/{}/{}",
            session.enrollment_id, session.teaching_type
        ));

        let span = info_span!("portal_fetch", resource, url = %url);
        async {
            // the portal expects no space after "Bearer"
            let resp = self
                .http
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer{}", session.token))
                .header(ACCEPT, "application/json, text/plain, */*")
                .header(REFERER, self.url("/app/index.html"))
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if is_auth_rejection(status, &body) {
                return Ok::<_, PortalError>(None);
            }
            check_response(status, &body, resource)?;

            let value = parse_json_body(&body, resource)?;
            let records = value
                .get(list_key)
                .and_then(JsonValue::as_array)
                .cloned()
                .ok_or_else(|| {
                    PortalError::Upstream(format!("{resource}: unexpected schema, missing `{list_key}`"))
                })?;
            debug!(count = records.len(), "fetched portal records");
            Ok::<_, PortalError>(Some(records))
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PortalClient for InovarPortalClient {
    fn portal_id(&self) -> &str {
        "inovar"
    }

    async fn fetch_absences(&self) -> Result<Vec<JsonValue>, PortalError> {
        self.fetch_list("faltas", "Faltas").await
    }

    async fn fetch_behavior_alerts(&self) -> Result<Vec<JsonValue>, PortalError> {
        self.fetch_list("comportamento", "Comportamentos").await
    }
}

/// Captured portal responses, one raw record per entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortalFixture {
    #[serde(default)]
    pub absences: Vec<JsonValue>,
    #[serde(default)]
    pub behavior_alerts: Vec<JsonValue>,
}

pub fn load_portal_fixture(path: impl AsRef<Path>) -> Result<PortalFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct FixturePortalClient {
    fixture: PortalFixture,
}

impl FixturePortalClient {
    pub fn new(fixture: PortalFixture) -> Self {
        Self { fixture }
    }

    pub fn from_records(absences: Vec<JsonValue>, behavior_alerts: Vec<JsonValue>) -> Self {
        Self::new(PortalFixture {
            absences,
            behavior_alerts,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_portal_fixture(path)?))
    }
}

#[async_trait]
impl PortalClient for FixturePortalClient {
    fn portal_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_absences(&self) -> Result<Vec<JsonValue>, PortalError> {
        Ok(self.fixture.absences.clone())
    }

    async fn fetch_behavior_alerts(&self) -> Result<Vec<JsonValue>, PortalError> {
        Ok(self.fixture.behavior_alerts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn login_response_prefers_token_login_and_first_enrollment() {
        let value = json!({
            "TokenLogin": "abc.def",
            "Aluno": { "AlunoId": 77, "Nome": "Aluno Teste" },
            "Matriculas": [
                { "MatriculaId": 1201, "TipoEnsino": 2 },
                { "MatriculaId": 900, "TipoEnsino": 1 }
            ]
        });
        let session = parse_login_response(&value).unwrap();
        assert_eq!(
            session,
            PortalSession {
                token: "abc.def".to_string(),
                student_id: Some(77),
                enrollment_id: 1201,
                teaching_type: 2,
            }
        );
    }

    #[test]
    fn login_response_falls_back_to_token_field_and_default_teaching_type() {
        let value = json!({ "token": "t", "Matriculas": [{ "MatriculaId": 5 }] });
        let session = parse_login_response(&value).unwrap();
        assert_eq!(session.token, "t");
        assert_eq!(session.teaching_type, 1);
        assert_eq!(session.student_id, None);
    }

    #[test]
    fn login_response_without_token_or_enrollment_is_upstream_error() {
        let no_token = json!({ "Matriculas": [{ "MatriculaId": 5 }] });
        assert!(matches!(
            parse_login_response(&no_token),
            Err(PortalError::Upstream(_))
        ));
        let no_enrollment = json!({ "TokenLogin": "t", "Matriculas": [] });
        assert!(matches!(
            parse_login_response(&no_enrollment),
            Err(PortalError::Upstream(_))
        ));
    }

    #[test]
    fn challenge_pages_are_detected() {
        let cf = "<!DOCTYPE html><html><head><title>Just a moment...</title></head></html>";
        assert!(looks_like_challenge(StatusCode::FORBIDDEN, cf));
        assert!(looks_like_challenge(StatusCode::OK, cf));
        assert!(looks_like_challenge(StatusCode::SERVICE_UNAVAILABLE, "<html><body>down</body></html>"));
        assert!(looks_like_challenge(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(!looks_like_challenge(StatusCode::OK, r#"{"Faltas":[]}"#));
        assert!(!looks_like_challenge(StatusCode::FORBIDDEN, r#"{"Message":"denied"}"#));
    }

    #[test]
    fn marker_words_inside_record_text_are_not_challenges() {
        let body = r#"{"Comportamentos":[{"Descricao":"Just a moment of distraction, then a captcha joke"}]}"#;
        assert!(!looks_like_challenge(StatusCode::OK, body));
        assert!(check_response(StatusCode::OK, body, "comportamento").is_ok());
        // the same words in a non-JSON page still count
        assert!(looks_like_challenge(StatusCode::OK, "<html>captcha</html>"));
    }

    #[test]
    fn auth_rejection_excludes_challenge_pages() {
        assert!(is_auth_rejection(StatusCode::UNAUTHORIZED, r#"{"Message":"expired"}"#));
        assert!(is_auth_rejection(StatusCode::FORBIDDEN, ""));
        assert!(!is_auth_rejection(StatusCode::FORBIDDEN, "<!DOCTYPE html><html>cf-chl</html>"));
        assert!(!is_auth_rejection(StatusCode::INTERNAL_SERVER_ERROR, "{}"));
    }

    #[test]
    fn response_classification() {
        assert!(check_response(StatusCode::OK, "{}", "x").is_ok());
        assert!(matches!(
            check_response(StatusCode::UNAUTHORIZED, "{}", "x"),
            Err(PortalError::Upstream(_))
        ));
        assert!(check_response(StatusCode::FORBIDDEN, "<html>captcha</html>", "x")
            .unwrap_err()
            .is_blocked());
        assert!(matches!(
            check_response(StatusCode::INTERNAL_SERVER_ERROR, "oops", "x"),
            Err(PortalError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn fixture_client_serves_sample_records() {
        let client =
            FixturePortalClient::from_path(workspace_root().join("fixtures/portal/sample.json")).unwrap();
        let absences = client.fetch(EventType::Absence).await.unwrap();
        let alerts = client.fetch(EventType::BehaviorAlert).await.unwrap();
        assert_eq!(absences.len(), 3);
        assert_eq!(alerts.len(), 1);
        for raw in &absences {
            normalize_record(EventType::Absence, raw).unwrap();
        }
        normalize_record(EventType::BehaviorAlert, &alerts[0]).unwrap();
    }
}
