use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{cipher::Address, lifecycle::SecretError, AppState};

// ── Response shape ───────────────────────────────────────────────────────────

/// Wire form of a secret, shared by create and retrieve. The struct name is
/// the XML root element.
#[derive(Debug, Serialize)]
#[serde(rename = "Secret", rename_all = "camelCase")]
pub struct SecretResponse {
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub hash: String,
    pub remaining_views: u32,
    pub secret_text: String,
}

/// RFC 3339, UTC, millisecond precision: `2020-02-01T10:10:10.000Z`.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Media types a secret can be rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Xml,
}

/// The first supported type listed in `Accept` wins; anything else gets JSON.
fn negotiate(headers: &HeaderMap) -> Format {
    let Some(accept) = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
    else {
        return Format::Json;
    };
    for media in accept.split(',') {
        let media = media.split(';').next().unwrap_or_default().trim();
        match media {
            "application/json" => return Format::Json,
            "application/xml" => return Format::Xml,
            _ => {}
        }
    }
    Format::Json
}

fn render(format: Format, body: &SecretResponse) -> Response {
    match format {
        Format::Json => Json(body).into_response(),
        Format::Xml => match quick_xml::se::to_string(body) {
            Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
            Err(e) => internal_error(SecretError::Misconfigured(format!("xml encoding: {e}"))),
        },
    }
}

fn unavailable() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": SecretError::SecretUnavailable.to_string()})),
    )
        .into_response()
}

fn rejected(reason: String) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": reason })),
    )
        .into_response()
}

fn internal_error(e: SecretError) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Redirects ─────────────────────────────────────────────────────────────────

fn redirect_to(target: Option<&str>) -> Response {
    match target {
        Some(url) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, url.to_owned())])
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn redirect_root(State(state): State<AppState>) -> Response {
    redirect_to(state.redirects.root.as_deref())
}

pub async fn redirect_api(State(state): State<AppState>) -> Response {
    redirect_to(state.redirects.api.as_deref())
}

// ── Create ────────────────────────────────────────────────────────────────────

/// Form fields are kept as text so bad numbers get a readable rejection.
#[derive(Debug, Default, Deserialize)]
pub struct CreateForm {
    #[serde(default)]
    pub secret: String,
    #[serde(default, rename = "expireAfterViews")]
    pub expire_after_views: String,
    /// Minutes; zero or less never expires.
    #[serde(default, rename = "expireAfter")]
    pub expire_after: String,
}

fn parse_field(name: &str, raw: &str) -> Result<i64, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("invalid {name} value {raw:?}"))
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<CreateForm>,
) -> Response {
    let views = match parse_field("expireAfterViews", &form.expire_after_views) {
        Ok(v) => v,
        Err(reason) => return rejected(reason),
    };
    let ttl_minutes = match parse_field("expireAfter", &form.expire_after) {
        Ok(v) => v,
        Err(reason) => return rejected(reason),
    };

    match state.lifecycle.create(&form.secret, views, ttl_minutes).await {
        Ok(created) => {
            info!(
                remaining_views = created.remaining_views,
                ttl_minutes, "audit: secret.create"
            );
            render(
                negotiate(&headers),
                &SecretResponse {
                    created_at: timestamp(created.created_at),
                    expires_at: created.expires_at.map(timestamp),
                    hash: created.address.as_str().to_owned(),
                    remaining_views: created.remaining_views,
                    secret_text: created.plaintext,
                },
            )
        }
        Err(SecretError::InvalidRequest(reason)) => rejected(reason),
        Err(SecretError::SecretUnavailable) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "secret could not be stored"})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Retrieve ──────────────────────────────────────────────────────────────────

pub async fn get_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
) -> Response {
    let address = Address::new(hash);
    match state.lifecycle.retrieve(&address).await {
        Ok(revealed) => {
            info!(
                remaining_views = revealed.remaining_views,
                "audit: secret.read"
            );
            render(
                negotiate(&headers),
                &SecretResponse {
                    created_at: timestamp(revealed.created_at),
                    expires_at: revealed.expires_at.map(timestamp),
                    hash: address.as_str().to_owned(),
                    remaining_views: revealed.remaining_views,
                    secret_text: revealed.plaintext,
                },
            )
        }
        Err(e @ SecretError::Misconfigured(_)) => internal_error(e),
        Err(_) => unavailable(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::to_bytes;
    use axum::http::HeaderValue;
    use serde_json::Value;

    use super::*;
    use crate::cipher::ChaChaCipher;
    use crate::clock::ManualClock;
    use crate::lifecycle::Lifecycle;
    use crate::store::{MemoryStore, SecretRecord, SecretStore, StoreError};
    use crate::Redirects;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2020-02-01T10:10:10Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn state_on(store: Arc<dyn SecretStore>, redirects: Redirects) -> AppState {
        let lifecycle = Lifecycle::new(
            store,
            Arc::new(ChaChaCipher::new()),
            Arc::new(ManualClock::new(t0())),
        )
        .unwrap();
        AppState {
            lifecycle,
            redirects,
        }
    }

    fn state_with(redirects: Redirects) -> AppState {
        state_on(Arc::new(MemoryStore::new()), redirects)
    }

    fn state() -> AppState {
        state_with(Redirects::default())
    }

    fn form(secret: &str, views: &str, ttl: &str) -> Form<CreateForm> {
        Form(CreateForm {
            secret: secret.into(),
            expire_after_views: views.into(),
            expire_after: ttl.into(),
        })
    }

    fn accepting(accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(accept).unwrap());
        headers
    }

    async fn post(st: &AppState, f: Form<CreateForm>) -> Response {
        create_secret(State(st.clone()), HeaderMap::new(), f).await
    }

    async fn read(st: &AppState, hash: &str) -> Response {
        get_secret(State(st.clone()), HeaderMap::new(), Path(hash.to_owned())).await
    }

    async fn body_text(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    /// Accepts reads but refuses every write.
    struct ReadOnlyStore;

    impl SecretStore for ReadOnlyStore {
        fn get(&self, _: &Address) -> Result<Option<SecretRecord>, StoreError> {
            Ok(None)
        }

        fn create(&self, _: &Address, _: &SecretRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        fn compare_and_update(
            &self,
            _: &Address,
            _: u64,
            _: &SecretRecord,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        fn delete(&self, _: &Address) -> Result<(), StoreError> {
            Ok(())
        }

        fn prune(&self, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn create_then_read() {
        let st = state();
        let resp = post(&st, form("test_secret", "10", "10")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["createdAt"], "2020-02-01T10:10:10.000Z");
        assert_eq!(created["expiresAt"], "2020-02-01T10:20:10.000Z");
        assert_eq!(created["remainingViews"], 10);
        assert_eq!(created["secretText"], "test_secret");

        let hash = created["hash"].as_str().unwrap().to_owned();
        let resp = read(&st, &hash).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let read = body_json(resp).await;
        assert_eq!(read["hash"], hash.as_str());
        assert_eq!(read["remainingViews"], 9);
        assert_eq!(read["secretText"], "test_secret");
    }

    #[tokio::test]
    async fn infinite_ttl_omits_expiry() {
        let resp = post(&state(), form("test_secret", "10", "0")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert!(created.get("expiresAt").is_none());
    }

    #[tokio::test]
    async fn bad_numbers_are_rejected() {
        for (views, ttl) in [("abc", "10"), ("10", "abc"), ("", "10"), ("0", "10"), ("-3", "0")] {
            let resp = post(&state(), form("s", views, ttl)).await;
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED, "{views}/{ttl}");
            assert!(body_json(resp).await["error"].is_string());
        }
    }

    #[tokio::test]
    async fn store_failure_on_create_is_service_unavailable() {
        let st = state_on(Arc::new(ReadOnlyStore), Redirects::default());
        let resp = post(&st, form("s", "1", "0")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"], "secret could not be stored");
    }

    #[tokio::test]
    async fn spent_secret_is_not_found() {
        let st = state();
        let created = body_json(post(&st, form("once", "1", "0")).await).await;
        let hash = created["hash"].as_str().unwrap().to_owned();

        let resp = read(&st, &hash).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["remainingViews"], 0);

        let resp = read(&st, &hash).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "secret isn't available");
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let resp = read(&state(), "12345").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn xml_when_accept_asks_for_it() {
        let st = state();
        let resp = create_secret(
            State(st.clone()),
            accepting("text/html, application/xml;q=0.9"),
            form("test_secret", "2", "10"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/xml");
        let xml = body_text(resp).await;
        assert!(xml.starts_with("<Secret>"), "{xml}");
        assert!(xml.ends_with("</Secret>"), "{xml}");
        assert!(xml.contains("<createdAt>2020-02-01T10:10:10.000Z</createdAt>"));
        assert!(xml.contains("<expiresAt>2020-02-01T10:20:10.000Z</expiresAt>"));
        assert!(xml.contains("<remainingViews>2</remainingViews>"));
        assert!(xml.contains("<secretText>test_secret</secretText>"));

        let start = xml.find("<hash>").unwrap() + "<hash>".len();
        let end = xml.find("</hash>").unwrap();
        let hash = xml[start..end].to_owned();

        let resp = get_secret(State(st), accepting("application/xml"), Path(hash)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let xml = body_text(resp).await;
        assert!(xml.contains("<remainingViews>1</remainingViews>"));
        assert!(xml.contains("<secretText>test_secret</secretText>"));
    }

    #[tokio::test]
    async fn xml_escapes_secret_text() {
        let resp = create_secret(
            State(state()),
            accepting("application/xml"),
            form("a<b&c", "1", "0"),
        )
        .await;
        let xml = body_text(resp).await;
        assert!(xml.contains("<secretText>a&lt;b&amp;c</secretText>"), "{xml}");
        assert!(!xml.contains("<expiresAt>"));
    }

    #[test]
    fn first_supported_media_type_wins() {
        assert_eq!(negotiate(&HeaderMap::new()), Format::Json);
        assert_eq!(negotiate(&accepting("*/*")), Format::Json);
        assert_eq!(negotiate(&accepting("text/plain")), Format::Json);
        assert_eq!(negotiate(&accepting("application/xml")), Format::Xml);
        assert_eq!(
            negotiate(&accepting("application/json, application/xml")),
            Format::Json
        );
        assert_eq!(
            negotiate(&accepting("text/html,application/xml,application/json")),
            Format::Xml
        );
    }

    #[tokio::test]
    async fn json_is_the_default_media_type() {
        let resp = create_secret(State(state()), accepting("*/*"), form("s", "1", "0")).await;
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(body_json(resp).await["secretText"], "s");
    }

    #[tokio::test]
    async fn redirects_when_configured() {
        let st = state_with(Redirects {
            root: Some("https://example.com/".into()),
            api: None,
        });
        let resp = redirect_root(State(st.clone())).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers()[header::LOCATION], "https://example.com/");

        let resp = redirect_api(State(st)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
