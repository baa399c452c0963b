use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::warn;

/// Who is painting, as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
    /// Balance held by the identity service, used to seed the rate ledger.
    pub credits: Option<u64>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            credits: None,
        }
    }
}

/// Resolves an opaque bearer token to an identity. `Ok(None)` means the token is unknown.
pub trait IdentityProvider: Send + Sync + 'static {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<Identity>, String>>;
}

/// Fixed token table, configured with `DEV_TOKENS="token=user:name:credits;..."`.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn parse(table: &str) -> Self {
        let mut provider = Self::new();
        for raw in table.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let Some((token, rest)) = raw.split_once('=') else {
                warn!(entry = raw, "ignoring DEV_TOKENS entry without '='");
                continue;
            };
            let mut parts = rest.split(':');
            let user_id = parts.next().map(str::trim).unwrap_or_default();
            if token.trim().is_empty() || user_id.is_empty() {
                warn!(entry = raw, "ignoring DEV_TOKENS entry with empty token or user");
                continue;
            }
            let display_name = parts
                .next()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_owned);
            let credits = parts.next().and_then(|value| value.trim().parse::<u64>().ok());
            provider.tokens.insert(
                token.trim().to_owned(),
                Identity {
                    user_id: user_id.to_owned(),
                    display_name,
                    credits,
                },
            );
        }
        provider
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<Identity>, String>> {
        let identity = self.tokens.get(token).cloned();
        Box::pin(async move { Ok(identity) })
    }
}

#[derive(Debug, Deserialize)]
struct AuthMeResponse {
    #[serde(default)]
    success: bool,
    data: Option<AuthMeData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthMeData {
    user_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credits: Option<u64>,
}

/// Asks the external auth service (`GET {base}/auth/me`) who owns a token.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    me_url: String,
}

impl HttpIdentityProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            me_url: format!("{}/auth/me", base_url.trim_end_matches('/')),
        }
    }
}

impl IdentityProvider for HttpIdentityProvider {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Option<Identity>, String>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.me_url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| format!("identity request failed: {e}"))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(format!("identity service returned {status}"));
            }

            let body: AuthMeResponse = response
                .json()
                .await
                .map_err(|e| format!("identity response was not valid JSON: {e}"))?;
            if !body.success {
                return Ok(None);
            }
            Ok(body.data.map(|data| Identity {
                user_id: data.user_id,
                display_name: data.username,
                credits: data.credits,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::get};
    use serde_json::json;

    use super::{HttpIdentityProvider, Identity, IdentityProvider, StaticIdentityProvider};

    #[test]
    fn parses_dev_token_table() {
        let provider =
            StaticIdentityProvider::parse("tok-a=alice:Alice:5; tok-b=bob ;broken;=nobody:x;tok-c=:c");
        assert_eq!(provider.len(), 2);
    }

    #[tokio::test]
    async fn static_provider_resolves_known_tokens() {
        let provider = StaticIdentityProvider::parse("tok-a=alice:Alice:5;tok-b=bob");
        let alice = provider.resolve("tok-a").await.expect("resolve");
        assert_eq!(
            alice,
            Some(Identity {
                user_id: "alice".to_owned(),
                display_name: Some("Alice".to_owned()),
                credits: Some(5),
            })
        );
        let bob = provider.resolve("tok-b").await.expect("resolve");
        assert_eq!(bob, Some(Identity::new("bob")));
        assert_eq!(provider.resolve("nope").await.expect("resolve"), None);
    }

    async fn spawn_auth_service() -> String {
        let app = Router::new().route(
            "/auth/me",
            get(|headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    == Some("Bearer good");
                if !authorized {
                    return (StatusCode::UNAUTHORIZED, Json(json!({ "success": false })));
                }
                (
                    StatusCode::OK,
                    Json(json!({
                        "success": true,
                        "data": { "userId": "u-1", "username": "Ana", "credits": 12 }
                    })),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind auth listener");
        let addr = listener.local_addr().expect("auth addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve auth");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_provider_maps_auth_me_response() {
        let base = spawn_auth_service().await;
        let provider = HttpIdentityProvider::new(reqwest::Client::new(), &format!("{base}/"));

        let identity = provider.resolve("good").await.expect("resolve");
        assert_eq!(
            identity,
            Some(Identity {
                user_id: "u-1".to_owned(),
                display_name: Some("Ana".to_owned()),
                credits: Some(12),
            })
        );
        assert_eq!(provider.resolve("bad").await.expect("resolve"), None);
    }

    #[tokio::test]
    async fn http_provider_reports_unreachable_service() {
        let provider = HttpIdentityProvider::new(reqwest::Client::new(), "http://127.0.0.1:1");
        assert!(provider.resolve("good").await.is_err());
    }
}
