//! Registry authentication: challenge parsing and bearer token exchange

use crate::error::handlers::HttpErrorHandler;
use crate::error::{ImportError, Result};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Username and password for a registry or HTTP endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl AuthChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (kind, params_str) = header.split_once(' ').unwrap_or((header, ""));

        if kind.eq_ignore_ascii_case("basic") {
            return Some(AuthChallenge::Basic);
        }
        if !kind.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params_str);
        let realm = params.get("realm")?.to_string();
        Some(AuthChallenge::Bearer {
            realm,
            service: params.get("service").map(|s| s.to_string()),
            scope: params.get("scope").map(|s| s.to_string()),
        })
    }
}

/// Split `key="value",key2="value2"` honouring commas inside quotes
fn parse_params(params_str: &str) -> HashMap<&str, &str> {
    let mut params = HashMap::new();
    let mut rest = params_str.trim();

    while !rest.is_empty() {
        let Some(eq_pos) = rest.find('=') else {
            break;
        };
        let key = rest[..eq_pos].trim().trim_start_matches(',').trim();
        let after = &rest[eq_pos + 1..];

        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            }
        };

        params.insert(key, value);
        rest = remainder.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    params
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Repository actions requested from a token service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessScope {
    Pull,
    #[default]
    PullPush,
}

impl AccessScope {
    pub fn actions(&self) -> &'static str {
        match self {
            AccessScope::Pull => "pull",
            AccessScope::PullPush => "pull,push",
        }
    }

    /// Token scope string for `repository`
    pub fn for_repository(&self, repository: &str) -> String {
        format!("repository:{}:{}", repository, self.actions())
    }
}

/// How requests to the registry are authorized once the challenge is resolved
#[derive(Debug, Clone, Default)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic(Credentials),
    Bearer(String),
}

impl RegistryAuth {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RegistryAuth::Anonymous => request,
            RegistryAuth::Basic(credentials) => {
                request.basic_auth(&credentials.username, Some(&credentials.password))
            }
            RegistryAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Resolve a challenge for `access` to `repository`
    pub async fn from_challenge(
        client: &Client,
        challenge: &AuthChallenge,
        repository: &str,
        access: AccessScope,
        credentials: Option<&Credentials>,
    ) -> Result<Self> {
        match challenge {
            AuthChallenge::Basic => credentials
                .cloned()
                .map(RegistryAuth::Basic)
                .ok_or_else(|| {
                    ImportError::Authentication(
                        "Registry requires basic authentication but no credentials were provided"
                            .to_string(),
                    )
                }),
            AuthChallenge::Bearer { realm, service, .. } => {
                let scope = access.for_repository(repository);
                let token = fetch_token(client, realm, service.as_deref(), &scope, credentials).await?;
                Ok(RegistryAuth::Bearer(token))
            }
        }
    }
}

async fn fetch_token(
    client: &Client,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    credentials: Option<&Credentials>,
) -> Result<String> {
    let mut url = url::Url::parse(realm)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = service {
            query.append_pair("service", service);
        }
        query.append_pair("scope", scope);
    }

    debug!(url = %url, "Requesting registry token");

    let mut request = client.get(url);
    if let Some(credentials) = credentials {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        return Err(HttpErrorHandler::handle_auth_error(status, &error_text));
    }

    let token_response: TokenResponse = response.json().await?;
    token_response
        .token
        .or(token_response.access_token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ImportError::Authentication("Token response contained no token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_scope_commas() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:vi/disk:pull,push""#,
        )
        .unwrap();

        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some("repository:vi/disk:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn parses_basic_and_rejects_unknown() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="Registry Realm""#),
            Some(AuthChallenge::Basic)
        );
        assert_eq!(AuthChallenge::parse("Negotiate abc"), None);
        assert_eq!(AuthChallenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn scope_strings() {
        assert_eq!(AccessScope::Pull.for_repository("vi/disk"), "repository:vi/disk:pull");
        assert_eq!(AccessScope::default().for_repository("vi/disk"), "repository:vi/disk:pull,push");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("user", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
