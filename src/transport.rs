//! Delivery of issued tokens to clients.
//!
//! The session token only ever travels in the session cookie and the identity
//! token only ever travels in the response body.

use serde::{Deserialize, Serialize};

use crate::config::IssuerConfig;
use crate::issuer::IssuedTokens;

/// Successful result envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceData<T> {
    pub result: T,
}

/// Body returned next to the session cookie.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenResponse {
    pub id_token: String,
}

/// Error body. Carries no internal detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub fn server_error(desc: &str) -> Self {
        Self {
            error: "server_error".to_string(),
            error_description: Some(desc.to_string()),
        }
    }
}

/// Transport-ready response.
#[derive(Debug, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_cookie: Option<String>,
    pub body: String,
}

/// Build the `Set-Cookie` value carrying the session token.
pub fn session_cookie(config: &IssuerConfig, session_token: &str) -> String {
    let mut cookie = format!("{}={}", config.session_cookie_name, session_token);

    cookie.push_str(&format!("; Path={}", config.mounted_path));

    if config.force_ssl {
        cookie.push_str("; Secure");
    }

    cookie.push_str("; HttpOnly; SameSite=Strict");

    cookie
}

/// Extract the session token from a `Cookie` request header.
pub fn parse_session_cookie(config: &IssuerConfig, cookie_header: &str) -> Option<String> {
    let prefix = format!("{}=", config.session_cookie_name);
    cookie_header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix(prefix.as_str()))
        .filter(|value| !value.is_empty())
        .map(String::from)
}

/// Response for a successful issuance: 201, session cookie, id token body.
pub fn issue_response(config: &IssuerConfig, tokens: &IssuedTokens) -> serde_json::Result<HttpResponse> {
    identity_response(config, 201, Some(&tokens.session.token), &tokens.identity.token)
}

/// Response for an identity refresh: 200 and the id token body, no cookie.
pub fn refresh_response(config: &IssuerConfig, identity_token: &str) -> serde_json::Result<HttpResponse> {
    identity_response(config, 200, None, identity_token)
}

fn identity_response(
    config: &IssuerConfig,
    status: u16,
    session_token: Option<&str>,
    identity_token: &str,
) -> serde_json::Result<HttpResponse> {
    let body = serde_json::to_string(&ServiceData {
        result: IdTokenResponse {
            id_token: identity_token.to_string(),
        },
    })?;

    Ok(HttpResponse {
        status,
        set_cookie: session_token.map(|token| session_cookie(config, token)),
        body,
    })
}

/// Response for an aborted issuance. Every `IssueError` maps to this same
/// unavailable-service body; the cause is only logged by the issuer.
pub fn error_response() -> HttpResponse {
    let body = serde_json::to_string(&ErrorResponse::server_error("Service unavailable"))
        .unwrap_or_else(|_| r#"{"error":"server_error"}"#.to_string());
    HttpResponse {
        status: 503,
        set_cookie: None,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{IdentityClaims, SessionClaims, SignedIdentity, SignedSession};

    fn tokens() -> IssuedTokens {
        IssuedTokens {
            session: SignedSession {
                token: "session.jwt.sig".to_string(),
                claims: SessionClaims {
                    iss: "https://authn.example.com".to_string(),
                    aud: "https://authn.example.com".to_string(),
                    sub: "12345".to_string(),
                    rid: "ab".repeat(16),
                    iat: 0,
                    exp: 100,
                },
            },
            identity: SignedIdentity {
                token: "identity.jwt.sig".to_string(),
                claims: IdentityClaims {
                    iss: "https://authn.example.com".to_string(),
                    aud: "https://authn.example.com".to_string(),
                    sub: "12345".to_string(),
                    iat: 0,
                    exp: 10,
                    auth_time: 0,
                    jti: "jti".to_string(),
                },
            },
        }
    }

    #[test]
    fn test_session_cookie_attributes() {
        let mut config = IssuerConfig {
            mounted_path: "/authn".to_string(),
            ..Default::default()
        };
        assert_eq!(
            session_cookie(&config, "tok"),
            "authn=tok; Path=/authn; Secure; HttpOnly; SameSite=Strict"
        );

        config.force_ssl = false;
        assert!(!session_cookie(&config, "tok").contains("Secure"));
    }

    #[test]
    fn test_parse_session_cookie() {
        let config = IssuerConfig::default();
        assert_eq!(
            parse_session_cookie(&config, "theme=dark; authn=a.b.c; other=1"),
            Some("a.b.c".to_string())
        );
        assert_eq!(parse_session_cookie(&config, "authnx=a.b.c"), None);
        assert_eq!(parse_session_cookie(&config, "authn="), None);
        assert_eq!(parse_session_cookie(&config, ""), None);
    }

    #[test]
    fn test_issue_response_separates_tokens() {
        let config = IssuerConfig::default();
        let response = issue_response(&config, &tokens()).unwrap();

        assert_eq!(response.status, 201);
        let cookie = response.set_cookie.unwrap();
        assert!(cookie.starts_with("authn=session.jwt.sig;"));
        assert!(!cookie.contains("identity.jwt.sig"));

        assert_eq!(response.body, r#"{"result":{"id_token":"identity.jwt.sig"}}"#);
        assert!(!response.body.contains("session.jwt.sig"));

        let parsed: ServiceData<IdTokenResponse> = serde_json::from_str(&response.body).unwrap();
        assert_eq!(parsed.result.id_token, "identity.jwt.sig");
    }

    #[test]
    fn test_refresh_response_has_no_cookie() {
        let config = IssuerConfig::default();
        let response = refresh_response(&config, "identity.jwt.sig").unwrap();
        assert_eq!(response.status, 200);
        assert!(response.set_cookie.is_none());
    }

    #[test]
    fn test_error_response_hides_detail() {
        let response = error_response();
        assert_eq!(response.status, 503);
        assert!(response.set_cookie.is_none());

        let body: ErrorResponse = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body.error, "server_error");
        assert_eq!(body.error_description.as_deref(), Some("Service unavailable"));
    }
}
