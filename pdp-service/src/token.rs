//! Bearer token verification
//!
//! Tokens are JWTs signed with a single key advertised at the configured
//! OpenID discovery URL. The key is fetched once at startup through the
//! [`KeyFetcher`] injection point; tests supply a literal key. Verified
//! claims stay a generic JSON tree; the only normalization is accepting
//! both `vc` and its older alias `verifiableCredential`.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::tree;

/// Source of the token verification key
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self) -> Result<(DecodingKey, Algorithm)>;
}

/// Production fetcher: OpenID discovery → JWKS → first key
pub struct OpenIdKeyFetcher {
    http: reqwest::Client,
    issuer: String,
}

impl OpenIdKeyFetcher {
    pub fn new(issuer: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            issuer: issuer.into(),
        })
    }
}

#[async_trait]
impl KeyFetcher for OpenIdKeyFetcher {
    async fn fetch(&self) -> Result<(DecodingKey, Algorithm)> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        );
        let discovery: Value = self
            .http
            .get(&discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let jwks_uri = discovery["jwks_uri"].as_str().ok_or_else(|| {
            GatewayError::Internal(format!("{discovery_url} carries no jwks_uri"))
        })?;

        let jwks: jsonwebtoken::jwk::JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let jwk = jwks
            .keys
            .first()
            .ok_or_else(|| GatewayError::Internal(format!("{jwks_uri} returned an empty JWKS")))?;

        let key = DecodingKey::from_jwk(jwk)
            .map_err(|e| GatewayError::Internal(format!("unusable JWK: {e}")))?;
        let algorithm = jwk
            .common
            .key_algorithm
            .and_then(|a| a.to_string().parse::<Algorithm>().ok())
            .unwrap_or(Algorithm::RS256);

        tracing::info!(issuer = %self.issuer, ?algorithm, "token verification key loaded");
        Ok((key, algorithm))
    }
}

/// Verifies bearer tokens and exposes their claims as a JSON tree
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier from a literal key
    pub fn new(key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        // Claims shape varies per issuer; expiry is the contract here.
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());
        Self { key, validation }
    }

    /// Build a verifier by fetching the key once
    pub async fn from_fetcher(fetcher: &dyn KeyFetcher) -> Result<Self> {
        let (key, algorithm) = fetcher.fetch().await?;
        Ok(Self::new(key, algorithm))
    }

    /// Verify an `Authorization` header value
    ///
    /// An absent header yields empty claims and no error; a present but
    /// malformed, badly signed or expired token is `invalid-token`.
    pub fn verify(&self, authorization: Option<&str>) -> Result<Value> {
        let Some(raw) = authorization else {
            return Ok(Value::Object(Default::default()));
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Default::default()));
        }

        let token = raw.strip_prefix("Bearer ").ok_or_else(|| {
            GatewayError::InvalidToken("Authorization header is not a bearer token".into())
        })?;

        let data = decode::<Value>(token, &self.key, &self.validation)
            .map_err(|e| GatewayError::InvalidToken(e.to_string()))?;
        Ok(data.claims)
    }
}

/// The verifiable credential inside the claims, under either spelling
pub fn credential(claims: &Value) -> Option<&Value> {
    claims.get("vc").or_else(|| claims.get("verifiableCredential"))
}

/// Whether the claims are non-empty, i.e. a token was presented and held
pub fn is_authenticated(claims: &Value) -> bool {
    match claims {
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

/// Mandate field under `credentialSubject.mandate`, as a string
fn mandator_field(claims: &Value, field: &str) -> String {
    let Some(vc) = credential(claims) else {
        return String::new();
    };
    tree::lookup_string(vc, &format!("credentialSubject.mandate.mandator.{field}"))
}

/// Caller's organization identifier from the mandate
pub fn organization_identifier(claims: &Value) -> String {
    mandator_field(claims, "organizationIdentifier")
}

/// Caller's two-letter country code from the mandate
pub fn country(claims: &Value) -> String {
    mandator_field(claims, "country")
}

/// Whether the credential carries the marketplace onboarding power
///
/// True iff any `credentialSubject.mandate.power[*]` entry has
/// `type=Domain`, `domain=DOME`, `function=Onboarding`, `action=execute`,
/// case-insensitive, under bare or legacy `tmf_`-prefixed key spellings.
pub fn is_lear(claims: &Value) -> bool {
    let Some(vc) = credential(claims) else {
        return false;
    };
    let Ok(Some(Value::Array(powers))) = tree::lookup(vc, "credentialSubject.mandate.power")
    else {
        return false;
    };
    powers.iter().any(|p| {
        power_field_is(p, "type", "Domain")
            && power_field_is(p, "domain", "DOME")
            && power_field_is(p, "function", "Onboarding")
            && power_field_is(p, "action", "execute")
    })
}

/// Match one power field under both spellings; the value may be a scalar
/// or a list containing the wanted value
fn power_field_is(power: &Value, field: &str, wanted: &str) -> bool {
    let value = power
        .get(field)
        .or_else(|| power.get(format!("tmf_{field}")));
    match value {
        Some(Value::String(s)) => s.eq_ignore_ascii_case(wanted),
        Some(Value::Array(items)) => items
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s.eq_ignore_ascii_case(wanted))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"unit-test-secret";

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(DecodingKey::from_secret(SECRET), Algorithm::HS256)
    }

    fn sign(claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn mandate_claims(org: &str, country: &str, powers: Value) -> Value {
        json!({
            "exp": chrono::Utc::now().timestamp() + 600,
            "vc": {
                "credentialSubject": {
                    "mandate": {
                        "mandator": {
                            "organizationIdentifier": org,
                            "country": country
                        },
                        "power": powers
                    }
                }
            }
        })
    }

    #[test]
    fn test_absent_header_is_empty_claims() {
        let claims = verifier().verify(None).unwrap();
        assert!(!is_authenticated(&claims));
        let claims = verifier().verify(Some("")).unwrap();
        assert!(!is_authenticated(&claims));
    }

    #[test]
    fn test_malformed_header_is_invalid_token() {
        let err = verifier().verify(Some("Basic dXNlcg==")).unwrap_err();
        assert_eq!(err.code(), "invalid-token");
        let err = verifier().verify(Some("Bearer not.a.jwt")).unwrap_err();
        assert_eq!(err.code(), "invalid-token");
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let mut claims = mandate_claims("did:elsi:A", "ES", json!([]));
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 600);
        let header = format!("Bearer {}", sign(&claims));
        let err = verifier().verify(Some(&header)).unwrap_err();
        assert_eq!(err.code(), "invalid-token");
    }

    #[test]
    fn test_valid_token_round_trips_claims() {
        let claims = mandate_claims("did:elsi:VATES-1", "ES", json!([]));
        let header = format!("Bearer {}", sign(&claims));
        let got = verifier().verify(Some(&header)).unwrap();
        assert!(is_authenticated(&got));
        assert_eq!(organization_identifier(&got), "did:elsi:VATES-1");
        assert_eq!(country(&got), "ES");
    }

    #[test]
    fn test_verifiable_credential_alias() {
        let mut claims = mandate_claims("did:elsi:A", "DE", json!([]));
        let vc = claims["vc"].take();
        claims["verifiableCredential"] = vc;
        claims.as_object_mut().unwrap().remove("vc");
        let header = format!("Bearer {}", sign(&claims));
        let got = verifier().verify(Some(&header)).unwrap();
        assert_eq!(organization_identifier(&got), "did:elsi:A");
    }

    #[tokio::test]
    async fn test_openid_fetcher_follows_discovery() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // RFC 7517 appendix A.1 RSA public key.
        let jwk = json!({
            "kty": "RSA",
            "alg": "RS256",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB"
        });

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwks_uri": format!("{}/keys", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": [jwk]})))
            .mount(&server)
            .await;

        let fetcher = OpenIdKeyFetcher::new(server.uri()).unwrap();
        let (_key, algorithm) = fetcher.fetch().await.unwrap();
        assert_eq!(algorithm, Algorithm::RS256);
    }

    #[tokio::test]
    async fn test_openid_fetcher_empty_jwks_fails() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jwks_uri": format!("{}/keys", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
            .mount(&server)
            .await;

        let fetcher = OpenIdKeyFetcher::new(server.uri()).unwrap();
        assert!(fetcher.fetch().await.is_err());
    }

    #[test]
    fn test_is_lear_variants() {
        let onboarding = json!([{
            "type": "Domain", "domain": "DOME",
            "function": "Onboarding", "action": "execute"
        }]);
        assert!(is_lear(&mandate_claims("o", "ES", onboarding)));

        // Legacy tmf_ prefix, mixed case, action as a list.
        let legacy = json!([{
            "tmf_type": "domain", "tmf_domain": "dome",
            "tmf_function": "onboarding", "tmf_action": ["Execute", "read"]
        }]);
        assert!(is_lear(&mandate_claims("o", "ES", legacy)));

        let wrong_domain = json!([{
            "type": "Domain", "domain": "OTHER",
            "function": "Onboarding", "action": "execute"
        }]);
        assert!(!is_lear(&mandate_claims("o", "ES", wrong_domain)));
        assert!(!is_lear(&mandate_claims("o", "ES", json!([]))));
        assert!(!is_lear(&json!({})));
    }
}
