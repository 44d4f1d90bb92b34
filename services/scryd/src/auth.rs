use crate::config::Credentials;
use crate::errdefs::ServiceError;
use flint::time::timestamp_secs;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_derive::{Deserialize, Serialize};

/// How long an issued token stays valid.
const TOKEN_LIFETIME_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    protocol: String,
    host: String,
    #[serde(default)]
    username: String,
    password: String,
    exp: u64,
}

/// Issues and verifies the HMAC-signed tokens that carry connection
/// credentials between the login endpoint and the WebSocket upgrade.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
}

impl TokenAuthority {
    /// Creates an authority from the configured secret and algorithm name.
    /// Only the HMAC family is supported.
    pub fn new(secret: &str, algorithm: &str) -> Result<TokenAuthority, ServiceError> {
        let algorithm: Algorithm = algorithm
            .parse()
            .map_err(|_| ServiceError::Config(format!("unknown jwt algorithm {:?}", algorithm)))?;
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => (),
            _ => {
                return Err(ServiceError::Config(format!(
                    "jwt algorithm {:?} is not an HMAC algorithm",
                    algorithm
                )))
            }
        }

        Ok(TokenAuthority {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
        })
    }

    /// Signs the credential quadruple into an opaque token.
    pub fn issue(&self, creds: &Credentials) -> Result<String, ServiceError> {
        let claims = Claims {
            protocol: creds.protocol.clone(),
            host: creds.host.clone(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            exp: timestamp_secs() + TOKEN_LIFETIME_SECS,
        };
        Ok(encode(&Header::new(self.algorithm), &claims, &self.encoding)?)
    }

    /// Validates a token and extracts the credentials it carries.
    pub fn verify(&self, token: &str) -> Result<Credentials, ServiceError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(self.algorithm))?;
        Ok(Credentials {
            protocol: data.claims.protocol,
            host: data.claims.host,
            username: data.claims.username,
            password: data.claims.password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            protocol: "vnc".into(),
            host: "10.1.2.3:5901".into(),
            username: "operator".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let authority = TokenAuthority::new("secret", "HS256").unwrap();
        let token = authority.issue(&creds()).unwrap();
        let verified = authority.verify(&token).unwrap();
        assert_eq!(verified.protocol, "vnc");
        assert_eq!(verified.host, "10.1.2.3:5901");
        assert_eq!(verified.username, "operator");
        assert_eq!(verified.password, "hunter2");
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let issuer = TokenAuthority::new("secret-a", "HS256").unwrap();
        let verifier = TokenAuthority::new("secret-b", "HS256").unwrap();
        let token = issuer.issue(&creds()).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let authority = TokenAuthority::new("secret", "HS512").unwrap();
        assert!(authority.verify("not-a-token").is_err());
    }

    #[test]
    fn test_non_hmac_algorithms_are_refused() {
        assert!(TokenAuthority::new("secret", "RS256").is_err());
        assert!(TokenAuthority::new("secret", "bogus").is_err());
    }
}
