use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::watch;

use crate::error::QuizError;
use crate::models::Identity;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_DURATION_SECS: i64 = 12 * 3600;

/// Verifies credentials handed over by the sign-in front end.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, credential: &str) -> Result<Identity, QuizError>;

    async fn sign_out(&self, identity: &Identity);
}

/// Always signs in as one configured identity.
pub struct MockIdentityProvider {
    identity: Identity,
}

impl MockIdentityProvider {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn sign_in(&self, _credential: &str) -> Result<Identity, QuizError> {
        Ok(self.identity.clone())
    }

    async fn sign_out(&self, identity: &Identity) {
        tracing::debug!(email = %identity.email, "mock sign-out");
    }
}

/// Accepts identity tokens of the form `email|name|photo|expiry|signature`,
/// signed with HMAC-SHA256 over everything before the signature.
pub struct SignedTokenProvider {
    secret: String,
}

impl SignedTokenProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, identity: &Identity) -> Result<String, QuizError> {
        if self.secret.is_empty() {
            return Err(QuizError::InvalidCredential(
                "SESSION_SECRET is not configured".to_string(),
            ));
        }
        let expiry = chrono::Utc::now().timestamp() + TOKEN_DURATION_SECS;
        issue_token(identity, &self.secret, expiry)
    }
}

#[async_trait]
impl IdentityProvider for SignedTokenProvider {
    async fn sign_in(&self, credential: &str) -> Result<Identity, QuizError> {
        if self.secret.is_empty() {
            return Err(QuizError::InvalidCredential(
                "SESSION_SECRET is not configured".to_string(),
            ));
        }
        verify_token(credential.trim(), &self.secret)
    }

    async fn sign_out(&self, identity: &Identity) {
        tracing::info!(email = %identity.email, "signed out");
    }
}

pub fn issue_token(identity: &Identity, secret: &str, expiry: i64) -> Result<String, QuizError> {
    let photo = identity.photo_url.as_deref().unwrap_or_default();
    if [identity.email.as_str(), identity.name.as_str(), photo]
        .iter()
        .any(|field| field.contains('|'))
    {
        return Err(QuizError::InvalidCredential(
            "identity fields may not contain '|'".to_string(),
        ));
    }

    let payload = format!("{}|{}|{}|{expiry}", identity.email, identity.name, photo);
    let sig = sign(&payload, secret)?;
    Ok(format!("{payload}|{sig}"))
}

fn verify_token(token: &str, secret: &str) -> Result<Identity, QuizError> {
    let parts: Vec<&str> = token.split('|').collect();
    let [email, name, photo, expiry, sig] = parts.as_slice() else {
        return Err(QuizError::InvalidCredential("malformed token".to_string()));
    };

    let payload = format!("{email}|{name}|{photo}|{expiry}");
    if !constant_time_eq(sig.as_bytes(), sign(&payload, secret)?.as_bytes()) {
        return Err(QuizError::InvalidCredential("bad signature".to_string()));
    }

    let expiry: i64 = expiry
        .parse()
        .map_err(|_| QuizError::InvalidCredential("malformed expiry".to_string()))?;
    if chrono::Utc::now().timestamp() > expiry {
        return Err(QuizError::InvalidCredential("token expired".to_string()));
    }

    Ok(Identity {
        name: name.to_string(),
        email: email.to_string(),
        photo_url: Some(photo.to_string()).filter(|photo| !photo.is_empty()),
    })
}

fn sign(payload: &str, secret: &str) -> Result<String, QuizError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| QuizError::InvalidCredential(err.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// The signed-in user for the lifetime of one command. Created at start,
/// cleared on sign-out; observers follow changes through [`Session::subscribe`].
pub struct Session {
    provider: Box<dyn IdentityProvider>,
    allowed_domain: String,
    current: watch::Sender<Option<Identity>>,
}

impl Session {
    pub fn start(provider: Box<dyn IdentityProvider>, allowed_domain: impl Into<String>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            provider,
            allowed_domain: allowed_domain.into().trim().to_ascii_lowercase(),
            current,
        }
    }

    /// Signs in and enforces the allowed email domain. An identity from any
    /// other domain is signed out again before the error is returned.
    pub async fn sign_in(&self, credential: &str) -> Result<Identity, QuizError> {
        let identity = self.provider.sign_in(credential).await?;

        let domain_ok = identity
            .email_domain()
            .is_some_and(|domain| domain.eq_ignore_ascii_case(&self.allowed_domain));
        if !domain_ok {
            self.provider.sign_out(&identity).await;
            self.current.send_replace(None);
            tracing::warn!(
                email = %identity.email,
                domain = %self.allowed_domain,
                "sign-in outside allowed domain"
            );
            return Err(QuizError::IdentityDomainRejected {
                email: identity.email,
                domain: self.allowed_domain.clone(),
            });
        }

        tracing::info!(email = %identity.email, "signed in");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    pub async fn sign_out(&self) {
        if let Some(identity) = self.current.send_replace(None) {
            self.provider.sign_out(&identity).await;
        }
    }

    pub fn current(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}
