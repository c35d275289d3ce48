use std::{env, fmt::Display, str::FromStr};

use anyhow::Context;
use tracing::{info, warn};

use crate::models::{Identity, LanguageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    SignedToken,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "token" => Ok(Self::SignedToken),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown identity provider '{other}', expected token or mock")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub allowed_email_domain: String,
    pub identity_provider: ProviderKind,
    pub session_secret: String,
    pub mock_identity: Identity,
    pub fallback_language: LanguageId,
    pub cache_limit: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            max_connections: try_load("DATABASE_MAX_CONNECTIONS", "5")?,
            allowed_email_domain: try_load("ALLOWED_EMAIL_DOMAIN", "students.example.edu")?,
            identity_provider: try_load("IDENTITY_PROVIDER", "token")?,
            session_secret: env::var("SESSION_SECRET").unwrap_or_else(|_| {
                warn!("SESSION_SECRET not set, signed tokens will be rejected");
                String::new()
            }),
            mock_identity: Identity {
                name: try_load("MOCK_IDENTITY_NAME", "Demo Student")?,
                email: try_load("MOCK_IDENTITY_EMAIL", "demo@students.example.edu")?,
                photo_url: env::var("MOCK_IDENTITY_PHOTO").ok(),
            },
            fallback_language: LanguageId::new(try_load::<String>("FALLBACK_LANGUAGE", "python")?),
            cache_limit: try_load("LEADERBOARD_CACHE_LIMIT", "50")?,
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a Postgres instance (or pass --snapshot)")
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow::anyhow!("invalid {key} value '{raw}': {e}")
    })
}
