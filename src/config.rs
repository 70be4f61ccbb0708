use std::env;
use std::time::Duration;

use crate::types::ScoringVariant;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ROOM_TTL_SECS: u64 = 600;
const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_STATIC_DIR: &str = "public";

/// Server configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Passphrase for the admin channel; unset disables it.
    pub admin_password: Option<String>,
    pub shuffle_answers: bool,
    pub scoring: ScoringVariant,
    /// How long a finished room lingers before it is reaped.
    pub room_ttl: Duration,
    pub static_dir: String,
    pub ai: Option<AiConfig>,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let admin_password = env::var("ADMIN_PASSWORD")
            .ok()
            .filter(|v| !v.is_empty());

        let shuffle_answers = env::var("SHUFFLE_ANSWERS")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let scoring = match env::var("SCORING_VARIANT").as_deref() {
            Ok("flat-bonus") => ScoringVariant::FlatBonus,
            _ => ScoringVariant::TimeDecay,
        };

        let room_ttl = Duration::from_secs(
            env::var("ROOM_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_ROOM_TTL_SECS),
        );

        let static_dir =
            env::var("STATIC_DIR").unwrap_or_else(|_| DEFAULT_STATIC_DIR.to_string());

        let ai = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|api_key| AiConfig {
                api_key,
                base_url: env::var("AI_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_AI_BASE_URL.to_string()),
                model: env::var("AI_MODEL").unwrap_or_else(|_| DEFAULT_AI_MODEL.to_string()),
            });

        Self {
            port,
            admin_password,
            shuffle_answers,
            scoring,
            room_ttl,
            static_dir,
            ai,
        }
    }
}
