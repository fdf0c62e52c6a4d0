use std::env;
use tracing::warn;

const DEFAULT_ICE_SERVER_URLS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";
const DEFAULT_QUALITY_SAMPLE_INTERVAL_SECS: u64 = 5;
const DEFAULT_VIDEO_IDEAL_WIDTH: u32 = 1280;
const DEFAULT_VIDEO_IDEAL_HEIGHT: u32 = 720;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub consultation_api_url: String,
    pub consultation_api_token: String,
    pub ice_server_urls: Vec<String>,
    pub quality_sample_interval_secs: u64,
    pub video_ideal_width: u32,
    pub video_ideal_height: u32,
}

impl AppConfig {
    /// Reads a `.env` file when one is present, then the process environment.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let config = Self {
            consultation_api_url: env::var("CONSULTATION_API_URL")
                .unwrap_or_else(|_| {
                    warn!("CONSULTATION_API_URL not set, using empty value");
                    String::new()
                }),
            consultation_api_token: env::var("CONSULTATION_API_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("CONSULTATION_API_TOKEN not set, using empty value");
                    String::new()
                }),
            ice_server_urls: parse_url_list(
                &env::var("ICE_SERVER_URLS").unwrap_or_else(|_| {
                    warn!("ICE_SERVER_URLS not set, using public STUN servers");
                    DEFAULT_ICE_SERVER_URLS.to_string()
                }),
            ),
            quality_sample_interval_secs: parse_or_default(
                "QUALITY_SAMPLE_INTERVAL_SECS",
                DEFAULT_QUALITY_SAMPLE_INTERVAL_SECS,
            ),
            video_ideal_width: parse_or_default("VIDEO_IDEAL_WIDTH", DEFAULT_VIDEO_IDEAL_WIDTH),
            video_ideal_height: parse_or_default("VIDEO_IDEAL_HEIGHT", DEFAULT_VIDEO_IDEAL_HEIGHT),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.consultation_api_url.is_empty() && !self.consultation_api_token.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            consultation_api_url: String::new(),
            consultation_api_token: String::new(),
            ice_server_urls: parse_url_list(DEFAULT_ICE_SERVER_URLS),
            quality_sample_interval_secs: DEFAULT_QUALITY_SAMPLE_INTERVAL_SECS,
            video_ideal_width: DEFAULT_VIDEO_IDEAL_WIDTH,
            video_ideal_height: DEFAULT_VIDEO_IDEAL_HEIGHT,
        }
    }
}

fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}

/// Reads a positive number. Missing, malformed and zero values fall back to
/// `default`.
fn parse_or_default<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy + Default + PartialEq,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value != T::default() => value,
            Ok(_) => {
                warn!("{} must be greater than zero, using default {}", key, default);
                default
            }
            Err(_) => {
                warn!("{} has invalid value '{}', using default {}", key, raw, default);
                default
            }
        },
        Err(_) => {
            warn!("{} not set, using default {}", key, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_list_parsing_skips_blanks() {
        let urls = parse_url_list(" stun:a.example:3478, ,turn:b.example:3478 ");
        assert_eq!(urls, vec!["stun:a.example:3478", "turn:b.example:3478"]);
    }

    #[test]
    fn test_default_config_uses_public_stun_and_five_second_sampling() {
        let config = AppConfig::default();
        assert_eq!(config.ice_server_urls.len(), 2);
        assert_eq!(config.quality_sample_interval_secs, 5);
        assert_eq!((config.video_ideal_width, config.video_ideal_height), (1280, 720));
        assert!(!config.is_configured());
    }

    #[test]
    fn test_numeric_values_fall_back_when_zero_or_invalid() {
        env::set_var("TEST_SAMPLE_SECS_ZERO", "0");
        env::set_var("TEST_SAMPLE_SECS_BAD", "five");
        env::set_var("TEST_SAMPLE_SECS_OK", " 12 ");

        assert_eq!(parse_or_default("TEST_SAMPLE_SECS_ZERO", 5u64), 5);
        assert_eq!(parse_or_default("TEST_SAMPLE_SECS_BAD", 5u64), 5);
        assert_eq!(parse_or_default("TEST_SAMPLE_SECS_OK", 5u64), 12);
        assert_eq!(parse_or_default("TEST_SAMPLE_SECS_UNSET", 720u32), 720);
    }

    #[test]
    fn test_is_configured_requires_url_and_token() {
        let mut config = AppConfig::default();
        config.consultation_api_url = "https://api.example.com".to_string();
        assert!(!config.is_configured());

        config.consultation_api_token = "token".to_string();
        assert!(config.is_configured());
    }
}
