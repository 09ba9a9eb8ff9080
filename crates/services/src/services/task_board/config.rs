use std::{env, time::Duration};

use thiserror::Error;
use url::Url;
use utils::ws::derive_ws_url;

const DEFAULT_FETCH_PAGE_SIZE: u32 = 100;
const DEFAULT_REVEAL_PAGE_SIZE: usize = 50;
const DEFAULT_REVEAL_STEP: usize = 25;
const DEFAULT_MOBILE_PAGE_SIZE: usize = 20;
const DEFAULT_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable `{0}` is not set")]
    MissingEnv(&'static str),
    #[error("environment variable `{0}` has an invalid value")]
    InvalidEnv(&'static str),
}

/// Engine knobs that do not depend on where the service lives.
#[derive(Debug, Clone)]
pub struct BoardSettings {
    /// Page size used by the paginated fallback retrieval.
    pub fetch_page_size: u32,
    /// Rows revealed per tier right after a filter or sort change.
    pub reveal_page_size: usize,
    /// Rows added to a tier per proximity signal.
    pub reveal_step: usize,
    /// Page size of the flat, numbered presentation.
    pub mobile_page_size: usize,
    pub debounce: Duration,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            fetch_page_size: DEFAULT_FETCH_PAGE_SIZE,
            reveal_page_size: DEFAULT_REVEAL_PAGE_SIZE,
            reveal_step: DEFAULT_REVEAL_STEP,
            mobile_page_size: DEFAULT_MOBILE_PAGE_SIZE,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub api_base: Url,
    pub websocket_base: Url,
    pub bearer_token: Option<String>,
    pub settings: BoardSettings,
}

impl BoardConfig {
    pub fn new(api_base: Url) -> Result<Self, ConfigError> {
        let websocket_base = derive_ws_url(api_base.clone())
            .map_err(|_| ConfigError::InvalidEnv("TASK_BOARD_API_BASE"))?;

        Ok(Self {
            api_base,
            websocket_base,
            bearer_token: None,
            settings: BoardSettings::default(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base: Url = env::var("TASK_BOARD_API_BASE")
            .map_err(|_| ConfigError::MissingEnv("TASK_BOARD_API_BASE"))?
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv("TASK_BOARD_API_BASE"))?;

        let mut config = Self::new(api_base)?;

        if let Ok(raw) = env::var("TASK_BOARD_WS_URL") {
            config.websocket_base = Url::parse(raw.trim())
                .map_err(|_| ConfigError::InvalidEnv("TASK_BOARD_WS_URL"))?;
        }

        config.bearer_token = env::var("TASK_BOARD_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let settings = &mut config.settings;
        if let Some(v) = positive_env("TASK_BOARD_PAGE_SIZE")? {
            settings.fetch_page_size =
                u32::try_from(v).map_err(|_| ConfigError::InvalidEnv("TASK_BOARD_PAGE_SIZE"))?;
        }
        if let Some(v) = positive_env("TASK_BOARD_REVEAL_PAGE")? {
            settings.reveal_page_size = v as usize;
        }
        if let Some(v) = positive_env("TASK_BOARD_REVEAL_STEP")? {
            settings.reveal_step = v as usize;
        }
        if let Some(v) = positive_env("TASK_BOARD_MOBILE_PAGE")? {
            settings.mobile_page_size = v as usize;
        }
        if let Some(v) = positive_env("TASK_BOARD_DEBOUNCE_MS")? {
            settings.debounce = Duration::from_millis(v);
        }

        Ok(config)
    }

    pub fn list_all_endpoint(&self) -> Result<Url, url::ParseError> {
        self.api_base.join("/api/tasks")
    }

    pub fn list_page_endpoint(&self) -> Result<Url, url::ParseError> {
        self.api_base.join("/api/tasks/page")
    }

    pub fn create_task_endpoint(&self) -> Result<Url, url::ParseError> {
        self.api_base.join("/api/tasks")
    }

    pub fn task_endpoint(&self, task_id: &str) -> Result<Url, url::ParseError> {
        let mut url = self.api_base.join("/api/tasks/")?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(task_id);
        Ok(url)
    }

    pub fn websocket_endpoint(&self) -> Result<Url, url::ParseError> {
        self.websocket_base.join("/ws")
    }
}

fn positive_env(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .map(Some)
            .ok_or(ConfigError::InvalidEnv(name)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BoardConfig {
        BoardConfig::new(Url::parse("https://tasks.example.com").unwrap()).unwrap()
    }

    #[test]
    fn websocket_base_is_derived_from_api_base() {
        let config = config();
        assert_eq!(
            config.websocket_endpoint().unwrap().as_str(),
            "wss://tasks.example.com/ws"
        );
    }

    #[test]
    fn task_endpoint_escapes_opaque_ids() {
        let config = config();
        assert_eq!(
            config.task_endpoint("a/b c").unwrap().as_str(),
            "https://tasks.example.com/api/tasks/a%2Fb%20c"
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = BoardSettings::default();
        assert_eq!(settings.fetch_page_size, 100);
        assert_eq!(settings.reveal_page_size, 50);
        assert_eq!(settings.reveal_step, 25);
        assert_eq!(settings.mobile_page_size, 20);
        assert_eq!(settings.debounce, Duration::from_millis(300));
    }
}
