// Конфигурация приложения
// Логирование по умолчанию можно отключить только в режиме разработки;
// RUST_LOG всегда имеет приоритет.

use std::env;

use crate::error::CallError;
use crate::media::MediaConstraints;
use crate::peer::ice::{validate_ice_servers, DEFAULT_ICE_SERVERS};
use crate::peer::types::ServerConfig;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

pub const DEFAULT_API_BASE: &str = "http://localhost:3000/api/v1/call";
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000";
pub const DEFAULT_CANDIDATE_PATH: &str = "/iceCandidate";

/// Настройки одного участника
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub identity: String,
    pub api_base: String,
    pub signaling_url: String,
    /// Bearer-токен; без него запросы уходят без авторизации
    pub auth_token: Option<String>,
    pub ice_servers: Vec<ServerConfig>,
    pub candidate_path: String,
    pub video: bool,
}

impl ClientConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            api_base: DEFAULT_API_BASE.to_owned(),
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            auth_token: None,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            candidate_path: DEFAULT_CANDIDATE_PATH.to_owned(),
            video: false,
        }
    }

    /// Читает переменные `PEERCALL_*`. Обязателен только идентификатор
    pub fn from_env() -> Result<Self, CallError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CallError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let identity = get("PEERCALL_IDENTITY")
            .ok_or_else(|| CallError::Config("PEERCALL_IDENTITY is not set".into()))?;
        let mut cfg = Self::new(identity);

        if let Some(base) = get("PEERCALL_API_BASE") {
            cfg.api_base = base;
        }
        if let Some(url) = get("PEERCALL_SIGNALING_URL") {
            cfg.signaling_url = url;
        }
        cfg.auth_token = get("PEERCALL_TOKEN");
        if let Some(path) = get("PEERCALL_CANDIDATE_PATH") {
            cfg.candidate_path = if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            };
        }
        if let Some(raw) = get("PEERCALL_ICE_SERVERS") {
            let servers: Vec<ServerConfig> = serde_json::from_str(&raw)
                .map_err(|e| CallError::Config(format!("PEERCALL_ICE_SERVERS: {e}")))?;
            validate_ice_servers(&servers)?;
            if !servers.is_empty() {
                cfg.ice_servers = servers;
            }
        }
        if let Some(video) = get("PEERCALL_VIDEO") {
            cfg.video = matches!(video.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(cfg)
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: self.video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn identity_is_required() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[])),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    fn defaults_match_local_backend() {
        let cfg = ClientConfig::from_lookup(lookup(&[("PEERCALL_IDENTITY", "user-1")])).unwrap();
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.candidate_path, "/iceCandidate");
        assert!(cfg.auth_token.is_none());
        assert!(!cfg.media_constraints().video);
        assert_eq!(cfg.ice_servers.len(), 2);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = ClientConfig::from_lookup(lookup(&[
            ("PEERCALL_IDENTITY", "user-1"),
            ("PEERCALL_TOKEN", "abc"),
            ("PEERCALL_CANDIDATE_PATH", "sendIceCandidate"),
            ("PEERCALL_VIDEO", "true"),
            (
                "PEERCALL_ICE_SERVERS",
                r#"[{"id":"t","type":"turn","url":"relay.example.org:3478","username":"u","credential":"p"}]"#,
            ),
        ]))
        .unwrap();
        assert_eq!(cfg.auth_token.as_deref(), Some("abc"));
        assert_eq!(cfg.candidate_path, "/sendIceCandidate");
        assert!(cfg.video);
        assert_eq!(cfg.ice_servers[0].id, "t");
    }

    #[test]
    fn invalid_turn_entry_fails() {
        let res = ClientConfig::from_lookup(lookup(&[
            ("PEERCALL_IDENTITY", "user-1"),
            (
                "PEERCALL_ICE_SERVERS",
                r#"[{"id":"t","type":"turn","url":"relay.example.org:3478"}]"#,
            ),
        ]));
        assert!(matches!(res, Err(CallError::Config(_))));
    }
}
