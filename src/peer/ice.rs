use once_cell::sync::Lazy;
use tracing::{info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::CallError;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;

/// Серверы по умолчанию, если пользователь ничего не задал
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Проверка пользовательского списка серверов перед использованием
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), CallError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(CallError::Config(format!(
                "ice server {} has an empty url",
                server.id
            )));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(CallError::Config(format!(
                "turn server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn to_rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCensus {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateCensus {
    let mut census = CandidateCensus::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            census.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            census.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            census.relay += 1;
        }
    }

    info!(
        host = census.host,
        srflx = census.srflx,
        relay = census.relay,
        "local candidate gathering finished"
    );
    if census.relay == 0 {
        warn!("no relay candidates gathered, calls across strict NATs may fail");
    }
    census
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn census_counts_types() {
        let candidates = [
            IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.4 50000 typ host"),
            IceCandidate::new(
                "candidate:2 1 udp 1686052607 203.0.113.9 50000 typ srflx raddr 192.168.1.4 rport 50000",
            ),
            IceCandidate::new("candidate:3 1 udp 41885439 198.51.100.7 3478 typ relay"),
            IceCandidate::new("candidate:4 1 udp 2122260223 10.0.0.1 50001 typ host"),
        ];
        assert_eq!(
            analyze_candidates(&candidates),
            CandidateCensus {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let servers = vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn:relay.example.org:3478".into(),
            username: Some("alice".into()),
            credential: None,
        }];
        assert!(matches!(
            validate_ice_servers(&servers),
            Err(CallError::Config(_))
        ));
        assert!(validate_ice_servers(&DEFAULT_ICE_SERVERS).is_ok());
    }

    #[test]
    fn rtc_servers_get_schemes() {
        let servers = vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("alice".into()),
            credential: Some("secret".into()),
        }];
        let rtc = to_rtc_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(rtc[0].username, "alice");
    }
}
