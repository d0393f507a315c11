use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config;
use crate::peer::types::IceCandidate;

/// Устанавливает глобальный subscriber. `RUST_LOG` имеет приоритет,
/// иначе уровень по умолчанию задают переключатели из `config`
pub fn init() {
    let default_level = if logging_enabled() { "info,peercall_lib=debug" } else { "off" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // уже установлен (тесты, встраивание) - не ошибка
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn logging_enabled() -> bool {
    if !config::LOGGING_ENABLED {
        return false;
    }
    #[cfg(debug_assertions)]
    {
        // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
        if !config::dev::ENABLE_LOGGING {
            return false;
        }
    }
    true
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
