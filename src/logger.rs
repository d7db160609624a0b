use env_logger::Env;
use std::io::Write;

use crate::peer::types::IceCandidate;

/// Installs the process logger with millisecond timestamps.
///
/// `RUST_LOG` wins over the verbosity flag.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let default_filter = format!("warn,rtc_relay={level}");

    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

/// Trace an ICE candidate as it passes through (trickle ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    log::debug!(
        "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}
