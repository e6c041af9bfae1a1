use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Sampler;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Drives `sampler` at its period until cancelled.
///
/// Missed ticks are replayed in a burst: a late wake-up still yields one
/// reading per elapsed period, keeping the logical sequence gap-free.
pub async fn sampling_loop(sampler: Sampler, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(sampler.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let mut produced: u64 = 0;
    log_info!("sampling loop started ({:?} period)", sampler.period());

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                log_info!("sampling loop shutting down after {produced} readings");
                break;
            }
            _ = ticker.tick() => {
                if sampler.tick() {
                    produced += 1;
                    if produced % 1000 == 0 {
                        log_debug!("sampling loop produced {produced} readings");
                    }
                }
            }
        }
    }
}
