use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::CapabilityClient;
use crate::state::CapabilityCache;
use crate::util::unix_now_secs;

/// Fetch all four capability lists and store the ones that succeeded.
///
/// A failed fetch is logged and leaves the previous value in place. Returns
/// the number of lists that were refreshed.
pub async fn refresh_capabilities(client: &CapabilityClient, cache: &CapabilityCache) -> usize {
    let (models, tools, files, servers) = futures_util::join!(
        client.list_models(),
        client.list_tools(),
        client.list_files(),
        client.list_mcpl_servers(),
    );

    let mut refreshed = 0;
    match models {
        Ok(models) => {
            cache.set_models(models);
            refreshed += 1;
        }
        Err(err) => warn!(error = %err, "keeping previous model list"),
    }
    match tools {
        Ok(tools) => {
            cache.set_tools(tools);
            refreshed += 1;
        }
        Err(err) => warn!(error = %err, "keeping previous tool list"),
    }
    match files {
        Ok(files) => {
            cache.set_files(files);
            refreshed += 1;
        }
        Err(err) => warn!(error = %err, "keeping previous file list"),
    }
    match servers {
        Ok(servers) => {
            cache.set_mcpl_servers(servers);
            refreshed += 1;
        }
        Err(err) => warn!(error = %err, "keeping previous MCPL server list"),
    }
    debug!(refreshed = refreshed, "capability refresh finished");
    refreshed
}

/// Refresh `cache` now and then every `interval` until `cancel` fires.
pub fn spawn_capability_poller(
    client: CapabilityClient,
    cache: Arc<CapabilityCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // The tick is the schedule; only a refresh already running skips it.
            cache.invalidate();
            if !cache.try_begin_refresh(unix_now_secs()) {
                continue;
            }
            refresh_capabilities(&client, &cache).await;
            cache.finish_refresh();
        }
        debug!("capability poller stopped");
    })
}
