//! The periodic task runner: a 1-second tick for speed tracking and
//! slow-source disconnects, and a 60-second tick for connection
//! housekeeping and UBN progress reports (spec.md §5).

use std::time::Instant;

use tokio::sync::oneshot;

use crate::context::AppContext;
use crate::download_manager::TickAction;

/// Runs the scheduler loop until `shutdown` fires. Consumes `ctx` for the
/// duration of the run since nothing else may mutate it concurrently; a
/// host application typically spawns this as its own task and talks to
/// the rest of the core only through the event channels subscribed before
/// handing `ctx` over.
pub async fn run(mut ctx: AppContext, mut shutdown: oneshot::Receiver<()>) {
    let mut second_tick = tokio::time::interval(ctx.conf.download.tick_interval);
    let mut minute_tick = tokio::time::interval(ctx.conf.download.minute_tick_interval);

    log::info!("scheduler starting");
    loop {
        tokio::select! {
            _ = second_tick.tick() => {
                on_second_tick(&mut ctx).await;
            }
            _ = minute_tick.tick() => {
                on_minute_tick(&mut ctx).await;
            }
            _ = &mut shutdown => {
                log::info!("scheduler shutting down");
                ctx.shutdown_persistence();
                break;
            }
        }
    }
}

/// Updates download speeds, disconnects any that have been slow for too
/// long, and folds completed transfers back into the queue (spec.md
/// §4.6). CQI attempt scheduling also lives on this tick (spec.md §5
/// "every second").
async fn on_second_tick(ctx: &mut AppContext) {
    let now = Instant::now();
    let conf = ctx.conf.connection.clone();
    let queue = &ctx.queue;
    let actions = ctx.downloads.tick(&conf, now, |target| {
        queue.item(target).map_or(0, |qi| qi.sources.iter().filter(|s| s.is_usable()).count())
    });

    for (token, action) in actions {
        if action == TickAction::Disconnect {
            log::info!("disconnecting slow download on connection {}", token);
            if let Some(user) = ctx.connections.get(&token).and_then(|c| c.user.clone()) {
                if let Some(download) = ctx.downloads.stop(&token) {
                    ctx.put_download(&token, &user, download, false, false, true).await;
                }
            } else {
                ctx.downloads.stop(&token);
            }
            ctx.connections.disconnect(&token);
        }
    }

    for (token, user, download) in ctx.downloads.drain_finished() {
        ctx.put_download(&token, &user, download, true, false, false).await;
    }

    let timed_out = ctx.connections.sweep_cqi_timeouts(now);
    for token in timed_out {
        ctx.connections.disconnect(&token);
    }

    let due = ctx.connections.due_attempts(now, ctx.conf.connection.downconn_per_sec);
    for (token, user, hub_url) in due {
        if let Err(e) = ctx.collaborators.hub_client.connect_to_me(&hub_url, &user, &token).await {
            log::warn!("connect request for {} via {} failed: {}", user.user.nick, hub_url, e);
            ctx.connections.fail_cqi(&token, false);
        }
    }
}

/// Expires stale expected-connection tokens, sweeps flood-guard buckets,
/// and reports download progress to sources via UBN (spec.md §5, §4.1
/// `sendUBN`).
async fn on_minute_tick(ctx: &mut AppContext) {
    let now = Instant::now();
    let expired = ctx.connections.sweep(now);
    if !expired.is_empty() {
        log::debug!("expired {} stale connection token(s)", expired.len());
    }

    for bundle in ctx.queue.bundles() {
        if bundle.running == 0 {
            continue;
        }
        let percent = if bundle.is_finished() {
            100.0
        } else {
            bundle.downloaded_bytes() as f64 / bundle.current_downloaded.max(1) as f64 * 100.0
        };
        for source in &bundle.sources {
            if let Err(e) = ctx.collaborators.hub_client.send_ubn(&source.user.hub_url, &source.user, percent).await {
                log::warn!("failed to send UBN to {}: {}", source.user.user.nick, e);
            }
        }
    }
}
