//! Background maintenance loops owned by a gateway.
//!
//! Every loop holds a [`Weak`] reference and exits once the gateway is
//! gone; the gateway also aborts the handles on shutdown. Intervals are read
//! from the current config snapshot on every tick, so a config update takes
//! effect at the next tick.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ExecutionGateway;
use crate::config::GatewayConfig;

pub(crate) fn spawn_all(gateway: &Arc<ExecutionGateway>) -> Vec<JoinHandle<()>> {
    let weak = Arc::downgrade(gateway);
    vec![
        spawn_periodic(weak.clone(), "health probe", GatewayConfig::health_check_interval, |gw| {
            Box::pin(async move {
                gw.run_health_check().await;
            })
        }),
        spawn_periodic(weak.clone(), "cache sweep", GatewayConfig::cache_sweep_interval, |gw| {
            Box::pin(async move {
                let removed = gw.cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            })
        }),
        spawn_periodic(weak.clone(), "quota housekeeping", GatewayConfig::quota_check_interval, |gw| {
            Box::pin(async move {
                gw.quota_housekeeping().await;
            })
        }),
        spawn_event_listener(weak),
    ]
}

type Tick = fn(Arc<ExecutionGateway>) -> futures::future::BoxFuture<'static, ()>;

fn spawn_periodic(
    gateway: Weak<ExecutionGateway>,
    name: &'static str,
    interval: fn(&GatewayConfig) -> Duration,
    tick: Tick,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(task = name, "Background task started");
        loop {
            let period = match gateway.upgrade() {
                Some(gw) => interval(&gw.config()),
                None => break,
            };
            tokio::time::sleep(period.max(Duration::from_millis(1))).await;

            let Some(gw) = gateway.upgrade() else { break };
            if gw.is_shutting_down() {
                break;
            }
            tick(gw).await;
        }
        debug!(task = name, "Background task stopped");
    })
}

/// Reconcile protective actions whenever the quota tracker publishes an event
fn spawn_event_listener(gateway: Weak<ExecutionGateway>) -> JoinHandle<()> {
    let mut events = match gateway.upgrade() {
        Some(gw) => gw.quota.subscribe(),
        None => return tokio::spawn(async {}),
    };

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(gw) = gateway.upgrade() else { break };
                    info!(?event, "Quota event received");
                    gw.reconcile_emergency().await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Quota event listener lagged, reconciling");
                    let Some(gw) = gateway.upgrade() else { break };
                    gw.reconcile_emergency().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
