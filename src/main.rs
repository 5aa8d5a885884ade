use anyhow::Context;
use gcs_engine::{EngineHandle, Station, StationConfig};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    gcs_engine::init();

    info!("GCS engine v{} starting", gcs_engine::VERSION);

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/station.yaml".to_string());

    let config = StationConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    info!("Loaded {} units from {}", config.units.len(), config_path);

    let mut station = Station::start(config).await.context("starting station")?;
    let mut loggers: Vec<JoinHandle<()>> = station.handles().into_iter().map(log_events).collect();

    #[cfg(unix)]
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = reload => {
                info!("Reloading {}", config_path);
                match StationConfig::from_file(&config_path) {
                    Ok(next) => {
                        if let Err(e) = station.reload(next).await {
                            error!("Reload failed: {}", e);
                        }
                        // A failed reload can still have replaced engines
                        respawn_loggers(&mut loggers, &station);
                    }
                    Err(e) => error!("Rejected configuration, keeping the active one: {}", e),
                }
            }
        }
    }

    let handles = station.handles();
    station.stop().await;
    for logger in loggers {
        logger.abort();
    }

    for handle in handles {
        let stats = handle.stats();
        info!(
            "[{}] final stats: {} ticks, {} events, max tick {} us",
            handle.unit_id(),
            stats.ticks,
            stats.events_emitted,
            stats.max_tick_us
        );
    }

    Ok(())
}

/// Replace the event loggers with one per currently running unit
fn respawn_loggers(loggers: &mut Vec<JoinHandle<()>>, station: &Station) {
    for logger in loggers.drain(..) {
        logger.abort();
    }
    loggers.extend(station.handles().into_iter().map(log_events));
}

/// Log alarm events and shutdown state of one unit
fn log_events(handle: EngineHandle) -> JoinHandle<()> {
    let mut snapshots = handle.subscribe();
    tokio::spawn(async move {
        let mut tripped = false;
        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    for event in &snapshot.events {
                        info!(
                            "[{}] ALARM {} {} -> {} value={:.3} setpoint={:?}",
                            event.unit_id,
                            event.parameter,
                            event.old_level,
                            event.new_level,
                            event.value,
                            event.setpoint
                        );
                    }
                    let now_tripped = snapshot.shutdown.is_tripped();
                    if now_tripped && !tripped {
                        error!("[{}] unit shutdown latched", snapshot.unit_id);
                    }
                    tripped = now_tripped;
                }
                Err(RecvError::Lagged(n)) => warn!("[{}] event logger skipped {} snapshots", handle.unit_id(), n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_UNITS: &str = r#"
units:
  - unit_id: CU-101
    parameters:
      - name: p
        sources:
          - { type: default, priority: 1, value: 1.0 }
  - unit_id: CU-102
    parameters:
      - name: p
        sources:
          - { type: default, priority: 1, value: 2.0 }
"#;

    #[tokio::test]
    async fn test_respawn_aborts_old_loggers_and_follows_units() {
        let station = Station::start(StationConfig::from_yaml(TWO_UNITS).unwrap()).await.unwrap();
        let stale = tokio::spawn(std::future::pending::<()>());
        let stale_abort = stale.abort_handle();
        let mut loggers = vec![stale];

        respawn_loggers(&mut loggers, &station);
        assert_eq!(loggers.len(), 2);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !stale_abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        station.stop().await;
        for logger in loggers {
            logger.abort();
        }
    }
}
