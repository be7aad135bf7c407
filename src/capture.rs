//! Async driver attaching a `UlogEndpoint` to a packet bus.
//!
//! The endpoint value and all session state live inside one task; the
//! three edges (packet delivered, timer poll, shutdown) run to completion
//! one at a time, so the capture needs no locks of its own.

use crate::clock::monotonic_us;
use crate::config::CaptureConfig;
use crate::endpoint::UlogEndpoint;
use crate::error::Result;
use crate::router::{EndpointId, PacketBus, RoutedPacket};
use crate::stats::{CaptureStats, SharedStats};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Timer poll resolution; far finer than the retry cadence it drives.
const TIMER_POLL: Duration = Duration::from_millis(100);

/// Runs a capture session until cancellation or bus close, then stops it.
///
/// Packets beat timer ticks within one loop iteration, so an in-flight
/// accepted ack cancels the retry before it can fire again.
pub async fn run(
    mut endpoint: UlogEndpoint,
    mut bus_rx: broadcast::Receiver<RoutedPacket>,
    token: CancellationToken,
) -> Result<()> {
    endpoint.start(monotonic_us())?;

    let mut tick = tokio::time::interval(TIMER_POLL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                info!("ULog capture shutting down");
                break;
            }
            res = bus_rx.recv() => match res {
                Ok(packet) => {
                    // Our own emissions echo on the broadcast bus.
                    if packet.source != endpoint.id() {
                        endpoint.deliver(&packet.bytes);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("ULog capture lagged on the bus: missed {n} packets");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tick.tick() => endpoint.poll_timer(monotonic_us()),
        }
    }

    endpoint.stop();
    Ok(())
}

/// Handle to a spawned capture task.
pub struct Capture {
    id: EndpointId,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
    stats: SharedStats,
}

impl Capture {
    /// Spawns a capture endpoint attached to `bus`.
    ///
    /// The session starts inside the task; a failure to open the log file
    /// ends the task and surfaces from [`Capture::stop`].
    pub fn spawn(cfg: &CaptureConfig, id: EndpointId, bus: PacketBus) -> Self {
        let endpoint = UlogEndpoint::new(cfg, id, bus.clone());
        let stats = endpoint.stats_handle();
        let bus_rx = bus.subscribe();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(endpoint, bus_rx, token.clone()));

        Self {
            id,
            token,
            handle,
            stats,
        }
    }

    /// This capture's endpoint id on the bus.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Snapshot of the session counters.
    pub fn stats(&self) -> CaptureStats {
        *self.stats.read()
    }

    /// Stops the capture, waits for the file to be synced and closed.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        match self.handle.await {
            Ok(res) => res,
            Err(e) => {
                warn!("capture task join error: {e}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::create_bus;
    use mavlink::common::{MavCmd, MavMessage};

    fn decode_command(packet: &RoutedPacket) -> Option<MavCmd> {
        let mut cursor = std::io::Cursor::new(&packet.bytes[..]);
        match mavlink::read_v2_msg::<MavMessage, _>(&mut cursor) {
            Ok((_, MavMessage::COMMAND_LONG(data))) => Some(data.command),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_spawn_emits_start_and_stop_emits_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!("[capture]\nlogs_dir = \"{}\"", tmp.path().display());
        let config = Config::from_str(&toml).unwrap();

        let bus = create_bus(64);
        let mut rx = bus.subscribe();

        let capture = Capture::spawn(&config.capture, EndpointId(1), bus);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.source, EndpointId(1));
        assert_eq!(decode_command(&first), Some(MavCmd::MAV_CMD_LOGGING_START));

        capture.stop().await.unwrap();
        let last = rx.recv().await.unwrap();
        assert_eq!(decode_command(&last), Some(MavCmd::MAV_CMD_LOGGING_STOP));
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_on_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let toml = format!(
            "[capture]\nlogs_dir = \"{}\"",
            blocker.join("logs").display()
        );
        let config = Config::from_str(&toml).unwrap();

        let bus = create_bus(64);
        let capture = Capture::spawn(&config.capture, EndpointId(1), bus);
        assert!(capture.stop().await.is_err());
    }
}
