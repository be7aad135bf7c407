//! The ULog capture endpoint.
//!
//! A state machine with three edges: packets routed to it (`deliver`),
//! timer polls (`poll_timer`), and the start/stop lifecycle. It commands
//! the vehicle to stream its flight log, acknowledges reliable fragments,
//! tracks the fragment sequence, and feeds the reassembly buffer that
//! writes the `.ulg` file.
//!
//! All session state lives in this value; a process can run several
//! endpoints against different vehicles without interference.

use crate::clock::{wall_timestamp_us, RetryTimer};
use crate::config::CaptureConfig;
use crate::error::{BufferKind, Result, SinkError};
use crate::logfile::{LogDir, LogFile};
use crate::reassembly::{AppendOutcome, ReassemblyBuffer, STAGING_CAPACITY};
use crate::router::{EndpointId, PacketBus, RoutedPacket};
use crate::sequence::{SeqCheck, SequenceTracker};
use crate::stats::{self, CaptureStats, SharedStats};
use crate::wire::{
    CommandAck, LogFragment, PacketView, MSG_ID_COMMAND_ACK, MSG_ID_LOGGING_DATA,
    MSG_ID_LOGGING_DATA_ACKED, NO_FIRST_MESSAGE_OFFSET, ULOG_HEADER_LEN, ULOG_MAGIC,
};
use bytes::Bytes;
use mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_LONG_DATA, LOGGING_ACK_DATA};
use mavlink::MavHeader;
use std::path::Path;
use tracing::{debug, info, warn};

/// MAV_COMP_ID_ALL.
const COMPONENT_ALL: u8 = 0;

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No session; no file open.
    Idle,
    /// File open, LOGGING_START sent, awaiting the vehicle's ack.
    Arming,
    /// The vehicle accepted; fragments are flowing.
    Capturing,
}

/// ULog capture endpoint for one vehicle.
pub struct UlogEndpoint {
    id: EndpointId,
    bus: PacketBus,
    logs: LogDir,
    system_id: u8,
    target_system_id: u8,

    state: CaptureState,
    file: Option<LogFile>,
    tracker: SequenceTracker,
    buffer: ReassemblyBuffer,
    waiting_header: bool,
    waiting_first_msg_offset: bool,
    retry: RetryTimer,
    tx_seq: u8,
    stats: SharedStats,
}

impl UlogEndpoint {
    /// Builds an idle endpoint. Nothing is opened or sent until `start`.
    pub fn new(cfg: &CaptureConfig, id: EndpointId, bus: PacketBus) -> Self {
        Self {
            id,
            bus,
            logs: LogDir::new(&cfg.logs_dir),
            system_id: cfg.system_id,
            target_system_id: cfg.target_system_id,
            state: CaptureState::Idle,
            file: None,
            tracker: SequenceTracker::new(),
            buffer: ReassemblyBuffer::new(),
            waiting_header: true,
            waiting_first_msg_offset: false,
            retry: RetryTimer::new(cfg.start_retry()),
            tx_seq: 0,
            stats: stats::shared(),
        }
    }

    /// This endpoint's id on the bus.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Shared handle to the session counters.
    pub fn stats_handle(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Snapshot of the session counters.
    pub fn stats(&self) -> CaptureStats {
        *self.stats.read()
    }

    /// Path of the open log file, while a session is active.
    pub fn log_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    /// Opens a session: creates the output file, sends the first
    /// LOGGING_START and arms the retry timer.
    ///
    /// Fails with `IoOpen` (and stays idle) if the file cannot be created.
    /// Calling `start` on an active session warns and does nothing.
    pub fn start(&mut self, now_us: u64) -> Result<()> {
        if self.state != CaptureState::Idle {
            warn!("ULog capture already active, ignoring start request");
            return Ok(());
        }

        let file = self.logs.create_log()?;
        self.file = Some(file);
        self.tracker.reset();
        self.buffer.reset();
        self.waiting_header = true;
        self.waiting_first_msg_offset = false;
        self.state = CaptureState::Arming;

        self.send_logging_start();
        self.retry.arm(now_us);
        Ok(())
    }

    /// Ends the session: sends LOGGING_STOP once, cancels the timer,
    /// flushes what it can and closes the file. Safe to call repeatedly;
    /// a stop with no active session warns and does nothing.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Idle {
            warn!("ULog capture stop requested but no session is active");
            return;
        }

        self.send_logging_stop();
        self.retry.cancel();

        if let Some(mut file) = self.file.take() {
            if let Err(e) = self.buffer.flush_to(&mut file) {
                warn!("final flush failed: {}", SinkError::io_write(e));
            }
            if let Err(e) = file.sync() {
                warn!("fsync on close failed: {e}");
            }
            info!("ULog capture finished: {}", file.path().display());
        }

        info!("ULog session statistics: {}", self.stats());
        self.state = CaptureState::Idle;
    }

    /// Delivers one routed packet to this endpoint.
    ///
    /// Always returns `packet.len()`; decoding problems are logged and the
    /// packet skipped. There is no backpressure toward the router.
    pub fn deliver(&mut self, packet: &[u8]) -> usize {
        let len = packet.len();

        let view = match PacketView::parse(packet) {
            Ok(view) => view,
            Err(e) => {
                warn!("discarding malformed packet: {e}");
                return len;
            }
        };

        match view.msg_id {
            MSG_ID_COMMAND_ACK => match CommandAck::decode(&view) {
                Ok(ack) => self.on_command_ack(&ack),
                Err(e) => warn!("discarding malformed COMMAND_ACK: {e}"),
            },
            MSG_ID_LOGGING_DATA | MSG_ID_LOGGING_DATA_ACKED => {
                let reliable = view.msg_id == MSG_ID_LOGGING_DATA_ACKED;
                match LogFragment::decode(&view) {
                    Ok(fragment) => self.on_fragment(&fragment, reliable),
                    Err(e) => warn!("discarding malformed log fragment: {e}"),
                }
            }
            _ => {}
        }

        len
    }

    /// This endpoint keeps no outbound queue of its own.
    pub fn flush_pending(&mut self) -> Result<()> {
        Err(SinkError::NotSupported("flush_pending"))
    }

    /// Drives the start-command retry. Call at a resolution finer than the
    /// retry cadence; expired periods re-send LOGGING_START.
    pub fn poll_timer(&mut self, now_us: u64) {
        if self.state == CaptureState::Arming && self.retry.fire(now_us) {
            debug!("LOGGING_START unacknowledged, re-sending");
            self.send_logging_start();
        }
    }

    fn on_command_ack(&mut self, ack: &CommandAck) {
        if self.state != CaptureState::Arming {
            return;
        }
        if ack.command != MavCmd::MAV_CMD_LOGGING_START as u16 {
            return;
        }

        if ack.result == MavResult::MAV_RESULT_ACCEPTED as u8 {
            info!("vehicle accepted LOGGING_START");
            self.retry.cancel();
            self.state = CaptureState::Capturing;
        } else {
            warn!(
                result = ack.result,
                "LOGGING_START rejected by vehicle, retrying"
            );
        }
    }

    fn on_fragment(&mut self, fragment: &LogFragment, reliable: bool) {
        if self.state == CaptureState::Idle {
            return;
        }

        // The vehicle expects an ack for every reliable fragment it gets
        // through, including ones the tracker will discard as retransmits.
        if reliable {
            self.send_logging_ack(fragment.sequence);
        }

        let check = self.tracker.check(fragment.sequence);
        if check == SeqCheck::Retransmit {
            self.stats.write().retransmits += 1;
            debug!(seq = fragment.sequence, "discarding retransmitted fragment");
            return;
        }
        self.stats.write().fragments += 1;

        let mut payload = fragment.payload();

        if self.waiting_header {
            if payload.len() < ULOG_HEADER_LEN
                || payload[..ULOG_MAGIC.len()] != ULOG_MAGIC
            {
                warn!("{}; still waiting for the ULog header", SinkError::BadMagic);
                return;
            }
            if !self.write_header(&payload[..ULOG_HEADER_LEN]) {
                return;
            }
            payload = &payload[ULOG_HEADER_LEN..];
        }

        if let SeqCheck::Gap { skipped } = check {
            warn!(
                lost = skipped,
                "fragment gap, resynchronising on the next record boundary"
            );
            {
                let mut stats = self.stats.write();
                stats.gaps += 1;
                stats.lost_fragments += skipped as u64;
            }
            self.flush();
            self.buffer.discard_staging();
            self.waiting_first_msg_offset = true;
        }

        if self.buffer.staged_len() + payload.len() > STAGING_CAPACITY {
            warn!(
                "{}; resynchronising on the next record boundary",
                SinkError::overflow(
                    BufferKind::Staging,
                    self.buffer.staged_len() + payload.len(),
                    STAGING_CAPACITY,
                )
            );
            self.stats.write().overflows += 1;
            self.buffer.discard_staging();
            self.waiting_first_msg_offset = true;
        }

        let mut start = 0usize;
        if self.waiting_first_msg_offset {
            if fragment.first_message_offset == NO_FIRST_MESSAGE_OFFSET {
                debug!(
                    seq = fragment.sequence,
                    "no record boundary in fragment, dropping"
                );
                return;
            }
            let offset = fragment.first_message_offset as usize;
            if offset > payload.len() {
                warn!(
                    "{}",
                    SinkError::protocol(format!(
                        "first_message_offset {offset} beyond fragment payload {}",
                        payload.len()
                    ))
                );
                return;
            }
            // Bytes before the offset are the tail of a record we already
            // lost; they must not reach the file.
            self.waiting_first_msg_offset = false;
            start = offset;
        }

        let chunk = &payload[start..];
        if chunk.is_empty() {
            return;
        }
        if self.buffer.is_corrupt() {
            return;
        }
        if self.buffer.append(chunk) == AppendOutcome::Overflow {
            // The pre-check above makes this unreachable, but the buffer
            // enforces its own bound; resync if it ever trips.
            self.stats.write().overflows += 1;
            self.waiting_first_msg_offset = true;
            return;
        }
        self.flush();
    }

    /// Writes the 16-byte ULog file header. A short write spills the
    /// remainder through the partial buffer, which drains ahead of every
    /// record, so the on-disk prefix stays exact. Returns false only when
    /// the write failed before a single byte landed and the session must
    /// keep waiting for the header.
    fn write_header(&mut self, header: &[u8]) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        match self.buffer.write_through(file, header) {
            Ok(committed) => {
                self.waiting_header = false;
                self.stats.write().bytes_written += committed as u64;
                if committed < header.len() {
                    debug!(
                        committed,
                        spilled = header.len() - committed,
                        "ULog file header partially spilled"
                    );
                } else {
                    debug!("ULog file header written");
                }
                true
            }
            Err(e) => {
                warn!("failed to write the ULog header: {e}");
                false
            }
        }
    }

    fn flush(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let before = self.buffer.staged_len() + self.buffer.partial_len();
        if let Err(e) = self.buffer.flush_to(file) {
            warn!("record write failed, record dropped: {}", SinkError::io_write(e));
        }
        let drained = before - (self.buffer.staged_len() + self.buffer.partial_len());
        self.stats.write().bytes_written += drained as u64;
    }

    fn send_logging_start(&mut self) {
        let msg = MavMessage::COMMAND_LONG(command(
            MavCmd::MAV_CMD_LOGGING_START,
            self.target_system_id,
        ));
        self.route(&msg);
    }

    fn send_logging_stop(&mut self) {
        let msg = MavMessage::COMMAND_LONG(command(
            MavCmd::MAV_CMD_LOGGING_STOP,
            self.target_system_id,
        ));
        self.route(&msg);
    }

    fn send_logging_ack(&mut self, sequence: u16) {
        let msg = MavMessage::LOGGING_ACK(LOGGING_ACK_DATA {
            sequence,
            target_system: self.target_system_id,
            target_component: COMPONENT_ALL,
        });
        self.route(&msg);
        self.stats.write().acked += 1;
    }

    /// Serializes and hands the message to the router. Fire-and-forget:
    /// a bus without receivers only logs at debug.
    fn route(&mut self, msg: &MavMessage) {
        let header = MavHeader {
            system_id: self.system_id,
            component_id: COMPONENT_ALL,
            sequence: self.tx_seq,
        };
        self.tx_seq = self.tx_seq.wrapping_add(1);

        let mut buf = Vec::with_capacity(64);
        if let Err(e) = mavlink::write_v2_msg(&mut buf, header, msg) {
            warn!("failed to serialize outgoing message: {e}");
            return;
        }

        let len = buf.len() as u64;
        let packet = RoutedPacket {
            source: self.id,
            bytes: Bytes::from(buf),
            timestamp_us: wall_timestamp_us(),
        };
        if self.bus.send(packet).is_err() {
            debug!("packet bus has no receivers, outgoing message dropped");
        }

        let mut stats = self.stats.write();
        stats.handled += 1;
        stats.handled_bytes += len;
    }
}

fn command(cmd: MavCmd, target_system: u8) -> COMMAND_LONG_DATA {
    COMMAND_LONG_DATA {
        target_system,
        target_component: COMPONENT_ALL,
        command: cmd,
        confirmation: 0,
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::router::create_bus;
    use mavlink::common::COMMAND_ACK_DATA;

    fn test_endpoint(logs_dir: &Path) -> (UlogEndpoint, tokio::sync::broadcast::Receiver<RoutedPacket>) {
        let toml = format!("[capture]\nlogs_dir = \"{}\"", logs_dir.display());
        let config = Config::from_str(&toml).unwrap();
        let bus = create_bus(64);
        let rx = bus.subscribe();
        (UlogEndpoint::new(&config.capture, EndpointId(0), bus), rx)
    }

    fn command_ack_packet(result: MavResult) -> Vec<u8> {
        let msg = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_LOGGING_START,
            result,
        });
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, MavHeader::default(), &msg).unwrap();
        buf
    }

    fn recv_command(rx: &mut tokio::sync::broadcast::Receiver<RoutedPacket>) -> MavCmd {
        let packet = rx.try_recv().expect("expected an outgoing packet");
        let mut cursor = std::io::Cursor::new(&packet.bytes[..]);
        let (_, msg) =
            mavlink::read_v2_msg::<MavMessage, _>(&mut cursor).expect("valid outgoing frame");
        match msg {
            MavMessage::COMMAND_LONG(data) => data.command,
            other => panic!("expected COMMAND_LONG, got {other:?}"),
        }
    }

    #[test]
    fn test_start_opens_file_and_sends_logging_start() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, mut rx) = test_endpoint(tmp.path());

        endpoint.start(0).unwrap();
        assert_eq!(endpoint.state(), CaptureState::Arming);
        assert!(endpoint.log_path().is_some());
        assert_eq!(recv_command(&mut rx), MavCmd::MAV_CMD_LOGGING_START);
    }

    #[test]
    fn test_start_while_active_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, mut rx) = test_endpoint(tmp.path());

        endpoint.start(0).unwrap();
        let path = endpoint.log_path().unwrap().to_path_buf();
        let _ = recv_command(&mut rx);

        endpoint.start(10).unwrap();
        assert_eq!(endpoint.log_path().unwrap(), path);
        assert!(rx.try_recv().is_err(), "second start must not emit");
    }

    #[test]
    fn test_retry_until_accepted_ack() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, mut rx) = test_endpoint(tmp.path());

        endpoint.start(0).unwrap();
        let _ = recv_command(&mut rx);

        endpoint.poll_timer(500_000);
        assert!(rx.try_recv().is_err(), "no retry before the period");

        endpoint.poll_timer(1_000_000);
        assert_eq!(recv_command(&mut rx), MavCmd::MAV_CMD_LOGGING_START);

        // A rejected ack keeps retrying.
        endpoint.deliver(&command_ack_packet(MavResult::MAV_RESULT_TEMPORARILY_REJECTED));
        assert_eq!(endpoint.state(), CaptureState::Arming);
        endpoint.poll_timer(2_000_000);
        assert_eq!(recv_command(&mut rx), MavCmd::MAV_CMD_LOGGING_START);

        // Accepted: timer cancelled, no more retries ever.
        endpoint.deliver(&command_ack_packet(MavResult::MAV_RESULT_ACCEPTED));
        assert_eq!(endpoint.state(), CaptureState::Capturing);
        endpoint.poll_timer(u64::MAX);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, mut rx) = test_endpoint(tmp.path());

        endpoint.start(0).unwrap();
        let _ = recv_command(&mut rx);

        endpoint.stop();
        assert_eq!(endpoint.state(), CaptureState::Idle);
        assert_eq!(recv_command(&mut rx), MavCmd::MAV_CMD_LOGGING_STOP);

        endpoint.stop();
        assert!(rx.try_recv().is_err(), "second stop must not emit");
    }

    #[test]
    fn test_flush_pending_not_supported() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, _rx) = test_endpoint(tmp.path());
        assert!(matches!(
            endpoint.flush_pending(),
            Err(SinkError::NotSupported(_))
        ));
    }

    #[test]
    fn test_unrelated_packets_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, mut rx) = test_endpoint(tmp.path());
        endpoint.start(0).unwrap();
        let _ = recv_command(&mut rx);

        let msg = MavMessage::HEARTBEAT(mavlink::common::HEARTBEAT_DATA::default());
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, MavHeader::default(), &msg).unwrap();

        let consumed = endpoint.deliver(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(endpoint.state(), CaptureState::Arming);
    }

    #[test]
    fn test_malformed_packet_returns_full_length() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut endpoint, _rx) = test_endpoint(tmp.path());
        let garbage = [0xFD, 0xFF, 0x00];
        assert_eq!(endpoint.deliver(&garbage), garbage.len());
    }
}
