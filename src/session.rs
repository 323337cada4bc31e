use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use bytes::{Bytes, BytesMut};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::fault::FaultInjector;
use crate::receive_tracker::ReceiveTracker;
use crate::send_window::{Admission, SendWindow, WindowFull};
use crate::stats::{FinalReport, StatsRecorder};
use crate::transport::Transport;
use crate::wire::{Packet, StreamFramer, WireCodec};

/// Literal the initiator sends to open a session.
pub const HANDSHAKE_REQUEST: &str = "network";
/// Literal the responder replies with on a successful handshake.
pub const HANDSHAKE_REPLY: &str = "success";
/// Literal the initiator sends once the transfer is complete.
pub const FINISH_REQUEST: &str = "finish";
/// Literal acknowledging the finish request; the caller closes the transport
/// afterwards.
pub const FINISH_REPLY: &str = "done";

const RECEIVE_BUF_LEN: usize = 4096;
/// Repeated transport send failure is surfaced to the session owner rather
/// than retried indefinitely.
const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 8;

async fn send_literal<T: Transport>(
    transport: &mut T,
    literal: &str,
    delimiter: u8,
) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(literal.len() + 1);
    buf.extend_from_slice(literal.as_bytes());
    buf.push(delimiter);
    transport.send(&buf).await
}

/// The next complete frame, reading more bytes as necessary.
/// `Ok(None)` means the peer closed the connection.
async fn next_frame<T: Transport>(
    transport: &mut T,
    framer: &mut StreamFramer,
) -> anyhow::Result<Option<Bytes>> {
    loop {
        if let Some(frame) = framer.next_frame() {
            return Ok(Some(frame));
        }
        let mut buf = [0u8; RECEIVE_BUF_LEN];
        let n = transport.receive(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        framer.push(&buf[..n]);
    }
}

/// Drives the sending role of one session: handshake, windowed admission,
/// cadence-driven retransmission and window adaptation, cumulative ack
/// processing, finish exchange.
///
/// Runs as a single cooperative task; the bounded ack-poll timeout keeps the
/// send path from starving (§ concurrency model). All engine state is owned
/// by this instance - concurrent sessions use independent instances.
pub struct SenderSession<T: Transport> {
    transport: T,
    codec: WireCodec,
    framer: StreamFramer,
    window: SendWindow,
    stats: StatsRecorder,
    delimiter: u8,
    ack_poll_timeout: Duration,
    snapshot_interval: u64,
    target_packets: u64,
    send_failure_streak: u32,
    eof: bool,
}

impl<T: Transport> SenderSession<T> {
    pub fn new(
        config: &ProtocolConfig,
        transport: T,
        fault: Box<dyn FaultInjector>,
    ) -> SenderSession<T> {
        SenderSession {
            transport,
            codec: config.codec(),
            framer: StreamFramer::new(config.delimiter),
            window: SendWindow::new(
                config.send_window.clone(),
                config.sequence_space(),
                fault,
            ),
            stats: StatsRecorder::new(config.send_window.max_retries),
            delimiter: config.delimiter,
            ack_poll_timeout: config.ack_poll_timeout,
            snapshot_interval: config.snapshot_interval.max(1),
            target_packets: config.target_packets,
            send_failure_streak: 0,
            eof: false,
        }
    }

    /// Runs the session to completion and returns the final statistics -
    /// partial if the transport closed mid-transfer.
    pub async fn run(mut self) -> anyhow::Result<FinalReport> {
        self.handshake().await?;
        info!("handshake complete - transferring {} packets", self.target_packets);

        self.transfer().await?;

        if self.eof {
            warn!("transport closed mid-transfer - reporting partial statistics");
        } else {
            self.finish_exchange().await;
        }
        Ok(self.report())
    }

    async fn handshake(&mut self) -> anyhow::Result<()> {
        send_literal(&mut self.transport, HANDSHAKE_REQUEST, self.delimiter)
            .await
            .context("sending handshake")?;

        let frame = next_frame(&mut self.transport, &mut self.framer)
            .await?
            .ok_or_else(|| anyhow!("transport closed during handshake"))?;
        if frame.as_ref() != HANDSHAKE_REPLY.as_bytes() {
            bail!(
                "handshake rejected: {:?}",
                String::from_utf8_lossy(&frame)
            );
        }
        Ok(())
    }

    async fn transfer(&mut self) -> anyhow::Result<()> {
        let mut out_buf = BytesMut::with_capacity(64);

        loop {
            if self.target_reached() && self.window.is_drained() {
                return Ok(());
            }

            // admit until the window refuses or the target is reached
            while !self.target_reached() {
                match self.window.admit(Instant::now()) {
                    Ok(Admission::Send(packet)) => self.transmit(&packet, &mut out_buf).await?,
                    Ok(Admission::Lost(packet)) => {
                        trace!("packet #{} never reached the wire", packet.seq);
                    }
                    Err(WindowFull) => break,
                }
                if self.window.cycle_due() {
                    self.maintenance(&mut out_buf).await?;
                }
                if self.window.admitted_count() % self.snapshot_interval == 0 {
                    self.snapshot();
                }
            }

            self.poll_acks().await?;
            if self.eof {
                return Ok(());
            }

            // The retransmit cadence is admission-driven, so it can never
            // fire while a pinned ack keeps the window full - and it stops
            // entirely once the target is reached. Both states fall back to
            // cycling once per poll round.
            let stalled = self.window.outstanding_len() as u32 >= self.window.window_size()
                && !self.window.is_drained();
            if self.target_reached() || (stalled && self.window.dropped_len() > 0) {
                self.maintenance(&mut out_buf).await?;
            }
            if (self.target_reached() || stalled) && self.window.dropped_len() == 0 {
                for seq in self.window.release_unackable() {
                    debug!("releasing unacknowledgeable packet #{}", seq);
                }
            }
        }
    }

    fn target_reached(&self) -> bool {
        self.window.admitted_count() >= self.target_packets
    }

    async fn transmit(&mut self, packet: &Packet, out_buf: &mut BytesMut) -> anyhow::Result<()> {
        out_buf.clear();
        self.codec.encode_packet(packet, out_buf);

        match self.transport.send(out_buf).await {
            Ok(()) => {
                self.send_failure_streak = 0;
                Ok(())
            }
            Err(e) => {
                warn!("send of packet #{} failed: {:#}", packet.seq, e);
                self.window.on_send_failed(packet.seq);
                self.send_failure_streak += 1;
                if self.send_failure_streak >= MAX_CONSECUTIVE_SEND_FAILURES {
                    Err(e).context("repeated transport send failures")
                } else {
                    Ok(())
                }
            }
        }
    }

    /// One retransmit cycle plus the window adaptation that follows it.
    async fn maintenance(&mut self, out_buf: &mut BytesMut) -> anyhow::Result<()> {
        let outcome = self.window.retransmit_cycle(Instant::now());

        for &(seq, count) in &outcome.abandoned {
            warn!(
                "packet #{} permanently abandoned after {} retransmissions",
                seq, count
            );
            self.stats.record_retransmission(count);
        }
        for packet in &outcome.resend {
            self.transmit(packet, out_buf).await?;
        }

        self.window.adjust_window_size();
        Ok(())
    }

    /// Applies buffered acknowledgments, polling the transport with a
    /// bounded timeout if none are buffered. A timeout is not an error.
    async fn poll_acks(&mut self) -> anyhow::Result<()> {
        if self.apply_buffered_acks() > 0 {
            return Ok(());
        }

        let mut buf = [0u8; RECEIVE_BUF_LEN];
        match timeout(self.ack_poll_timeout, self.transport.receive(&mut buf)).await {
            Err(_elapsed) => {
                trace!("ack poll timed out - retrying");
            }
            Ok(Ok(0)) => {
                self.eof = true;
            }
            Ok(Ok(n)) => {
                self.framer.push(&buf[..n]);
                self.apply_buffered_acks();
            }
            Ok(Err(e)) => return Err(e).context("receiving acknowledgments"),
        }
        Ok(())
    }

    fn apply_buffered_acks(&mut self) -> usize {
        let mut applied = 0;
        while let Some(frame) = self.framer.next_frame() {
            match self.codec.decode_ack(&frame) {
                Ok(ack) => {
                    for (_, count) in self.window.on_ack(ack) {
                        self.stats.record_retransmission(count);
                    }
                    applied += 1;
                }
                Err(e) => warn!("discarding malformed frame: {}", e),
            }
        }
        applied
    }

    async fn finish_exchange(&mut self) {
        if let Err(e) = send_literal(&mut self.transport, FINISH_REQUEST, self.delimiter).await {
            warn!("sending finish request failed: {:#}", e);
            return;
        }

        // late acks may still be in flight ahead of the reply
        loop {
            match next_frame(&mut self.transport, &mut self.framer).await {
                Ok(Some(frame)) if frame.as_ref() == FINISH_REPLY.as_bytes() => {
                    debug!("finish acknowledged by peer");
                    return;
                }
                Ok(Some(frame)) => {
                    trace!(
                        "draining frame during finish exchange: {:?}",
                        String::from_utf8_lossy(&frame)
                    );
                }
                Ok(None) => {
                    debug!("peer closed during finish exchange");
                    return;
                }
                Err(e) => {
                    warn!("awaiting finish reply failed: {:#}", e);
                    return;
                }
            }
        }
    }

    fn goodput(&self) -> f64 {
        let attempts = self.window.transmit_attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.window.confirmed_delivered() as f64 / attempts as f64
    }

    fn snapshot(&mut self) {
        self.stats.record_snapshot(
            self.window.window_size(),
            self.window.confirmed_delivered(),
            self.window.dropped_len() as u64 + self.window.abandoned_count(),
            self.goodput(),
        );
    }

    fn report(&self) -> FinalReport {
        self.stats.final_report(
            self.window.transmit_attempts(),
            self.window.confirmed_delivered(),
            self.window.dropped_len() as u64 + self.window.abandoned_count(),
            self.goodput(),
            self.window.wrap_count(),
        )
    }
}

/// Drives the receiving role of one session: handshake, frame reassembly,
/// gap tracking, cumulative acknowledgment, finish exchange.
pub struct ReceiverSession<T: Transport> {
    transport: T,
    codec: WireCodec,
    framer: StreamFramer,
    tracker: ReceiveTracker,
    stats: StatsRecorder,
    delimiter: u8,
    snapshot_interval: u64,
    /// Window size last advertised by the peer, for snapshots.
    last_window_hint: u32,
}

impl<T: Transport> ReceiverSession<T> {
    pub fn new(config: &ProtocolConfig, transport: T) -> ReceiverSession<T> {
        ReceiverSession {
            transport,
            codec: config.codec(),
            framer: StreamFramer::new(config.delimiter),
            tracker: ReceiveTracker::new(config.sequence_space()),
            stats: StatsRecorder::new(config.send_window.max_retries),
            delimiter: config.delimiter,
            snapshot_interval: config.snapshot_interval.max(1),
            last_window_hint: 0,
        }
    }

    /// Runs the session until the peer finishes or the transport closes,
    /// returning the (possibly partial) final statistics.
    pub async fn run(mut self) -> anyhow::Result<FinalReport> {
        self.handshake().await?;
        info!("handshake complete - receiving");

        let mut buf = [0u8; RECEIVE_BUF_LEN];
        'session: loop {
            while let Some(frame) = self.framer.next_frame() {
                if frame.as_ref() == FINISH_REQUEST.as_bytes() {
                    debug!("finish requested by peer");
                    if let Err(e) =
                        send_literal(&mut self.transport, FINISH_REPLY, self.delimiter).await
                    {
                        warn!("sending finish reply failed: {:#}", e);
                    }
                    break 'session;
                }
                self.on_frame(&frame).await;
            }

            let n = self
                .transport
                .receive(&mut buf)
                .await
                .context("receiving packets")?;
            if n == 0 {
                warn!("transport closed - reporting partial statistics");
                break;
            }
            self.framer.push(&buf[..n]);
        }

        Ok(self.report())
    }

    async fn handshake(&mut self) -> anyhow::Result<()> {
        let frame = next_frame(&mut self.transport, &mut self.framer)
            .await?
            .ok_or_else(|| anyhow!("transport closed during handshake"))?;
        if frame.as_ref() != HANDSHAKE_REQUEST.as_bytes() {
            bail!(
                "unexpected handshake: {:?}",
                String::from_utf8_lossy(&frame)
            );
        }
        send_literal(&mut self.transport, HANDSHAKE_REPLY, self.delimiter)
            .await
            .context("sending handshake reply")
    }

    async fn on_frame(&mut self, frame: &[u8]) {
        let packet = match self.codec.decode_packet(frame) {
            Ok(packet) => packet,
            Err(e) => {
                // a malformed frame is discarded, the stream continues
                warn!("discarding malformed frame: {}", e);
                return;
            }
        };

        self.last_window_hint = packet.window_hint;
        self.stats.record_retransmission(packet.retransmit_count);

        let ack = self.tracker.ingest(&packet);

        let mut ack_buf = BytesMut::with_capacity(16);
        self.codec.encode_ack(ack, &mut ack_buf);
        if let Err(e) = self.transport.send(&ack_buf).await {
            // the next packet triggers a fresh cumulative ack anyway
            warn!("sending ack #{} failed: {:#}", ack, e);
        }

        if self.tracker.total_count() % self.snapshot_interval == 0 {
            self.snapshot();
        }
    }

    fn snapshot(&mut self) {
        self.stats.record_snapshot(
            self.last_window_hint,
            self.tracker.unique_count(),
            self.tracker.missing_count(),
            self.tracker.goodput(),
        );
    }

    fn report(&self) -> FinalReport {
        self.stats.final_report(
            self.tracker.total_count(),
            self.tracker.unique_count(),
            self.tracker.missing_count(),
            self.tracker.goodput(),
            self.tracker.wrap_count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{NoFaults, ScriptedFaults};
    use crate::send_window::SendWindowConfig;
    use crate::transport::{MockTransport, StreamTransport};
    use mockall::Sequence;
    use rstest::*;
    use tokio::runtime::Builder;

    fn config(target_packets: u64, cadence: u32) -> ProtocolConfig {
        ProtocolConfig {
            send_window: SendWindowConfig {
                retransmit_cadence: cadence,
                ..SendWindowConfig::default()
            },
            snapshot_interval: 16,
            target_packets,
            ..ProtocolConfig::default()
        }
    }

    fn init_logging() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        init_logging();
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[rstest]
    fn test_end_to_end_without_loss() {
        let rt = paused_rt();
        rt.block_on(async {
            let (a, b) = tokio::io::duplex(64 * 1024);
            let config = config(64, 16);

            let sender =
                SenderSession::new(&config, StreamTransport::new(a), Box::new(NoFaults));
            let receiver = ReceiverSession::new(&config, StreamTransport::new(b));

            let (sent, received) = tokio::join!(sender.run(), receiver.run());
            let sent = sent.unwrap();
            let received = received.unwrap();

            assert_eq!(sent.total_sent, 64);
            assert_eq!(sent.unique_delivered, 64);
            assert_eq!(sent.missing_remaining, 0);
            assert_eq!(sent.goodput, 1.0);

            assert_eq!(received.total_sent, 64);
            assert_eq!(received.unique_delivered, 64);
            assert_eq!(received.missing_remaining, 0);
            assert_eq!(received.goodput, 1.0);
            assert!(!received.snapshots.is_empty());
        });
    }

    #[rstest]
    fn test_end_to_end_with_injected_loss() {
        let rt = paused_rt();
        rt.block_on(async {
            let (a, b) = tokio::io::duplex(64 * 1024);
            // seq 2 is eaten by the simulated channel once, then recovered
            // by the first retransmit cycle
            let config = config(6, 4);

            let sender = SenderSession::new(
                &config,
                StreamTransport::new(a),
                Box::new(ScriptedFaults::new([false, false, true])),
            );
            let receiver = ReceiverSession::new(&config, StreamTransport::new(b));

            let (sent, received) = tokio::join!(sender.run(), receiver.run());
            let sent = sent.unwrap();
            let received = received.unwrap();

            // 6 admissions plus one retransmission attempt
            assert_eq!(sent.total_sent, 7);
            assert_eq!(sent.unique_delivered, 6);
            assert_eq!(sent.missing_remaining, 0);
            // the retransmitted packet lands in histogram bucket 1
            assert_eq!(sent.retransmit_histogram[0], 5);
            assert_eq!(sent.retransmit_histogram[1], 1);

            assert_eq!(received.unique_delivered, 6);
            assert_eq!(received.missing_remaining, 0);
            assert_eq!(received.goodput, 1.0);
        });
    }

    #[rstest]
    fn test_end_to_end_with_random_loss_recovers_everything() {
        let rt = paused_rt();
        rt.block_on(async {
            let (a, b) = tokio::io::duplex(256 * 1024);
            let config = config(500, 25);

            let sender = SenderSession::new(
                &config,
                StreamTransport::new(a),
                Box::new(crate::fault::RandomLoss::seeded(0.05, 42)),
            );
            let receiver = ReceiverSession::new(&config, StreamTransport::new(b));

            let (sent, received) = tokio::join!(sender.run(), receiver.run());
            let sent = sent.unwrap();
            let received = received.unwrap();

            // with max_retries 5 and p=0.05 every packet is recovered
            assert_eq!(sent.unique_delivered + sent.missing_remaining, 500);
            assert!(sent.total_sent >= 500);
            assert_eq!(
                received.unique_delivered,
                sent.unique_delivered
            );
            assert!(received.goodput > 0.9 && received.goodput <= 1.0);
        });
    }

    #[rstest]
    fn test_sender_rejects_failed_handshake() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            let mut seq = Sequence::new();
            transport
                .expect_send()
                .times(1)
                .in_sequence(&mut seq)
                .withf(|buf| buf == b"network\n".as_slice())
                .returning(|_| Ok(()));
            transport
                .expect_receive()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|buf| {
                    buf[..5].copy_from_slice(b"nope\n");
                    Ok(5)
                });

            let sender = SenderSession::new(
                &ProtocolConfig::default(),
                transport,
                Box::new(NoFaults),
            );
            let err = sender.run().await.unwrap_err();
            assert!(err.to_string().contains("handshake rejected"));
        });
    }

    #[rstest]
    fn test_receiver_reports_partial_stats_on_eof() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            let mut seq = Sequence::new();
            transport
                .expect_receive()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|buf| {
                    let bytes = b"network\n";
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                });
            transport
                .expect_send()
                .times(1)
                .in_sequence(&mut seq)
                .withf(|buf| buf == b"success\n".as_slice())
                .returning(|_| Ok(()));
            transport
                .expect_receive()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|buf| {
                    let bytes = b"0,4,0\n1,4,0\njunk\n";
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(bytes.len())
                });
            // one ack per decoded packet; the junk frame is skipped
            transport
                .expect_send()
                .times(2)
                .returning(|_| Ok(()));
            transport
                .expect_receive()
                .times(1)
                .returning(|_| Ok(0));

            let receiver =
                ReceiverSession::new(&ProtocolConfig::default(), transport);
            let report = receiver.run().await.unwrap();

            assert_eq!(report.unique_delivered, 2);
            assert_eq!(report.total_sent, 2);
            assert_eq!(report.missing_remaining, 0);
        });
    }

    #[rstest]
    fn test_receiver_rejects_unknown_handshake() {
        let rt = paused_rt();
        rt.block_on(async {
            let mut transport = MockTransport::new();
            transport.expect_receive().times(1).returning(|buf| {
                buf[..6].copy_from_slice(b"hello\n");
                Ok(6)
            });

            let receiver =
                ReceiverSession::new(&ProtocolConfig::default(), transport);
            assert!(receiver.run().await.is_err());
        });
    }

    #[rstest]
    fn test_abandoned_gap_still_terminates() {
        let rt = paused_rt();
        rt.block_on(async {
            let (a, b) = tokio::io::duplex(64 * 1024);
            // seq 2 is dropped on admission and on every retransmission:
            // it must be abandoned and the session must still terminate
            // attempt order: admissions 0..=2, first retransmission of 2,
            // admissions 3..=5, second retransmission of 2
            let script = vec![false, false, true, true, false, false, false, true];
            let config = ProtocolConfig {
                send_window: SendWindowConfig {
                    max_retries: 2,
                    retransmit_cadence: 3,
                    ..SendWindowConfig::default()
                },
                target_packets: 6,
                ..ProtocolConfig::default()
            };

            let sender = SenderSession::new(
                &config,
                StreamTransport::new(a),
                Box::new(ScriptedFaults::new(script)),
            );
            let receiver = ReceiverSession::new(&config, StreamTransport::new(b));

            let (sent, received) = tokio::join!(sender.run(), receiver.run());
            let sent = sent.unwrap();
            let received = received.unwrap();

            assert_eq!(sent.missing_remaining, 1);
            assert_eq!(sent.unique_delivered, 5);
            // the abandoned packet is counted once, in the ceiling bucket
            assert_eq!(sent.retransmit_histogram[2], 1);

            assert_eq!(received.unique_delivered, 5);
            assert_eq!(received.missing_remaining, 1);
            assert_eq!(received.total_sent, 5);
        });
    }
}
