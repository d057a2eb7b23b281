use crate::bus::BusBridge;
use crate::clock::{Clock, RtcTime, TimeOfDay};
use crate::config::RelayConfig;
use crate::mailbox::{Delivery, Mailbox, MailboxConsumer, MailboxProducer, Operation};
use crate::reporter::{ReportAggregator, ReportError, SendReport};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub processed: u32,
    pub spots_accepted: u32,
    pub spots_rejected: u32,
    pub datagrams_sent: u32,
    pub send_failures: u32,
    /// Bus requests dropped because the mailbox was full.
    pub dropped: u32,
}

/// What handling one mailbox item led to.
#[derive(Debug)]
pub enum Outcome {
    TimeUpdated(RtcTime),
    IdentityUpdated,
    SpotAccepted,
    Sent(SendReport),
    Failed(ReportError),
}

#[derive(Debug)]
pub struct Dispatch {
    pub slot: usize,
    pub operation: Operation,
    pub outcome: Outcome,
}

/// Consumer side of the relay: owns the aggregator and runs the
/// periodic work of the main loop.
///
/// All aggregator state is touched only from [`RelayAgent::tick`], so it
/// needs no locking. Bus callbacks reach the agent only through the
/// [`BusBridge`] handed out by [`RelayAgent::bridge`].
pub struct RelayAgent<T, C> {
    config: RelayConfig,
    reporter: ReportAggregator<T, C>,
    producer: MailboxProducer,
    consumer: MailboxConsumer,
    time_of_day: TimeOfDay,
    stats: RelayStats,
    last_time_refresh_ms: Option<u64>,
    last_send_request_ms: u64,
}

impl<T: Transport, C: Clock> RelayAgent<T, C> {
    pub fn new(config: RelayConfig, reporter: ReportAggregator<T, C>) -> Self {
        let (producer, consumer) = Mailbox::new();
        Self {
            config,
            reporter,
            producer,
            consumer,
            time_of_day: TimeOfDay::new(),
            stats: RelayStats::default(),
            last_time_refresh_ms: None,
            last_send_request_ms: 0,
        }
    }

    /// A bus callback handle feeding this agent.
    pub fn bridge(&self) -> BusBridge {
        BusBridge::new(self.producer.clone(), self.time_of_day.clone())
    }

    /// One pass of the main loop at monotonic time `now_ms`. Handles at
    /// most one mailbox item and never waits for one.
    pub fn tick(&mut self, now_ms: u64) -> Option<Dispatch> {
        self.refresh_time(now_ms);
        self.request_periodic_send(now_ms);
        self.process_one()
    }

    fn refresh_time(&mut self, now_ms: u64) {
        let due = match self.last_time_refresh_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.config.time_refresh_ms,
        };
        if !due {
            return;
        }
        self.last_time_refresh_ms = Some(now_ms);

        // all zeros tells the bus master the time is not valid
        let clock = self.reporter.clock();
        if clock.is_synchronized() {
            self.time_of_day
                .set(RtcTime::from_epoch(clock.epoch_seconds()));
        } else {
            self.time_of_day.clear();
        }
    }

    fn request_periodic_send(&mut self, now_ms: u64) {
        let interval_ms = self.config.send_interval_secs.saturating_mul(1000);
        if now_ms.saturating_sub(self.last_send_request_ms) < interval_ms {
            return;
        }
        self.last_send_request_ms = now_ms;
        debug!("periodic send request");
        if let Err(err) = self.producer.post(Operation::SendRequest, &[]) {
            warn!("periodic send request dropped: {}", err);
        }
    }

    fn process_one(&mut self) -> Option<Dispatch> {
        let reporter = &mut self.reporter;
        let time_of_day = &self.time_of_day;
        let (delivery, outcome) = match self
            .consumer
            .poll(|delivery| handle(reporter, time_of_day, delivery))
        {
            Ok(done) => done,
            Err(nb::Error::WouldBlock) => return None,
            Err(nb::Error::Other(err)) => {
                warn!("mailbox poll failed: {}", err);
                return None;
            }
        };

        self.record(delivery.operation, &outcome);
        Some(Dispatch {
            slot: delivery.slot,
            operation: delivery.operation,
            outcome,
        })
    }

    fn record(&mut self, operation: Operation, outcome: &Outcome) {
        self.stats.processed += 1;
        match (operation, outcome) {
            (_, Outcome::SpotAccepted) => self.stats.spots_accepted += 1,
            (_, Outcome::Sent(_)) => self.stats.datagrams_sent += 1,
            (Operation::ReceivedRecord, Outcome::Failed(err)) => {
                self.stats.spots_rejected += 1;
                debug!("spot rejected: {}", err);
            }
            (Operation::SendRequest, Outcome::Failed(ReportError::NothingPending)) => {
                debug!("send request with nothing pending");
            }
            (Operation::SendRequest, Outcome::Failed(err)) => {
                self.stats.send_failures += 1;
                warn!("send failed: {}", err);
            }
            (_, Outcome::Failed(err)) => warn!("{:?} failed: {}", operation, err),
            _ => {}
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            dropped: self.consumer.dropped(),
            ..self.stats
        }
    }

    pub fn reporter(&self) -> &ReportAggregator<T, C> {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut ReportAggregator<T, C> {
        &mut self.reporter
    }

    pub fn time_of_day(&self) -> &TimeOfDay {
        &self.time_of_day
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Items waiting in or being handled by the mailbox.
    pub fn backlog(&self) -> usize {
        self.consumer.in_use()
    }
}

fn handle<T: Transport, C: Clock>(
    reporter: &mut ReportAggregator<T, C>,
    time_of_day: &TimeOfDay,
    delivery: &Delivery,
) -> Outcome {
    let payload = delivery.bytes();
    let result = match delivery.operation {
        Operation::TimeRequest => {
            return match RtcTime::from_bytes(payload) {
                Some(time) => {
                    time_of_day.set(time);
                    Outcome::TimeUpdated(time)
                }
                None => Outcome::Failed(ReportError::MissingPayload),
            };
        }
        Operation::SenderRecord => reporter
            .create_sender_record(payload)
            .map(|()| Outcome::IdentityUpdated),
        Operation::SenderSoftwareRecord => reporter
            .create_sender_software_record(payload)
            .map(|()| Outcome::IdentityUpdated),
        Operation::ReceivedRecord => reporter
            .add_received_record(payload)
            .map(|()| Outcome::SpotAccepted),
        Operation::SendRequest => reporter.send().map(|report| {
            info!(
                "report #{} delivered, {} spots",
                report.sequence_number, report.records
            );
            Outcome::Sent(report)
        }),
    };
    result.unwrap_or_else(Outcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{received_payload, sender_payload, software_payload, time_payload};
    use crate::clock::ManualClock;
    use crate::record::ReporterIdentity;
    use crate::reporter::parse_datagram;
    use crate::transport::{Endpoint, RecordingTransport};

    const NOW: u32 = 1_700_000_000;

    fn agent() -> (
        RelayAgent<RecordingTransport, ManualClock>,
        RecordingTransport,
        ManualClock,
    ) {
        let transport = RecordingTransport::new();
        let clock = ManualClock::new(NOW);
        let reporter = ReportAggregator::new(
            7,
            Endpoint::new("localhost", 14739),
            transport.clone(),
            clock.clone(),
        );
        (
            RelayAgent::new(RelayConfig::default(), reporter),
            transport,
            clock,
        )
    }

    fn transaction(operation: Operation, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![operation as u8];
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_idle_tick() {
        let (mut agent, _, _) = agent();
        assert!(agent.tick(0).is_none());
        assert_eq!(agent.stats(), RelayStats::default());
    }

    #[test]
    fn test_one_item_per_tick() {
        let (mut agent, _, _) = agent();
        let bridge = agent.bridge();
        for call in ["K1ABC", "K1ABD"] {
            let payload = received_payload(call, 7_074_000, 3).unwrap();
            bridge
                .on_receive(&transaction(Operation::ReceivedRecord, &payload))
                .unwrap();
        }

        assert!(matches!(
            agent.tick(1).unwrap().outcome,
            Outcome::SpotAccepted
        ));
        assert_eq!(agent.backlog(), 1);
        assert!(agent.tick(2).is_some());
        assert!(agent.tick(3).is_none());
        assert_eq!(agent.reporter().pending().len(), 2);
    }

    #[test]
    fn test_full_cycle_through_bridge() {
        let (mut agent, transport, _) = agent();
        let bridge = agent.bridge();

        let sender = sender_payload("G8KIG", "IO91iq").unwrap();
        bridge.on_receive(&transaction(Operation::SenderRecord, &sender));
        let software = software_payload("DX FT8 Transceiver (Test)").unwrap();
        bridge.on_receive(&transaction(Operation::SenderSoftwareRecord, &software));
        for i in 0..10 {
            let spot = received_payload(&format!("G8KIG-{}", i), 14_031_000, -10).unwrap();
            bridge.on_receive(&transaction(Operation::ReceivedRecord, &spot));
        }
        bridge.on_receive(&[Operation::SendRequest as u8]);

        let mut last = None;
        for t in 1..=13 {
            last = agent.tick(t);
        }
        let dispatch = last.unwrap();
        assert_eq!(dispatch.operation, Operation::SendRequest);
        let Outcome::Sent(report) = dispatch.outcome else {
            panic!("expected a sent report");
        };
        assert_eq!(report.records, 10);

        let stats = agent.stats();
        assert_eq!(stats.processed, 13);
        assert_eq!(stats.spots_accepted, 10);
        assert_eq!(stats.datagrams_sent, 1);

        let sent = transport.sent();
        let parsed = parse_datagram(&sent[0].bytes).unwrap();
        let identity = parsed.identity.unwrap();
        assert_eq!(identity.software, "DX FT8 Transceiver (Test)");
        assert_eq!(parsed.records.len(), 10);
        assert_eq!(parsed.records[9].callsign, "G8KIG-9");
    }

    #[test]
    fn test_rejected_spot_counted() {
        let (mut agent, _, _) = agent();
        let bridge = agent.bridge();
        let spot = received_payload("K1ABC", 7_074_000, 0).unwrap();
        bridge.on_receive(&transaction(Operation::ReceivedRecord, &spot));
        bridge.on_receive(&transaction(Operation::ReceivedRecord, &spot));

        agent.tick(1);
        let dispatch = agent.tick(2).unwrap();
        assert!(matches!(
            dispatch.outcome,
            Outcome::Failed(ReportError::DuplicateCallsign(_))
        ));
        assert_eq!(agent.stats().spots_rejected, 1);
    }

    #[test]
    fn test_periodic_send() {
        let (mut agent, transport, _) = agent();
        let bridge = agent.bridge();
        let spot = received_payload("K1ABC", 7_074_000, 0).unwrap();
        bridge.on_receive(&transaction(Operation::ReceivedRecord, &spot));

        agent.tick(10);
        assert!(agent.tick(299_999).is_none());

        let dispatch = agent.tick(300_000).unwrap();
        assert!(matches!(dispatch.outcome, Outcome::Sent(_)));
        assert_eq!(transport.sent().len(), 1);

        // the next request is a full interval later
        assert!(agent.tick(300_001).is_none());
        let dispatch = agent.tick(600_000).unwrap();
        assert!(matches!(
            dispatch.outcome,
            Outcome::Failed(ReportError::NothingPending)
        ));
        assert_eq!(agent.stats().send_failures, 0);
    }

    #[test]
    fn test_disconnected_send_counts_failure() {
        let (mut agent, transport, _) = agent();
        transport.set_connected(false);
        let bridge = agent.bridge();
        let spot = received_payload("K1ABC", 7_074_000, 0).unwrap();
        bridge.on_receive(&transaction(Operation::ReceivedRecord, &spot));
        bridge.on_receive(&[Operation::SendRequest as u8]);

        agent.tick(1);
        agent.tick(2);
        assert_eq!(agent.stats().send_failures, 1);
        assert!(agent.reporter().pending().is_empty());
    }

    #[test]
    fn test_time_refresh() {
        let (mut agent, _, clock) = agent();
        let bridge = agent.bridge();

        agent.tick(0);
        assert_eq!(bridge.on_request(), RtcTime::from_epoch(NOW).to_bytes());

        clock.advance(1);
        agent.tick(100);
        assert_eq!(bridge.on_request(), RtcTime::from_epoch(NOW).to_bytes());
        agent.tick(500);
        assert_eq!(bridge.on_request(), RtcTime::from_epoch(NOW + 1).to_bytes());
    }

    #[test]
    fn test_time_zeroed_while_unsynchronized() {
        let (mut agent, _, clock) = agent();
        clock.set_synchronized(false);
        let bridge = agent.bridge();

        agent.tick(0);
        assert_eq!(bridge.on_request(), [0; 7]);

        // a value stored by the master lasts until the next refresh
        let time = RtcTime::from_epoch(946_684_800);
        bridge.on_receive(&transaction(Operation::TimeRequest, &time_payload(&time)));
        let dispatch = agent.tick(1).unwrap();
        assert!(matches!(dispatch.outcome, Outcome::TimeUpdated(t) if t == time));
        assert_eq!(agent.time_of_day().get(), time);

        agent.tick(500);
        assert_eq!(bridge.on_request(), [0; 7]);

        clock.set_synchronized(true);
        agent.tick(1000);
        assert_eq!(bridge.on_request(), RtcTime::from_epoch(NOW).to_bytes());
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        let (mut agent, _, _) = agent();
        let bridge = agent.bridge();

        // length prefixes claim more bytes than were written
        bridge.on_receive(&[Operation::ReceivedRecord as u8, 5, b'K', b'1']);
        bridge.on_receive(&[Operation::SenderRecord as u8, 5, b'G', b'8']);
        bridge.on_receive(&[Operation::SenderSoftwareRecord as u8, 9, b'W']);

        let spot = agent.tick(1).unwrap();
        assert!(matches!(spot.outcome, Outcome::Failed(ReportError::Decode(_))));
        let sender = agent.tick(2).unwrap();
        assert!(matches!(sender.outcome, Outcome::Failed(ReportError::Decode(_))));
        let software = agent.tick(3).unwrap();
        assert!(matches!(software.outcome, Outcome::Failed(ReportError::Decode(_))));

        assert!(agent.reporter().pending().is_empty());
        assert_eq!(agent.reporter().identity(), &ReporterIdentity::default());
        assert_eq!(agent.stats().spots_rejected, 1);
        assert_eq!(agent.stats().spots_accepted, 0);
    }

    #[test]
    fn test_short_spot_missing_frequency_rejected() {
        let (mut agent, _, _) = agent();
        let bridge = agent.bridge();
        bridge.on_receive(&[Operation::ReceivedRecord as u8, 2, b'K', b'1', 0x10]);

        let dispatch = agent.tick(1).unwrap();
        assert!(matches!(dispatch.outcome, Outcome::Failed(ReportError::Decode(_))));
        assert!(agent.reporter().pending().is_empty());
    }

    #[test]
    fn test_dropped_requests_reported() {
        let (agent, _, _) = agent();
        let bridge = agent.bridge();
        for _ in 0..25 {
            bridge.on_receive(&[Operation::SendRequest as u8]);
        }
        assert_eq!(agent.stats().dropped, 5);
    }
}
