//! Report aggregation and datagram assembly.
//!
//! [`ReportAggregator`] owns the reporter identity, the sequence counter,
//! the session identifier and up to [`MAX_PENDING_RECORDS`] pending spots.
//! It is driven only from the main loop and is not shared with the bus
//! callback, so it carries no locking of its own.
//!
//! Datagram layout, all integers big-endian:
//!
//! ```text
//! 0   u16  version 0x000A
//! 2   u16  total length
//! 4   u32  export time (Unix seconds)
//! 8   u32  sequence number
//! 12  u32  session identifier
//! 16  ...  reporter template, spot template (only with spots),
//!          reporter record, spot batch (only with spots)
//! ```

use heapless::Vec;
use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::SharedBytes;
use crate::config::RelayConfig;
use crate::clock::Clock;
use crate::record::{
    decode_reporter_record, decode_spot_batch, encode_reporter_record, encode_spot_batch,
    ReceivedRecord, ReporterIdentity, MIN_SPOT_LEN, SET_HEADER_LEN,
};
use crate::template::{
    OPTIONS_TEMPLATE_SET_ID, REPORTER_TEMPLATE, REPORTER_TEMPLATE_ID, REPORTER_TEMPLATE_LEN,
    SPOT_TEMPLATE, SPOT_TEMPLATE_ID, SPOT_TEMPLATE_LEN, TEMPLATE_SET_ID,
};
use crate::transport::{Endpoint, Transport, TransportError};
use crate::wire::{DecodeError, EncodeError, Reader, Writer};

pub const MAX_PENDING_RECORDS: usize = 40;
/// Largest datagram assembled; stays below a single unfragmented frame.
pub const MAX_DATAGRAM_SIZE: usize = 1471;
pub const PROTOCOL_VERSION: u16 = 0x000A;
pub const MESSAGE_HEADER_LEN: usize = 16;

// a full list of minimal spots must fit beside the header and templates
const_assert!(
    MESSAGE_HEADER_LEN
        + REPORTER_TEMPLATE_LEN
        + SPOT_TEMPLATE_LEN
        + SET_HEADER_LEN
        + MAX_PENDING_RECORDS * MIN_SPOT_LEN
        <= MAX_DATAGRAM_SIZE
);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no payload supplied")]
    MissingPayload,
    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("pending list holds {} records already", MAX_PENDING_RECORDS)]
    PendingFull,
    #[error("callsign {0} is already pending")]
    DuplicateCallsign(SharedBytes),
    #[error("no records pending")]
    NothingPending,
    #[error("network not connected, {0} pending records discarded")]
    NotConnected(usize),
    #[error("datagram encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}

/// Source of the hardware address used to derive the session identifier.
pub trait DeviceIdentity {
    fn mac_address(&self) -> Option<[u8; 6]>;
}

impl DeviceIdentity for [u8; 6] {
    fn mac_address(&self) -> Option<[u8; 6]> {
        Some(*self)
    }
}

impl DeviceIdentity for Option<[u8; 6]> {
    fn mac_address(&self) -> Option<[u8; 6]> {
        *self
    }
}

/// CRC-32 (IEEE 802.3, reflected).
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in bytes {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

pub fn session_id_from_mac(mac: [u8; 6]) -> u32 {
    crc32(&mac)
}

/// Session identifier for the device: CRC-32 of its MAC address, or 0
/// when the address is unavailable.
pub fn session_id(device: &impl DeviceIdentity) -> u32 {
    device.mac_address().map_or(0, session_id_from_mac)
}

/// Outcome of a successful [`ReportAggregator::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub sequence_number: u32,
    /// Spots carried by the datagram.
    pub records: usize,
    /// Spots dropped because they did not fit the datagram.
    pub discarded: usize,
    pub bytes_written: usize,
    pub endpoint: Endpoint,
}

pub struct ReportAggregator<T, C> {
    identity: ReporterIdentity,
    sequence_number: u32,
    session_id: u32,
    endpoint: Endpoint,
    pending: Vec<ReceivedRecord, MAX_PENDING_RECORDS>,
    transport: T,
    clock: C,
}

impl<T: Transport, C: Clock> ReportAggregator<T, C> {
    pub fn new(session_id: u32, endpoint: Endpoint, transport: T, clock: C) -> Self {
        Self {
            identity: ReporterIdentity::default(),
            sequence_number: 0,
            session_id,
            endpoint,
            pending: Vec::new(),
            transport,
            clock,
        }
    }

    pub fn from_config(config: &RelayConfig, session_id: u32, transport: T, clock: C) -> Self {
        Self::new(session_id, config.endpoint(), transport, clock)
    }

    /// Parses reporter callsign and grid locator, replacing prior values.
    pub fn create_sender_record(&mut self, payload: &[u8]) -> Result<(), ReportError> {
        if payload.is_empty() {
            return Err(ReportError::MissingPayload);
        }
        let mut r = Reader::new(payload);
        let callsign = r.read_length_prefixed()?;
        let grid_locator = r.read_length_prefixed()?;

        self.identity.callsign = SharedBytes::from_bytes(callsign);
        self.identity.grid_locator = SharedBytes::from_bytes(grid_locator);
        debug!(
            "reporter {} at {}",
            self.identity.callsign, self.identity.grid_locator
        );
        Ok(())
    }

    /// Parses the decoding-software string, replacing any prior value.
    pub fn create_sender_software_record(&mut self, payload: &[u8]) -> Result<(), ReportError> {
        if payload.is_empty() {
            return Err(ReportError::MissingPayload);
        }
        let mut r = Reader::new(payload);
        self.identity.software = SharedBytes::from_bytes(r.read_length_prefixed()?);
        debug!("decoding software {}", self.identity.software);
        Ok(())
    }

    /// Parses callsign, frequency (little-endian) and SNR, and queues a
    /// spot stamped with the current time.
    ///
    /// Rejected when the pending list is full or the callsign is already
    /// pending.
    pub fn add_received_record(&mut self, payload: &[u8]) -> Result<(), ReportError> {
        if payload.is_empty() {
            return Err(ReportError::MissingPayload);
        }
        let mut r = Reader::new(payload);
        let callsign = r.read_length_prefixed()?;
        let frequency = r.read_le_u32()?;
        let snr = i8::from_le_bytes([r.read_u8()?]);

        if self.pending.is_full() {
            return Err(ReportError::PendingFull);
        }
        if self.is_pending(callsign) {
            return Err(ReportError::DuplicateCallsign(SharedBytes::from_bytes(callsign)));
        }

        let record = ReceivedRecord::new(
            SharedBytes::from_bytes(callsign),
            frequency,
            snr,
            self.clock.epoch_seconds(),
        );
        debug!(
            "spot {} on {} Hz at {} dB",
            record.callsign, record.frequency, record.snr
        );
        self.pending
            .push(record)
            .map_err(|_| ReportError::PendingFull)
    }

    fn is_pending(&self, callsign: &[u8]) -> bool {
        self.pending
            .iter()
            .any(|record| record.callsign.as_bytes() == callsign)
    }

    /// Assembles and transmits one datagram holding every pending spot.
    ///
    /// The pending list is cleared whether or not the datagram reached
    /// the network; spots are never retried.
    pub fn send(&mut self) -> Result<SendReport, ReportError> {
        if self.pending.is_empty() {
            return Err(ReportError::NothingPending);
        }
        if !self.transport.is_connected() {
            let discarded = self.pending.len();
            self.pending.clear();
            warn!("network down, discarding {} spots", discarded);
            return Err(ReportError::NotConnected(discarded));
        }

        let export_time = self.clock.epoch_seconds();
        let sequence_number = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let count = self.records_that_fit();
        let discarded = self.pending.len() - count;
        let datagram = self.build_datagram(export_time, sequence_number, &self.pending[..count]);
        self.pending.clear();
        if discarded > 0 {
            warn!("{} spots did not fit the datagram and were dropped", discarded);
        }

        let datagram = datagram?;
        let bytes_written = self
            .transport
            .send_datagram(&self.endpoint, datagram.as_bytes())?;
        info!(
            "sent report #{} with {} spots ({} bytes) to {}",
            sequence_number, count, bytes_written, self.endpoint
        );

        Ok(SendReport {
            sequence_number,
            records: count,
            discarded,
            bytes_written,
            endpoint: self.endpoint.clone(),
        })
    }

    /// Length of the longest prefix of pending spots that fits one
    /// datagram next to the header, templates and reporter record.
    fn records_that_fit(&self) -> usize {
        let mut budget = MAX_DATAGRAM_SIZE
            .saturating_sub(MESSAGE_HEADER_LEN)
            .saturating_sub(REPORTER_TEMPLATE_LEN)
            .saturating_sub(SPOT_TEMPLATE_LEN)
            .saturating_sub(self.identity.encoded_len())
            // set header plus worst-case padding
            .saturating_sub(SET_HEADER_LEN + 3);

        let mut count = 0;
        for record in &self.pending {
            let len = record.encoded_len();
            if len > budget {
                break;
            }
            budget -= len;
            count += 1;
        }
        count
    }

    /// Builds the datagram for `records` without touching any state.
    pub fn build_datagram(
        &self,
        export_time: u32,
        sequence_number: u32,
        records: &[ReceivedRecord],
    ) -> Result<SharedBytes, EncodeError> {
        let mut packet = SharedBytes::zeroed(MAX_DATAGRAM_SIZE);
        let len = {
            let mut w = Writer::new(packet.as_mut_slice());
            w.write_be_u16(PROTOCOL_VERSION)?;
            let length_at = w.reserve_be_u16()?;
            w.write_be_u32(export_time)?;
            w.write_be_u32(sequence_number)?;
            w.write_be_u32(self.session_id)?;

            REPORTER_TEMPLATE.encode(&mut w)?;
            if !records.is_empty() {
                SPOT_TEMPLATE.encode(&mut w)?;
            }
            encode_reporter_record(&mut w, &self.identity)?;
            encode_spot_batch(&mut w, records)?;

            let len = w.position();
            let wire_len = u16::try_from(len).map_err(|_| EncodeError::RecordTooLong(len))?;
            w.patch_be_u16(length_at, wire_len)?;
            len
        };
        packet.truncate(len);
        Ok(packet)
    }

    pub fn identity(&self) -> &ReporterIdentity {
        &self.identity
    }

    pub fn pending(&self) -> &[ReceivedRecord] {
        &self.pending
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

/// Fixed header of a report datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub version: u16,
    pub length: u16,
    pub export_time: u32,
    pub sequence_number: u32,
    pub session_id: u32,
}

/// A report datagram taken apart again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDatagram {
    pub header: DatagramHeader,
    /// Template ids of the descriptors found, in order.
    pub templates: std::vec::Vec<u16>,
    pub identity: Option<ReporterIdentity>,
    pub records: std::vec::Vec<ReceivedRecord>,
}

/// Decodes a datagram produced by [`ReportAggregator::build_datagram`].
/// Unknown sets are skipped.
pub fn parse_datagram(bytes: &[u8]) -> Result<ParsedDatagram, DecodeError> {
    let mut r = Reader::new(bytes);
    let header = DatagramHeader {
        version: r.read_be_u16()?,
        length: r.read_be_u16()?,
        export_time: r.read_be_u32()?,
        sequence_number: r.read_be_u32()?,
        session_id: r.read_be_u32()?,
    };
    if usize::from(header.length) != bytes.len() {
        return Err(DecodeError::InvalidLength(usize::from(header.length)));
    }

    let mut parsed = ParsedDatagram {
        header,
        templates: std::vec::Vec::new(),
        identity: None,
        records: std::vec::Vec::new(),
    };

    while !r.is_empty() {
        let mut peek = r;
        let set_id = peek.read_be_u16()?;
        let set_len = usize::from(peek.read_be_u16()?);
        if set_len < SET_HEADER_LEN {
            return Err(DecodeError::InvalidLength(set_len));
        }
        match set_id {
            TEMPLATE_SET_ID | OPTIONS_TEMPLATE_SET_ID => {
                let mut set = Reader::new(r.read_exact(set_len)?);
                set.read_exact(SET_HEADER_LEN)?;
                parsed.templates.push(set.read_be_u16()?);
            }
            REPORTER_TEMPLATE_ID => parsed.identity = Some(decode_reporter_record(&mut r)?),
            SPOT_TEMPLATE_ID => parsed.records = decode_spot_batch(&mut r)?,
            _ => {
                r.read_exact(set_len)?;
            }
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::RecordingTransport;

    const NOW: u32 = 1_700_000_000;

    fn aggregator() -> (
        ReportAggregator<RecordingTransport, ManualClock>,
        RecordingTransport,
    ) {
        let transport = RecordingTransport::new();
        let aggregator = ReportAggregator::new(
            0x1234_5678,
            Endpoint::new("localhost", 14739),
            transport.clone(),
            ManualClock::new(NOW),
        );
        (aggregator, transport)
    }

    fn spot_payload(callsign: &str, frequency: u32, snr: i8) -> std::vec::Vec<u8> {
        let mut payload = vec![callsign.len() as u8];
        payload.extend_from_slice(callsign.as_bytes());
        payload.extend_from_slice(&frequency.to_le_bytes());
        payload.push(snr as u8);
        payload
    }

    #[test]
    fn test_crc32_reference_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_session_id_from_mac() {
        let mac = [0x24, 0x6F, 0x28, 0x01, 0x02, 0x03];
        assert_eq!(session_id(&mac), crc32(&mac));
        assert_eq!(session_id_from_mac(mac), session_id(&Some(mac)));
        assert_eq!(session_id(&None::<[u8; 6]>), 0);
    }

    #[test]
    fn test_sender_record_parsing() {
        let (mut agg, _) = aggregator();
        agg.create_sender_record(b"\x05G8KIG\x06IO91iq\x00\x00").unwrap();
        assert_eq!(agg.identity().callsign, "G8KIG");
        assert_eq!(agg.identity().grid_locator, "IO91iq");

        agg.create_sender_software_record(b"\x04Test").unwrap();
        assert_eq!(agg.identity().software, "Test");
    }

    #[test]
    fn test_missing_payload() {
        let (mut agg, _) = aggregator();
        assert!(matches!(
            agg.create_sender_record(&[]),
            Err(ReportError::MissingPayload)
        ));
        assert!(matches!(
            agg.add_received_record(&[]),
            Err(ReportError::MissingPayload)
        ));
    }

    #[test]
    fn test_truncated_payload_leaves_state() {
        let (mut agg, _) = aggregator();
        agg.create_sender_record(b"\x05G8KIG\x06IO91iq").unwrap();
        let err = agg.create_sender_record(b"\x04M0XX\x09IO9").unwrap_err();
        assert!(matches!(err, ReportError::Decode(DecodeError::UnexpectedEof)));
        assert_eq!(agg.identity().callsign, "G8KIG");

        let err = agg.add_received_record(b"\x05K1ABC\x01\x02").unwrap_err();
        assert!(matches!(err, ReportError::Decode(_)));
        assert!(agg.pending().is_empty());
    }

    #[test]
    fn test_received_record_fields() {
        let (mut agg, _) = aggregator();
        agg.add_received_record(&spot_payload("K1ABC", 14_074_000, -12))
            .unwrap();
        let record = &agg.pending()[0];
        assert_eq!(record.callsign, "K1ABC");
        assert_eq!(record.frequency, 14_074_000);
        assert_eq!(record.snr, -12);
        assert_eq!(record.mode, "FT8");
        assert_eq!(record.info_source, 1);
        assert_eq!(record.flow_start_seconds, NOW);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut agg, _) = aggregator();
        agg.add_received_record(&spot_payload("K1ABC", 7_074_000, 0))
            .unwrap();
        let err = agg
            .add_received_record(&spot_payload("K1ABC", 14_074_000, 5))
            .unwrap_err();
        assert!(matches!(err, ReportError::DuplicateCallsign(_)));
        assert_eq!(agg.pending().len(), 1);
    }

    #[test]
    fn test_send_with_nothing_pending() {
        let (mut agg, transport) = aggregator();
        assert!(matches!(agg.send(), Err(ReportError::NothingPending)));
        assert_eq!(agg.sequence_number(), 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_send_while_disconnected_discards() {
        let (mut agg, transport) = aggregator();
        transport.set_connected(false);
        agg.add_received_record(&spot_payload("K1ABC", 7_074_000, 0))
            .unwrap();

        assert!(matches!(agg.send(), Err(ReportError::NotConnected(1))));
        assert!(agg.pending().is_empty());
        assert_eq!(agg.sequence_number(), 0);
    }

    #[test]
    fn test_transport_failure_still_clears() {
        let (mut agg, transport) = aggregator();
        transport.set_fail_writes(true);
        agg.add_received_record(&spot_payload("K1ABC", 7_074_000, 0))
            .unwrap();

        assert!(matches!(agg.send(), Err(ReportError::Transport(_))));
        assert!(agg.pending().is_empty());
        assert_eq!(agg.sequence_number(), 1);
    }

    #[test]
    fn test_datagram_without_records_omits_spot_sets() {
        let (agg, _) = aggregator();
        let datagram = agg.build_datagram(NOW, 7, &[]).unwrap();
        let parsed = parse_datagram(datagram.as_bytes()).unwrap();
        assert_eq!(parsed.templates, vec![REPORTER_TEMPLATE_ID]);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.header.sequence_number, 7);
        assert_eq!(parsed.header.session_id, 0x1234_5678);
    }

    #[test]
    fn test_capacity_limit() {
        let (mut agg, _) = aggregator();
        for i in 0..MAX_PENDING_RECORDS {
            agg.add_received_record(&spot_payload(&format!("G8KIG-{}", i), 14_031_000, 0))
                .unwrap();
        }
        let err = agg
            .add_received_record(&spot_payload("G8KIG-40", 14_031_000, 0))
            .unwrap_err();
        assert!(matches!(err, ReportError::PendingFull));
        assert_eq!(agg.pending().len(), MAX_PENDING_RECORDS);
    }

    #[test]
    fn test_end_to_end_datagram() {
        let (mut agg, transport) = aggregator();
        agg.create_sender_record(b"\x05G8KIG\x06IO91iq").unwrap();
        agg.create_sender_software_record(b"\x04Test").unwrap();
        agg.add_received_record(&spot_payload("G8KIG-0", 14_031_000, -10))
            .unwrap();

        let report = agg.send().unwrap();
        assert_eq!(report.sequence_number, 0);
        assert_eq!(report.records, 1);
        assert_eq!(report.discarded, 0);
        assert!(agg.pending().is_empty());

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        let bytes = &sent[0].bytes;
        assert_eq!(report.bytes_written, bytes.len());
        assert_eq!(&bytes[..2], &[0x00, 0x0A]);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        assert_eq!(&bytes[4..8], &NOW.to_be_bytes());
        assert_eq!(&bytes[12..16], &0x1234_5678u32.to_be_bytes());

        let parsed = parse_datagram(bytes).unwrap();
        assert_eq!(parsed.templates, vec![REPORTER_TEMPLATE_ID, SPOT_TEMPLATE_ID]);
        let identity = parsed.identity.unwrap();
        assert_eq!(identity.callsign, "G8KIG");
        assert_eq!(identity.grid_locator, "IO91iq");
        assert_eq!(identity.software, "Test");
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].callsign, "G8KIG-0");
        assert_eq!(parsed.records[0].frequency, 14_031_000);
        assert_eq!(parsed.records[0].snr, -10);
        assert_eq!(parsed.records[0].flow_start_seconds, NOW);
    }

    #[test]
    fn test_sequence_increments_per_datagram() {
        let (mut agg, transport) = aggregator();
        for expected in 0..3u32 {
            agg.add_received_record(&spot_payload("K1ABC", 7_074_000, 1))
                .unwrap();
            assert_eq!(agg.send().unwrap().sequence_number, expected);
        }
        let sequences: std::vec::Vec<u32> = transport
            .sent()
            .iter()
            .map(|d| parse_datagram(&d.bytes).unwrap().header.sequence_number)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_oversized_batch_is_trimmed() {
        let (mut agg, transport) = aggregator();
        agg.create_sender_record(b"\x05G8KIG\x06IO91iq").unwrap();
        agg.create_sender_software_record(b"\x19DX FT8 Transceiver (Test)")
            .unwrap();
        for i in 0..MAX_PENDING_RECORDS {
            let callsign = format!("VERYLONGCALL{:02}/P/QRP/XX", i);
            agg.add_received_record(&spot_payload(&callsign, 14_074_000, 0))
                .unwrap();
        }

        let report = agg.send().unwrap();
        assert!(report.discarded > 0);
        assert_eq!(report.records + report.discarded, MAX_PENDING_RECORDS);

        let sent = transport.sent();
        assert!(sent[0].bytes.len() <= MAX_DATAGRAM_SIZE);
        let parsed = parse_datagram(&sent[0].bytes).unwrap();
        assert_eq!(parsed.records.len(), report.records);
    }
}
