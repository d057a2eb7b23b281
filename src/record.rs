//! Report records and their stateless encoders.
//!
//! Two data sets follow the template descriptors in every datagram: the
//! reporter-identity record (set id `0x9992`) and the received-spot
//! batch (set id `0x9993`). Both start with a two-byte set id and a
//! two-byte length, and are zero-padded to a four-byte boundary. The
//! length field always holds the padded length.

use crate::buffer::SharedBytes;
use crate::template::{REPORTER_TEMPLATE_ID, SPOT_TEMPLATE_ID};
use crate::wire::{DecodeError, EncodeError, Reader, Writer};

pub const DEFAULT_MODE: &str = "FT8";

/// Information source value for automatically decoded spots.
pub const INFO_SOURCE_AUTOMATIC: u8 = 1;

/// Set id and length field.
pub const SET_HEADER_LEN: usize = 4;

/// Smallest possible encoded spot: empty callsign and mode.
pub const MIN_SPOT_LEN: usize = 1 + 4 + 1 + 1 + 1 + 4;

/// One decoded station heard by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRecord {
    pub callsign: SharedBytes,
    /// Receiver-tuned frequency in Hz.
    pub frequency: u32,
    /// Signal-to-noise ratio in dB.
    pub snr: i8,
    pub mode: SharedBytes,
    pub info_source: u8,
    /// Unix seconds at which the record was created.
    pub flow_start_seconds: u32,
}

impl ReceivedRecord {
    pub fn new(callsign: SharedBytes, frequency: u32, snr: i8, flow_start_seconds: u32) -> Self {
        Self {
            callsign,
            frequency,
            snr,
            mode: SharedBytes::from(DEFAULT_MODE),
            info_source: INFO_SOURCE_AUTOMATIC,
            flow_start_seconds,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.callsign.len() + 4 + 1 + 1 + self.mode.len() + 1 + 4
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<usize, EncodeError> {
        let start = w.position();
        w.write_length_prefixed(self.callsign.as_bytes())?;
        w.write_be_u32(self.frequency)?;
        w.write_u8(self.snr.to_be_bytes()[0])?;
        w.write_length_prefixed(self.mode.as_bytes())?;
        w.write_u8(self.info_source)?;
        w.write_be_u32(self.flow_start_seconds)?;
        Ok(w.position() - start)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let callsign = SharedBytes::from_bytes(r.read_length_prefixed()?);
        let frequency = r.read_be_u32()?;
        let snr = i8::from_be_bytes([r.read_u8()?]);
        let mode = SharedBytes::from_bytes(r.read_length_prefixed()?);
        let info_source = r.read_u8()?;
        let flow_start_seconds = r.read_be_u32()?;
        Ok(Self {
            callsign,
            frequency,
            snr,
            mode,
            info_source,
            flow_start_seconds,
        })
    }
}

/// Who is submitting the spots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReporterIdentity {
    pub callsign: SharedBytes,
    pub grid_locator: SharedBytes,
    pub software: SharedBytes,
}

impl ReporterIdentity {
    /// Padded length of the encoded reporter record.
    pub fn encoded_len(&self) -> usize {
        crate::template::pad4(
            SET_HEADER_LEN
                + 3
                + self.callsign.len()
                + self.grid_locator.len()
                + self.software.len(),
        )
    }
}

fn finish_set(w: &mut Writer<'_>, start: usize, length_at: usize) -> Result<usize, EncodeError> {
    w.pad_to_word(start)?;
    let len = w.position() - start;
    let wire_len = u16::try_from(len).map_err(|_| EncodeError::RecordTooLong(len))?;
    w.patch_be_u16(length_at, wire_len)?;
    Ok(len)
}

/// Encodes the reporter-identity record. Returns the padded length.
pub fn encode_reporter_record(
    w: &mut Writer<'_>,
    identity: &ReporterIdentity,
) -> Result<usize, EncodeError> {
    let start = w.position();
    w.write_be_u16(REPORTER_TEMPLATE_ID)?;
    let length_at = w.reserve_be_u16()?;
    w.write_length_prefixed(identity.callsign.as_bytes())?;
    w.write_length_prefixed(identity.grid_locator.as_bytes())?;
    w.write_length_prefixed(identity.software.as_bytes())?;
    finish_set(w, start, length_at)
}

/// Encodes all `records` as one batch. An empty slice writes nothing and
/// returns 0.
pub fn encode_spot_batch(
    w: &mut Writer<'_>,
    records: &[ReceivedRecord],
) -> Result<usize, EncodeError> {
    if records.is_empty() {
        return Ok(0);
    }
    let start = w.position();
    w.write_be_u16(SPOT_TEMPLATE_ID)?;
    let length_at = w.reserve_be_u16()?;
    for record in records {
        record.encode(w)?;
    }
    finish_set(w, start, length_at)
}

/// Padded length of a batch holding `records`, 0 when empty.
pub fn spot_batch_len(records: &[ReceivedRecord]) -> usize {
    if records.is_empty() {
        return 0;
    }
    crate::template::pad4(
        SET_HEADER_LEN + records.iter().map(ReceivedRecord::encoded_len).sum::<usize>(),
    )
}

fn read_set_header(r: &mut Reader<'_>, expected: u16) -> Result<usize, DecodeError> {
    let tag = r.read_be_u16()?;
    if tag != expected {
        return Err(DecodeError::InvalidTag(tag));
    }
    let len = r.read_be_u16()? as usize;
    if len < SET_HEADER_LEN || len % 4 != 0 {
        return Err(DecodeError::InvalidLength(len));
    }
    Ok(len - SET_HEADER_LEN)
}

pub fn decode_reporter_record(r: &mut Reader<'_>) -> Result<ReporterIdentity, DecodeError> {
    let body_len = read_set_header(r, REPORTER_TEMPLATE_ID)?;
    let mut body = Reader::new(r.read_exact(body_len)?);
    Ok(ReporterIdentity {
        callsign: SharedBytes::from_bytes(body.read_length_prefixed()?),
        grid_locator: SharedBytes::from_bytes(body.read_length_prefixed()?),
        software: SharedBytes::from_bytes(body.read_length_prefixed()?),
    })
}

pub fn decode_spot_batch(r: &mut Reader<'_>) -> Result<Vec<ReceivedRecord>, DecodeError> {
    let body_len = read_set_header(r, SPOT_TEMPLATE_ID)?;
    let mut body = Reader::new(r.read_exact(body_len)?);
    let mut records = Vec::new();
    // anything shorter than a minimal record is trailing padding
    while body.remaining() >= MIN_SPOT_LEN {
        records.push(ReceivedRecord::decode(&mut body)?);
    }
    Ok(records)
}
