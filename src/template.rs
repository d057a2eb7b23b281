//! Template descriptors for the report wire format.
//!
//! The aggregation service uses IPFIX-style templates: a set header, a
//! template header and one field specifier per information element.
//! Each template is declared as data here and turned into bytes by
//! [`TemplateSpec::encode`].

use crate::wire::{EncodeError, Writer};
use static_assertions::const_assert_eq;

/// Private enterprise number for the reporting service's information elements.
pub const ENTERPRISE_NUMBER: u32 = 30351;

/// Field length marker for variable-length (length-prefixed) elements.
pub const VARIABLE_LENGTH: u16 = 0xFFFF;

pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;

/// Template id of the reporter-identity record; also its data set id.
pub const REPORTER_TEMPLATE_ID: u16 = 0x9992;
/// Template id of the received-spot batch; also its data set id.
pub const SPOT_TEMPLATE_ID: u16 = 0x9993;

const ENTERPRISE_BIT: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLength {
    Variable,
    Fixed(u16),
}

impl FieldLength {
    const fn wire_value(self) -> u16 {
        match self {
            FieldLength::Variable => VARIABLE_LENGTH,
            FieldLength::Fixed(len) => len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub element_id: u16,
    pub length: FieldLength,
    pub enterprise: Option<u32>,
}

impl FieldSpec {
    pub const fn enterprise(element_id: u16, length: FieldLength) -> Self {
        Self {
            element_id,
            length,
            enterprise: Some(ENTERPRISE_NUMBER),
        }
    }

    pub const fn standard(element_id: u16, length: FieldLength) -> Self {
        Self {
            element_id,
            length,
            enterprise: None,
        }
    }

    const fn encoded_len(&self) -> usize {
        if self.enterprise.is_some() {
            8
        } else {
            4
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Data,
    Options { scope_field_count: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateSpec {
    pub kind: TemplateKind,
    pub template_id: u16,
    pub fields: &'static [FieldSpec],
}

impl TemplateSpec {
    pub const fn set_id(&self) -> u16 {
        match self.kind {
            TemplateKind::Data => TEMPLATE_SET_ID,
            TemplateKind::Options { .. } => OPTIONS_TEMPLATE_SET_ID,
        }
    }

    /// Total descriptor length including the set header and padding.
    pub const fn encoded_len(&self) -> usize {
        let mut len = 4 + match self.kind {
            TemplateKind::Data => 4,
            TemplateKind::Options { .. } => 6,
        };
        let mut i = 0;
        while i < self.fields.len() {
            len += self.fields[i].encoded_len();
            i += 1;
        }
        pad4(len)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<usize, EncodeError> {
        let len = self.encoded_len();
        if w.remaining() < len {
            return Err(EncodeError::BufferTooSmall);
        }
        let start = w.position();
        let field_count =
            u16::try_from(self.fields.len()).map_err(|_| EncodeError::RecordTooLong(len))?;

        w.write_be_u16(self.set_id())?;
        w.write_be_u16(u16::try_from(len).map_err(|_| EncodeError::RecordTooLong(len))?)?;
        w.write_be_u16(self.template_id)?;
        w.write_be_u16(field_count)?;
        if let TemplateKind::Options { scope_field_count } = self.kind {
            w.write_be_u16(scope_field_count)?;
        }

        for field in self.fields {
            match field.enterprise {
                Some(number) => {
                    w.write_be_u16(field.element_id | ENTERPRISE_BIT)?;
                    w.write_be_u16(field.length.wire_value())?;
                    w.write_be_u32(number)?;
                }
                None => {
                    w.write_be_u16(field.element_id)?;
                    w.write_be_u16(field.length.wire_value())?;
                }
            }
        }
        w.pad_to_word(start)?;
        Ok(w.position() - start)
    }
}

/// Rounds `len` up to the next multiple of four.
pub const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Reporter callsign, grid locator and decoding software.
pub const REPORTER_TEMPLATE: TemplateSpec = TemplateSpec {
    kind: TemplateKind::Options {
        scope_field_count: 0,
    },
    template_id: REPORTER_TEMPLATE_ID,
    fields: &[
        FieldSpec::enterprise(2, FieldLength::Variable),
        FieldSpec::enterprise(4, FieldLength::Variable),
        FieldSpec::enterprise(8, FieldLength::Variable),
    ],
};

/// Spotted callsign, frequency, SNR, mode, information source and
/// flow start seconds.
pub const SPOT_TEMPLATE: TemplateSpec = TemplateSpec {
    kind: TemplateKind::Data,
    template_id: SPOT_TEMPLATE_ID,
    fields: &[
        FieldSpec::enterprise(1, FieldLength::Variable),
        FieldSpec::enterprise(5, FieldLength::Fixed(4)),
        FieldSpec::enterprise(6, FieldLength::Fixed(1)),
        FieldSpec::enterprise(10, FieldLength::Variable),
        FieldSpec::enterprise(11, FieldLength::Fixed(1)),
        FieldSpec::standard(150, FieldLength::Fixed(4)),
    ],
};

pub const REPORTER_TEMPLATE_LEN: usize = REPORTER_TEMPLATE.encoded_len();
pub const SPOT_TEMPLATE_LEN: usize = SPOT_TEMPLATE.encoded_len();

const_assert_eq!(REPORTER_TEMPLATE_LEN, 36);
const_assert_eq!(SPOT_TEMPLATE_LEN, 52);

#[cfg(test)]
mod tests {
    use super::*;

    const REPORTER_DESCRIPTOR: [u8; 36] = [
        0x00, 0x03, 0x00, 0x24, 0x99, 0x92, 0x00, 0x03, 0x00, 0x00, //
        0x80, 0x02, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x04, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x08, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
        0x00, 0x00,
    ];

    const SPOT_DESCRIPTOR: [u8; 52] = [
        0x00, 0x02, 0x00, 0x34, 0x99, 0x93, 0x00, 0x06, //
        0x80, 0x01, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x05, 0x00, 0x04, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x0A, 0xFF, 0xFF, 0x00, 0x00, 0x76, 0x8F, //
        0x80, 0x0B, 0x00, 0x01, 0x00, 0x00, 0x76, 0x8F, //
        0x00, 0x96, 0x00, 0x04,
    ];

    fn encode(spec: &TemplateSpec) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let mut w = Writer::new(&mut buf);
        let len = spec.encode(&mut w).unwrap();
        assert_eq!(len, w.position());
        w.as_written().to_vec()
    }

    #[test]
    fn test_reporter_template_bytes() {
        assert_eq!(encode(&REPORTER_TEMPLATE), REPORTER_DESCRIPTOR);
    }

    #[test]
    fn test_spot_template_bytes() {
        assert_eq!(encode(&SPOT_TEMPLATE), SPOT_DESCRIPTOR);
    }

    #[test]
    fn test_header_length_matches_encoding() {
        const FIELDS: &[FieldSpec] = &[FieldSpec::standard(150, FieldLength::Fixed(4))];
        let custom = TemplateSpec {
            kind: TemplateKind::Data,
            template_id: 0x1234,
            fields: FIELDS,
        };
        let bytes = encode(&custom);
        assert_eq!(bytes.len(), 12);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
    }

    #[test]
    fn test_encode_needs_room_for_whole_descriptor() {
        let mut buf = [0u8; 40];
        let mut w = Writer::new(&mut buf);
        assert_eq!(
            SPOT_TEMPLATE.encode(&mut w).unwrap_err(),
            EncodeError::BufferTooSmall
        );
        assert_eq!(w.position(), 0);
    }

    #[test]
    fn test_pad4() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(35), 36);
    }
}
