//! Addressed packet encoding for resolved command templates

use serde::{Deserialize, Serialize};

use super::template::{CommandField, CommandTemplate, Placeholder, Protocol};
use crate::error::CommandError;

/// Live control values substituted into placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeValues {
    pub value: f64,
    pub value2: f64,
}

/// Init mode sends literal fields only (startup defaults); change mode
/// substitutes placeholders from a live control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodeMode {
    Init,
    Change(RuntimeValues),
}

/// Bytes ready for the device bus plus the key of the register path they
/// target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPacket {
    /// Big-endian fold of `addressW` and the register bytes. Data bytes
    /// never take part.
    pub address_key: u64,
    pub bytes: Vec<u8>,
}

impl ResolvedPacket {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Build the addressed packet for `template`.
///
/// Only I2C is encodable. Templates holding an unresolved token are refused
/// so a broken description never puts garbage on the bus.
pub fn encode(template: &CommandTemplate, mode: EncodeMode) -> Result<ResolvedPacket, CommandError> {
    if template.protocol != Protocol::I2c {
        return Err(CommandError::UnsupportedProtocol(template.protocol));
    }
    if let Some((index, token)) = template.first_invalid() {
        return Err(CommandError::InvalidField {
            index,
            token: token.to_string(),
        });
    }

    let mut bytes = Vec::with_capacity(template.packet_len());
    let mut address_key = 0u64;

    bytes.push(template.address_w);
    address_key = fold_key(address_key, template.address_w);
    for &reg in &template.reg {
        bytes.push(reg);
        address_key = fold_key(address_key, reg);
    }

    for (index, field) in template.data.iter().enumerate() {
        let byte = match (field, mode) {
            (CommandField::Literal(b), _) => *b,
            (CommandField::Placeholder(_), EncodeMode::Init) => {
                return Err(CommandError::UnresolvedPlaceholder { index })
            }
            (CommandField::Placeholder(p), EncodeMode::Change(values)) => substitute(*p, values),
            // first_invalid() already rejected these
            (CommandField::Invalid(token), _) => {
                return Err(CommandError::InvalidField {
                    index,
                    token: token.clone(),
                })
            }
        };
        bytes.push(byte);
    }

    Ok(ResolvedPacket { address_key, bytes })
}

pub fn encode_init(template: &CommandTemplate) -> Result<ResolvedPacket, CommandError> {
    encode(template, EncodeMode::Init)
}

pub fn encode_change(
    template: &CommandTemplate,
    value: f64,
    value2: f64,
) -> Result<ResolvedPacket, CommandError> {
    encode(template, EncodeMode::Change(RuntimeValues { value, value2 }))
}

fn fold_key(key: u64, byte: u8) -> u64 {
    (key << 8) | u64::from(byte)
}

/// `round()` is half-away-from-zero; the result is truncated to 32 bits and
/// masked to the requested byte. Out-of-range values wrap rather than clamp.
fn runtime_word(value: f64) -> [u8; 4] {
    (value.round() as i64 as u32).to_be_bytes()
}

fn substitute(placeholder: Placeholder, values: RuntimeValues) -> u8 {
    let v = runtime_word(values.value);
    let v2 = runtime_word(values.value2);
    match placeholder {
        Placeholder::ValueH24 => v[0],
        Placeholder::ValueH16 => v[1],
        Placeholder::ValueH => v[2],
        Placeholder::ValueL | Placeholder::Value => v[3],
        Placeholder::Value2H => v2[2],
        Placeholder::Value2L => v2[3],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(data: Vec<CommandField>) -> CommandTemplate {
        CommandTemplate {
            protocol: Protocol::I2c,
            address_w: 0xC0,
            reg: vec![0x0C, 0x01],
            data,
        }
    }

    #[test]
    fn init_mode_sends_literals() {
        let t = template(vec![CommandField::Literal(0x12), CommandField::Literal(0x34)]);
        let packet = encode_init(&t).unwrap();

        assert_eq!(packet.bytes, vec![0xC0, 0x0C, 0x01, 0x12, 0x34]);
        assert_eq!(packet.len(), 1 + t.reg_length() + t.data_length());
        assert_eq!(packet.address_key, 0xC00C01);
    }

    #[test]
    fn data_bytes_never_change_the_key() {
        let a = encode_init(&template(vec![CommandField::Literal(0x00)])).unwrap();
        let b = encode_init(&template(vec![CommandField::Literal(0xFF)])).unwrap();
        assert_ne!(a.bytes, b.bytes);
        assert_eq!(a.address_key, b.address_key);

        let c = encode_change(&template(vec![CommandField::Placeholder(Placeholder::ValueL)]), 7.0, 0.0)
            .unwrap();
        assert_eq!(c.address_key, a.address_key);
    }

    #[test]
    fn change_mode_substitutes_value_bytes() {
        let t = template(vec![
            CommandField::Placeholder(Placeholder::ValueH24),
            CommandField::Placeholder(Placeholder::ValueH16),
            CommandField::Placeholder(Placeholder::ValueH),
            CommandField::Placeholder(Placeholder::ValueL),
            CommandField::Placeholder(Placeholder::Value2H),
            CommandField::Placeholder(Placeholder::Value2L),
        ]);
        let packet = encode_change(&t, 0x0102_0304 as f64, 0xABCD as f64).unwrap();

        assert_eq!(&packet.bytes[3..], &[0x01, 0x02, 0x03, 0x04, 0xAB, 0xCD]);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        let t = template(vec![CommandField::Placeholder(Placeholder::ValueL)]);
        assert_eq!(encode_change(&t, 2.5, 0.0).unwrap().bytes[3], 3);
        assert_eq!(encode_change(&t, 2.49, 0.0).unwrap().bytes[3], 2);
        assert_eq!(encode_change(&t, 300.0, 0.0).unwrap().bytes[3], 300u32 as u8);
    }

    #[test]
    fn bare_value_is_low_byte_in_change_mode() {
        let t = template(vec![CommandField::Placeholder(Placeholder::Value)]);
        assert_eq!(encode_change(&t, 0x1234 as f64, 0.0).unwrap().bytes[3], 0x34);
    }

    #[test]
    fn init_mode_refuses_placeholders() {
        let t = template(vec![
            CommandField::Literal(1),
            CommandField::Placeholder(Placeholder::Value),
        ]);
        assert_eq!(
            encode_init(&t),
            Err(CommandError::UnresolvedPlaceholder { index: 1 })
        );
    }

    #[test]
    fn invalid_field_blocks_encoding() {
        let t = template(vec![CommandField::Invalid("bogus".into())]);
        assert!(matches!(
            encode_change(&t, 1.0, 1.0),
            Err(CommandError::InvalidField { index: 0, .. })
        ));
    }

    #[test]
    fn non_i2c_is_unsupported() {
        let mut t = template(vec![CommandField::Literal(1)]);
        t.protocol = Protocol::Spi;
        assert_eq!(
            encode_init(&t),
            Err(CommandError::UnsupportedProtocol(Protocol::Spi))
        );
    }
}
