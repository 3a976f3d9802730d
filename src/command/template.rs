//! Command templates resolved from declarative device descriptions
//!
//! A device description carries commands as loosely typed key/value objects:
//!
//! ```json
//! { "protocol": "I2C", "addressW": "0xC0", "regLength": 1, "reg0": "0x0C",
//!   "dataLength": 2, "data0": "valueH", "data1": "valueL" }
//! ```
//!
//! Every token is resolved once at load time into a [`CommandTemplate`], so
//! encoding a packet on a control change never re-parses strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CommandError;

/// Bus protocol named by a command entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    I2c,
    Spi,
    /// Numeric protocol code with no symbolic name
    Unsupported(u32),
}

/// Runtime value substituted into a data byte when a control changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placeholder {
    /// Bits 31..24 of `round(value)`
    ValueH24,
    /// Bits 23..16 of `round(value)`
    ValueH16,
    /// Bits 15..8 of `round(value)`
    ValueH,
    /// Bits 7..0 of `round(value)`
    ValueL,
    /// Bare value, low byte in change mode
    Value,
    /// Bits 15..8 of `round(value2)`
    Value2H,
    /// Bits 7..0 of `round(value2)`
    Value2L,
}

/// Result of resolving one symbolic or numeric token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Number(u32),
    Protocol(Protocol),
    Placeholder(Placeholder),
    /// Unresolvable token
    Error,
}

const SYMBOLS: &[(&str, Token)] = &[
    ("I2C", Token::Protocol(Protocol::I2c)),
    ("SPI", Token::Protocol(Protocol::Spi)),
    ("valueH24", Token::Placeholder(Placeholder::ValueH24)),
    ("valueH16", Token::Placeholder(Placeholder::ValueH16)),
    ("valueH", Token::Placeholder(Placeholder::ValueH)),
    ("valueL", Token::Placeholder(Placeholder::ValueL)),
    ("value", Token::Placeholder(Placeholder::Value)),
    ("value2H", Token::Placeholder(Placeholder::Value2H)),
    ("value2L", Token::Placeholder(Placeholder::Value2L)),
];

/// Resolve a string token: `0x` hex, then `0b` binary, then plain decimal,
/// then the fixed symbol table. Anything else is [`Token::Error`].
pub fn parse_token(s: &str) -> Token {
    if s.is_empty() {
        return Token::Error;
    }

    let number = if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        u32::from_str_radix(bin, 2).ok()
    } else {
        match s.parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                return SYMBOLS
                    .iter()
                    .find(|(name, _)| *name == s)
                    .map(|(_, token)| *token)
                    .unwrap_or(Token::Error)
            }
        }
    };

    number.map(Token::Number).unwrap_or(Token::Error)
}

/// A single value as it appears in a device description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawToken {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawToken {
    pub fn resolve(&self) -> Token {
        match self {
            RawToken::Int(n) => u32::try_from(*n).map(Token::Number).unwrap_or(Token::Error),
            RawToken::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64 => {
                Token::Number(*f as u32)
            }
            RawToken::Float(_) => Token::Error,
            RawToken::Text(s) => parse_token(s),
        }
    }
}

impl fmt::Display for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawToken::Int(n) => write!(f, "{n}"),
            RawToken::Float(x) => write!(f, "{x}"),
            RawToken::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RawToken {
    fn from(s: &str) -> Self {
        RawToken::Text(s.to_string())
    }
}

impl From<i64> for RawToken {
    fn from(n: i64) -> Self {
        RawToken::Int(n)
    }
}

/// One unparsed command entry: `protocol`, `addressW`, `regLength`,
/// `reg0..`, `dataLength`, `data0..`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCommand(pub BTreeMap<String, RawToken>);

impl RawCommand {
    pub fn get(&self, key: &str) -> Option<&RawToken> {
        self.0.get(key)
    }
}

impl<K, V> FromIterator<(K, V)> for RawCommand
where
    K: Into<String>,
    V: Into<RawToken>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        RawCommand(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A data byte of a command: fixed, substituted at send time, or broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandField {
    Literal(u8),
    Placeholder(Placeholder),
    /// Token that failed to resolve; the whole template is never sent
    Invalid(String),
}

/// A resolved command: target address, register path and data layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub protocol: Protocol,
    pub address_w: u8,
    pub reg: Vec<u8>,
    pub data: Vec<CommandField>,
}

impl CommandTemplate {
    pub fn reg_length(&self) -> usize {
        self.reg.len()
    }

    pub fn data_length(&self) -> usize {
        self.data.len()
    }

    /// Packet size once encoded: address byte, registers, data.
    pub fn packet_len(&self) -> usize {
        1 + self.reg.len() + self.data.len()
    }

    pub fn has_placeholders(&self) -> bool {
        self.data
            .iter()
            .any(|f| matches!(f, CommandField::Placeholder(_)))
    }

    pub fn first_invalid(&self) -> Option<(usize, &str)> {
        self.data.iter().enumerate().find_map(|(i, f)| match f {
            CommandField::Invalid(token) => Some((i, token.as_str())),
            _ => None,
        })
    }
}

/// Resolve every entry independently. A malformed entry yields an error in
/// its own position and never affects its siblings.
pub fn resolve(raw: &[RawCommand]) -> Vec<Result<CommandTemplate, CommandError>> {
    raw.iter()
        .enumerate()
        .map(|(index, entry)| resolve_entry(index, entry))
        .collect()
}

/// Resolve a command list, logging and dropping malformed entries.
pub fn resolve_all(context: &str, raw: &[RawCommand]) -> Vec<CommandTemplate> {
    resolve(raw)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(template) => Some(template),
            Err(e) => {
                warn!("{context}: skipping command: {e}");
                None
            }
        })
        .collect()
}

fn resolve_entry(index: usize, raw: &RawCommand) -> Result<CommandTemplate, CommandError> {
    let fail = |reason: String| CommandError::Configuration { index, reason };

    let protocol = match required(raw, "protocol").map_err(fail)?.resolve() {
        Token::Protocol(p) => p,
        Token::Number(code) => Protocol::Unsupported(code),
        other => return Err(fail(format!("protocol resolves to {other:?}"))),
    };

    let address_w = byte_field(raw, "addressW").map_err(fail)?;

    let reg_length = length_field(raw, "regLength").map_err(fail)?;
    let reg = (0..reg_length)
        .map(|j| byte_field(raw, &format!("reg{j}")))
        .collect::<Result<Vec<_>, _>>()
        .map_err(fail)?;

    let data_length = length_field(raw, "dataLength").map_err(fail)?;
    let data = (0..data_length)
        .map(|j| {
            let key = format!("data{j}");
            let token = required(raw, &key)?;
            Ok(match token.resolve() {
                Token::Number(n) => match u8::try_from(n) {
                    Ok(b) => CommandField::Literal(b),
                    Err(_) => return Err(format!("{key} = {n} does not fit in a byte")),
                },
                Token::Placeholder(p) => CommandField::Placeholder(p),
                Token::Protocol(_) | Token::Error => CommandField::Invalid(token.to_string()),
            })
        })
        .collect::<Result<Vec<_>, String>>()
        .map_err(fail)?;

    Ok(CommandTemplate {
        protocol,
        address_w,
        reg,
        data,
    })
}

fn required<'a>(raw: &'a RawCommand, key: &str) -> Result<&'a RawToken, String> {
    raw.get(key).ok_or_else(|| format!("missing {key}"))
}

fn byte_field(raw: &RawCommand, key: &str) -> Result<u8, String> {
    match required(raw, key)?.resolve() {
        Token::Number(n) => u8::try_from(n).map_err(|_| format!("{key} = {n} does not fit in a byte")),
        other => Err(format!("{key} resolves to {other:?}, expected a byte")),
    }
}

fn length_field(raw: &RawCommand, key: &str) -> Result<usize, String> {
    match raw.get(key).map(RawToken::resolve) {
        None => Ok(0),
        Some(Token::Number(n)) => Ok(n as usize),
        Some(other) => Err(format!("{key} resolves to {other:?}, expected a count")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exposure() -> RawCommand {
        [
            ("protocol", RawToken::from("I2C")),
            ("addressW", "0xC0".into()),
            ("regLength", RawToken::Int(1)),
            ("reg0", "0x0C".into()),
            ("dataLength", RawToken::Int(2)),
            ("data0", "valueH".into()),
            ("data1", "valueL".into()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn parses_numeric_tokens() {
        assert_eq!(parse_token("0xFF"), Token::Number(255));
        assert_eq!(parse_token("0b1010"), Token::Number(10));
        assert_eq!(parse_token("12"), Token::Number(12));
    }

    #[test]
    fn parses_symbols() {
        assert_eq!(parse_token("I2C"), Token::Protocol(Protocol::I2c));
        assert_eq!(parse_token("SPI"), Token::Protocol(Protocol::Spi));
        assert_eq!(
            parse_token("valueH24"),
            Token::Placeholder(Placeholder::ValueH24)
        );
        assert_eq!(parse_token("value"), Token::Placeholder(Placeholder::Value));
        assert_eq!(
            parse_token("value2L"),
            Token::Placeholder(Placeholder::Value2L)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_token(""), Token::Error);
        assert_eq!(parse_token("bogus"), Token::Error);
        assert_eq!(parse_token("0x"), Token::Error);
        assert_eq!(parse_token("0b102"), Token::Error);
        assert_eq!(parse_token("i2c"), Token::Error);
    }

    #[test]
    fn resolves_placeholder_command() {
        let template = resolve(&[exposure()]).remove(0).unwrap();
        assert_eq!(template.protocol, Protocol::I2c);
        assert_eq!(template.address_w, 0xC0);
        assert_eq!(template.reg, vec![0x0C]);
        assert_eq!(
            template.data,
            vec![
                CommandField::Placeholder(Placeholder::ValueH),
                CommandField::Placeholder(Placeholder::ValueL),
            ]
        );
        assert_eq!(template.packet_len(), 4);
    }

    #[test]
    fn bad_entry_does_not_block_siblings() {
        let mut missing_reg = exposure();
        missing_reg.0.remove("reg0");

        let results = resolve(&[missing_reg, exposure()]);
        assert!(matches!(
            results[0],
            Err(CommandError::Configuration { index: 0, .. })
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn unknown_data_token_is_kept_as_invalid_field() {
        let mut cmd = exposure();
        cmd.0.insert("data1".into(), "bogus".into());

        let template = resolve(&[cmd]).remove(0).unwrap();
        assert_eq!(template.first_invalid(), Some((1, "bogus")));
    }

    #[test]
    fn numeric_protocol_is_unsupported() {
        let mut cmd = exposure();
        cmd.0.insert("protocol".into(), RawToken::Int(7));

        let template = resolve(&[cmd]).remove(0).unwrap();
        assert_eq!(template.protocol, Protocol::Unsupported(7));
    }

    #[test]
    fn oversized_literal_is_a_configuration_error() {
        let mut cmd = exposure();
        cmd.0.insert("data0".into(), "0x1FF".into());

        assert!(resolve(&[cmd]).remove(0).is_err());
    }

    #[test]
    fn lengths_default_to_zero() {
        let cmd: RawCommand = [("protocol", RawToken::from("I2C")), ("addressW", RawToken::Int(32))]
            .into_iter()
            .collect();

        let template = resolve(&[cmd]).remove(0).unwrap();
        assert!(template.reg.is_empty());
        assert!(template.data.is_empty());
    }

    #[test]
    fn deserializes_mixed_json_values() {
        let cmd: RawCommand = serde_json::from_str(
            r#"{"protocol":"I2C","addressW":192,"regLength":1,"reg0":"0x0C","dataLength":1,"data0":"0b11"}"#,
        )
        .unwrap();

        let template = resolve(&[cmd]).remove(0).unwrap();
        assert_eq!(template.address_w, 192);
        assert_eq!(template.data, vec![CommandField::Literal(3)]);
    }
}
