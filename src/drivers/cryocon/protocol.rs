//! Wire format of the Cryo-con remote command language.

use std::fmt;

use crate::attributes::{ChannelId, DataType, LoopId, Value};

/// Separator between commands of a compound line, and between the fields
/// of the compound reply.
pub const SEPARATOR: char = ';';

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Identify,
    ControlQuery,
    ControlOn,
    ControlOff,
    Temperature(ChannelId),
    LoopQuery {
        id: LoopId,
        mnemonic: &'static str,
    },
    LoopSet {
        id: LoopId,
        mnemonic: &'static str,
        value: String,
    },
    FrontPanelLock(bool),
    Raw(String),
}

impl Command {
    /// Whether the instrument answers this command with a reply line.
    pub fn expects_reply(&self) -> bool {
        match self {
            Command::Identify
            | Command::ControlQuery
            | Command::Temperature(_)
            | Command::LoopQuery { .. } => true,
            Command::ControlOn
            | Command::ControlOff
            | Command::LoopSet { .. }
            | Command::FrontPanelLock(_) => false,
            Command::Raw(text) => text.contains('?'),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Identify => f.write_str("*IDN?"),
            Command::ControlQuery => f.write_str("CONTROL?"),
            Command::ControlOn => f.write_str("CONTROL"),
            Command::ControlOff => f.write_str("STOP"),
            Command::Temperature(channel) => write!(f, "INPUT {}:TEMP?", channel.letter()),
            Command::LoopQuery { id, mnemonic } => write!(f, "LOOP {}:{}?", id.number(), mnemonic),
            Command::LoopSet {
                id,
                mnemonic,
                value,
            } => write!(f, "LOOP {}:{} {}", id.number(), mnemonic, value),
            Command::FrontPanelLock(lock) => {
                write!(f, "SYSTEM:LOCKOUT {}", if *lock { "ON" } else { "OFF" })
            }
            Command::Raw(text) => f.write_str(text.trim()),
        }
    }
}

/// Joins commands into one compound line.
pub fn compound(commands: &[Command]) -> String {
    commands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Splits a compound reply into its fields.
pub fn split_reply(line: &str) -> Vec<&str> {
    line.split(SEPARATOR).map(str::trim).collect()
}

/// The instrument reports unavailable readings (open sensor, disabled loop)
/// as a run of dots or dashes, or `NA`. A run may be a single character.
fn is_unavailable(field: &str) -> bool {
    field.is_empty()
        || field.eq_ignore_ascii_case("NA")
        || field.eq_ignore_ascii_case("N/A")
        || field.chars().all(|c| c == '.' || c == '-')
}

/// Decodes one reply field according to the declared value type.
///
/// Returns the reason as a plain string; callers wrap it with the command
/// that produced the reply.
pub fn decode(data_type: DataType, field: &str) -> Result<Value, String> {
    let field = field.trim();
    if is_unavailable(field) {
        return Ok(Value::Missing);
    }

    match data_type {
        DataType::Float => {
            let number = field
                .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%' || c == '/')
                .trim();
            number
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("'{field}' is not a number"))
        }
        DataType::Bool => match field.to_ascii_uppercase().as_str() {
            "ON" | "YES" | "TRUE" | "1" => Ok(Value::Bool(true)),
            "OFF" | "NO" | "FALSE" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{field}' is not a boolean")),
        },
        DataType::Text => Ok(Value::Text(field.to_string())),
    }
}
