//! Attribute table exposed by the device.
//!
//! Every attribute the daemon can read or write is a variant of
//! [`Attribute`]. A variant resolves to the command that reads it, the
//! decoder for its reply and, when settable, the command that writes it.
//! All of this is decided at configuration time; nothing is looked up by
//! string once the device is built.

use std::fmt;

use crate::{
    drivers::cryocon::protocol::{self, Command},
    error::{CryoError, CryoResult},
};

/// Temperature sensor input on the instrument.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelId {
    A,
    B,
    C,
    D,
}

impl ChannelId {
    pub const ALL: [ChannelId; 4] = [ChannelId::A, ChannelId::B, ChannelId::C, ChannelId::D];

    pub fn letter(self) -> char {
        match self {
            ChannelId::A => 'A',
            ChannelId::B => 'B',
            ChannelId::C => 'C',
            ChannelId::D => 'D',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.letter() == letter.to_ascii_uppercase())
    }
}

/// PID control loop (heater output) on the instrument, numbered 1 to 4.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoopId(u8);

impl LoopId {
    pub const MAX: u8 = 4;

    pub fn new(number: u8) -> CryoResult<Self> {
        if (1..=Self::MAX).contains(&number) {
            Ok(Self(number))
        } else {
            Err(CryoError::Config(format!(
                "loop {number} does not exist (expected 1..={})",
                Self::MAX
            )))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

/// Per-loop parameters.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopAttr {
    Output,
    Range,
    Rate,
    Ramp,
    Type,
    SetPoint,
    PGain,
    IGain,
    DGain,
}

impl LoopAttr {
    pub const ALL: [LoopAttr; 9] = [
        LoopAttr::Output,
        LoopAttr::Range,
        LoopAttr::Rate,
        LoopAttr::Ramp,
        LoopAttr::Type,
        LoopAttr::SetPoint,
        LoopAttr::PGain,
        LoopAttr::IGain,
        LoopAttr::DGain,
    ];

    fn suffix(self) -> &'static str {
        match self {
            LoopAttr::Output => "output",
            LoopAttr::Range => "range",
            LoopAttr::Rate => "rate",
            LoopAttr::Ramp => "ramp",
            LoopAttr::Type => "type",
            LoopAttr::SetPoint => "setpoint",
            LoopAttr::PGain => "pgain",
            LoopAttr::IGain => "igain",
            LoopAttr::DGain => "dgain",
        }
    }

    fn label(self) -> &'static str {
        match self {
            LoopAttr::Output => "Output",
            LoopAttr::Range => "Range",
            LoopAttr::Rate => "Rate",
            LoopAttr::Ramp => "Ramp",
            LoopAttr::Type => "Type",
            LoopAttr::SetPoint => "SetPoint",
            LoopAttr::PGain => "P gain",
            LoopAttr::IGain => "I gain",
            LoopAttr::DGain => "D gain",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            LoopAttr::Output => "%",
            LoopAttr::Rate => "K/min",
            LoopAttr::SetPoint => "K",
            LoopAttr::IGain => "s",
            LoopAttr::DGain => "Hz",
            LoopAttr::Range | LoopAttr::Ramp | LoopAttr::Type | LoopAttr::PGain => "",
        }
    }

    fn data_type(self) -> DataType {
        match self {
            LoopAttr::Range | LoopAttr::Type => DataType::Text,
            LoopAttr::Ramp => DataType::Bool,
            _ => DataType::Float,
        }
    }

    fn query_mnemonic(self) -> &'static str {
        match self {
            LoopAttr::Output => "OUTPWR",
            LoopAttr::Range => "RANGE",
            LoopAttr::Rate => "RATE",
            LoopAttr::Ramp => "RAMP",
            LoopAttr::Type => "TYPE",
            LoopAttr::SetPoint => "SETPT",
            LoopAttr::PGain => "PGAIN",
            LoopAttr::IGain => "IGAIN",
            LoopAttr::DGain => "DGAIN",
        }
    }

    /// Mnemonic used to set the parameter; `None` for read-only ones.
    fn set_mnemonic(self) -> Option<&'static str> {
        match self {
            // Output power can only be forced through the manual output level.
            LoopAttr::Output => Some("PMANUAL"),
            LoopAttr::PGain | LoopAttr::IGain | LoopAttr::DGain => None,
            other => Some(other.query_mnemonic()),
        }
    }
}

/// Declared value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float,
    Bool,
    Text,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Text => "str",
        })
    }
}

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Bool(bool),
    Text(String),
    /// The instrument reported the reading as unavailable.
    Missing,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Missing => Ok(()),
        }
    }
}

/// Every attribute the device knows about.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Attribute {
    Idn,
    Control,
    Channel(ChannelId),
    Loop(LoopId, LoopAttr),
}

impl Attribute {
    /// Lowercased identifier used on the outer interfaces.
    pub fn name(&self) -> String {
        match self {
            Attribute::Idn => "idn".to_string(),
            Attribute::Control => "control".to_string(),
            Attribute::Channel(c) => format!("channel{}", c.letter().to_ascii_lowercase()),
            Attribute::Loop(id, attr) => format!("loop{}{}", id.number(), attr.suffix()),
        }
    }

    /// Parses an attribute name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "idn" => return Some(Attribute::Idn),
            "control" => return Some(Attribute::Control),
            _ => {}
        }

        if let Some(rest) = name.strip_prefix("channel") {
            let mut chars = rest.chars();
            return match (chars.next(), chars.next()) {
                (Some(letter), None) => ChannelId::from_letter(letter).map(Attribute::Channel),
                _ => None,
            };
        }

        let rest = name.strip_prefix("loop")?;
        let digit = rest.chars().next()?.to_digit(10)?;
        let id = LoopId::new(u8::try_from(digit).ok()?).ok()?;
        let suffix = &rest[1..];
        LoopAttr::ALL
            .into_iter()
            .find(|attr| attr.suffix() == suffix)
            .map(|attr| Attribute::Loop(id, attr))
    }

    pub fn label(&self) -> String {
        match self {
            Attribute::Idn => "ID".to_string(),
            Attribute::Control => "Control".to_string(),
            Attribute::Channel(c) => format!("Channel {}", c.letter()),
            Attribute::Loop(id, attr) => format!("Loop {} {}", id.number(), attr.label()),
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Attribute::Idn | Attribute::Control => "",
            Attribute::Channel(_) => "K",
            Attribute::Loop(_, attr) => attr.unit(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Attribute::Idn => DataType::Text,
            Attribute::Control => DataType::Bool,
            Attribute::Channel(_) => DataType::Float,
            Attribute::Loop(_, attr) => attr.data_type(),
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            Attribute::Idn | Attribute::Channel(_) => false,
            Attribute::Control => true,
            Attribute::Loop(_, attr) => attr.set_mnemonic().is_some(),
        }
    }

    /// Command that reads this attribute. Only queues work, so it is safe to
    /// use inside a grouped request.
    pub fn query(&self) -> Command {
        match *self {
            Attribute::Idn => Command::Identify,
            Attribute::Control => Command::ControlQuery,
            Attribute::Channel(c) => Command::Temperature(c),
            Attribute::Loop(id, attr) => Command::LoopQuery {
                id,
                mnemonic: attr.query_mnemonic(),
            },
        }
    }

    /// Decodes the reply to [`Attribute::query`].
    pub fn decode(&self, reply: &str) -> CryoResult<Value> {
        protocol::decode(self.data_type(), reply).map_err(|reason| CryoError::Decode {
            command: self.query().to_string(),
            reply: reply.to_string(),
            reason,
        })
    }

    /// Parses a value supplied by a client into this attribute's type.
    pub fn parse_value(&self, raw: &str) -> CryoResult<Value> {
        let invalid = || CryoError::InvalidValue {
            attribute: self.name(),
            value: raw.to_string(),
        };
        match protocol::decode(self.data_type(), raw) {
            Ok(Value::Missing) | Err(_) => Err(invalid()),
            Ok(Value::Float(v)) if !v.is_finite() => Err(invalid()),
            Ok(value) => Ok(value),
        }
    }

    /// Command that writes `value` to this attribute.
    pub fn write_command(&self, value: &Value) -> CryoResult<Command> {
        let invalid = || CryoError::InvalidValue {
            attribute: self.name(),
            value: value.to_string(),
        };
        match (*self, value) {
            (Attribute::Control, Value::Bool(true)) => Ok(Command::ControlOn),
            (Attribute::Control, Value::Bool(false)) => Ok(Command::ControlOff),
            (Attribute::Control, _) => Err(invalid()),
            (Attribute::Loop(id, attr), value) => {
                let mnemonic = attr
                    .set_mnemonic()
                    .ok_or_else(|| CryoError::ReadOnly(self.name()))?;
                let value = match (attr.data_type(), value) {
                    (DataType::Float, Value::Float(v)) => format!("{v}"),
                    (DataType::Bool, Value::Bool(v)) => if *v { "ON" } else { "OFF" }.to_string(),
                    (DataType::Text, Value::Text(v)) if !v.trim().is_empty() => {
                        v.trim().to_ascii_uppercase()
                    }
                    _ => return Err(invalid()),
                };
                Ok(Command::LoopSet {
                    id,
                    mnemonic,
                    value,
                })
            }
            (Attribute::Idn | Attribute::Channel(_), _) => Err(CryoError::ReadOnly(self.name())),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Static description of one exposed attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    pub attribute: Attribute,
    pub name: String,
    pub label: String,
    pub unit: &'static str,
    pub data_type: DataType,
    pub writable: bool,
}

impl From<Attribute> for AttributeDescriptor {
    fn from(attribute: Attribute) -> Self {
        Self {
            attribute,
            name: attribute.name(),
            label: attribute.label(),
            unit: attribute.unit(),
            data_type: attribute.data_type(),
            writable: attribute.is_writable(),
        }
    }
}

/// Builds the attribute table for the configured channels and loops.
///
/// Fails when no channel or no loop is configured.
pub fn declare(channels: &[ChannelId], loops: &[LoopId]) -> CryoResult<Vec<AttributeDescriptor>> {
    if channels.is_empty() {
        return Err(CryoError::Config(
            "no channels configured, please fill 'used_channels'".into(),
        ));
    }
    if loops.is_empty() {
        return Err(CryoError::Config(
            "no loops configured, please fill 'used_loops'".into(),
        ));
    }

    let mut channels = channels.to_vec();
    channels.sort();
    channels.dedup();
    let mut loops = loops.to_vec();
    loops.sort();
    loops.dedup();

    let fixed = [Attribute::Idn, Attribute::Control];
    let channel_attrs = channels.into_iter().map(Attribute::Channel);
    let loop_attrs = loops
        .into_iter()
        .flat_map(|id| LoopAttr::ALL.into_iter().map(move |attr| Attribute::Loop(id, attr)));

    Ok(fixed
        .into_iter()
        .chain(channel_attrs)
        .chain(loop_attrs)
        .map(AttributeDescriptor::from)
        .collect())
}
