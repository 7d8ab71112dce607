//! Driver for Cryo-con temperature controllers (22C, 24C, 26, 32, 44 series).
//!
//! Wraps a [`Connection`] with typed operations. Reads can be grouped: a
//! [`Group`] queues commands and sends them as one compound line, then hands
//! the replies back in the order the commands were queued.

pub mod protocol;

use log::{debug, warn};

use crate::{
    attributes::{Attribute, Value},
    connection::Connection,
    error::{CryoError, CryoResult},
};

use protocol::Command;

pub struct CryoCon {
    conn: Connection,
}

impl CryoCon {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Whether a stream to the instrument is open.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    /// Opens a grouped request scope.
    pub fn group(&mut self) -> Group<'_> {
        Group {
            driver: self,
            commands: Vec::new(),
        }
    }

    async fn send_line(&mut self, commands: &[Command]) -> CryoResult<Vec<String>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let expected = commands.iter().filter(|c| c.expects_reply()).count();
        let line = protocol::compound(commands);
        let reply = self.conn.request(&line, expected > 0).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        let fields: Vec<String> = protocol::split_reply(&reply)
            .into_iter()
            .map(str::to_string)
            .collect();

        if fields.len() != expected {
            // Whatever is left on the line cannot be matched to a command.
            if let Err(e) = self.conn.close().await {
                warn!("Failed to close connection after garbled reply: {e}");
            }
            return Err(CryoError::ReplyCount {
                expected,
                got: fields.len(),
            });
        }
        Ok(fields)
    }

    async fn query(&mut self, command: Command) -> CryoResult<String> {
        let mut replies = self.send_line(std::slice::from_ref(&command)).await?;
        replies.pop().ok_or(CryoError::ReplyCount {
            expected: 1,
            got: 0,
        })
    }

    async fn send(&mut self, command: Command) -> CryoResult<()> {
        self.send_line(std::slice::from_ref(&command)).await.map(|_| ())
    }

    /// Reads and decodes a single attribute.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub async fn read(&mut self, attribute: Attribute) -> CryoResult<Value> {
        let reply = self.query(attribute.query()).await?;
        attribute.decode(&reply)
    }

    /// Whether temperature control is engaged.
    pub async fn control(&mut self) -> CryoResult<bool> {
        let reply = self.query(Command::ControlQuery).await?;
        decode_control(&reply)
    }

    pub async fn set_control(&mut self, on: bool) -> CryoResult<()> {
        debug!("Turning control {}", if on { "on" } else { "off" });
        self.send(if on {
            Command::ControlOn
        } else {
            Command::ControlOff
        })
        .await
    }

    pub async fn write(&mut self, attribute: Attribute, value: &Value) -> CryoResult<()> {
        let command = attribute.write_command(value)?;
        self.send(command).await
    }

    /// Raw pass-through. Returns the reply, or an empty string for commands
    /// the instrument does not answer.
    pub async fn ask(&mut self, text: &str) -> CryoResult<String> {
        let command = Command::Raw(text.to_string());
        if command.expects_reply() {
            // Compound raw commands keep their ';' separated reply as is.
            let reply = self.conn.request(&command.to_string(), true).await?;
            Ok(reply.unwrap_or_default())
        } else {
            self.send(command).await.map(|_| String::new())
        }
    }

    pub async fn lock_front_panel(&mut self, lock: bool) -> CryoResult<()> {
        self.send(Command::FrontPanelLock(lock)).await
    }

    pub async fn close(&mut self) -> CryoResult<()> {
        self.conn.close().await
    }
}

/// Decodes a reply to `CONTROL?`.
pub fn decode_control(reply: &str) -> CryoResult<bool> {
    match Attribute::Control.decode(reply)? {
        Value::Bool(on) => Ok(on),
        _ => Err(CryoError::Decode {
            command: Command::ControlQuery.to_string(),
            reply: reply.to_string(),
            reason: "control state unavailable".into(),
        }),
    }
}

/// Commands queued for one round trip.
pub struct Group<'a> {
    driver: &'a mut CryoCon,
    commands: Vec<Command>,
}

impl Group<'_> {
    pub fn queue(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Number of queued commands.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been queued.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends every queued command as one line. Returns one reply per queued
    /// command that expects one, in queue order.
    pub async fn send(self) -> CryoResult<Vec<String>> {
        self.driver.send_line(&self.commands).await
    }
}
