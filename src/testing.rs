//! Scripted stand-in for the instrument, used by the unit tests.
//!
//! Each connect spawns a small server over an in-memory duplex pipe. The
//! server answers every `?` segment of a received line from a reply table,
//! joins the answers with `;` and terminates them with `\r\n` like the real
//! controller does. Set commands update the table, so a write followed by a
//! read sees the new value.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::{
    app_context::AppState,
    attributes::{self, ChannelId, LoopId},
    config::{Config, ConfigManager},
    connection::{Connector, Stream},
    device::CryoConDevice,
    error::{CryoError, CryoResult},
};

/// A device with every channel and loops 1 and 2, talking to `fake`.
pub fn fake_device(fake: &FakeInstrument) -> CryoConDevice {
    let loops = [LoopId::new(1).unwrap(), LoopId::new(2).unwrap()];
    CryoConDevice::new(
        Box::new(fake.clone()),
        Duration::from_millis(200),
        attributes::declare(&ChannelId::ALL, &loops).unwrap(),
        Duration::from_millis(100),
    )
}

pub fn fake_app_state(fake: &FakeInstrument, config: Config) -> Arc<AppState> {
    let manager = ConfigManager::new(config, PathBuf::from("/tmp/cryocond-test.yml"));
    Arc::new(AppState::with_device(manager, fake_device(fake)))
}

#[derive(Clone)]
pub struct FakeInstrument {
    state: Arc<Mutex<FakeState>>,
}

struct FakeState {
    replies: HashMap<String, String>,
    received: Vec<String>,
    mute: bool,
    refuse: bool,
    raw_reply: Option<String>,
    connects: usize,
}

impl FakeInstrument {
    pub fn new() -> Self {
        let mut replies: HashMap<String, String> = [
            ("*IDN?", "Cryo-con,24C,204683,1.06A"),
            ("CONTROL?", "OFF"),
            ("INPUT A:TEMP?", "77.345"),
            ("INPUT B:TEMP?", "300.12"),
            ("INPUT C:TEMP?", "......."),
            ("INPUT D:TEMP?", "4.2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        for n in 1..=4 {
            for (mnemonic, value) in [
                ("OUTPWR", "12.5%"),
                ("RANGE", "HI"),
                ("RATE", "1.0"),
                ("RAMP", "OFF"),
                ("TYPE", "PID"),
                ("SETPT", "80.000K"),
                ("PGAIN", "10.0"),
                ("IGAIN", "5.0"),
                ("DGAIN", "0.0"),
            ] {
                replies.insert(format!("LOOP {n}:{mnemonic}?"), value.to_string());
            }
        }

        Self {
            state: Arc::new(Mutex::new(FakeState {
                replies,
                received: Vec::new(),
                mute: false,
                refuse: false,
                raw_reply: None,
                connects: 0,
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_reply(&self, query: &str, reply: &str) {
        self.with_state(|s| s.replies.insert(query.to_string(), reply.to_string()));
    }

    /// Stops answering; requests time out.
    pub fn set_mute(&self, mute: bool) {
        self.with_state(|s| s.mute = mute);
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.with_state(|s| s.refuse = refuse);
    }

    /// Replaces the whole reply line of every query.
    pub fn set_raw_reply(&self, reply: Option<&str>) {
        self.with_state(|s| s.raw_reply = reply.map(str::to_string));
    }

    /// Lines received so far, across all connections.
    pub fn received(&self) -> Vec<String> {
        self.with_state(|s| s.received.clone())
    }

    pub fn connects(&self) -> usize {
        self.with_state(|s| s.connects)
    }
}

impl Default for FakeInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeState {
    fn handle(&mut self, line: &str) -> Option<String> {
        self.received.push(line.trim().to_string());
        if self.mute {
            return None;
        }

        let mut answers = Vec::new();
        for segment in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if segment.contains('?') {
                answers.push(
                    self.replies
                        .get(segment)
                        .cloned()
                        .unwrap_or_else(|| "NAK".to_string()),
                );
            } else {
                self.apply(segment);
            }
        }

        if answers.is_empty() {
            return None;
        }
        Some(
            self.raw_reply
                .clone()
                .unwrap_or_else(|| answers.join(";")),
        )
    }

    fn apply(&mut self, segment: &str) {
        let (key, value) = match segment {
            "CONTROL" => ("CONTROL", "ON"),
            "STOP" => ("CONTROL", "OFF"),
            other => match other.rsplit_once(' ') {
                Some(pair) => pair,
                None => return,
            },
        };
        self.replies.insert(format!("{key}?"), value.trim().to_string());
    }
}

#[async_trait]
impl Connector for FakeInstrument {
    async fn connect(&self) -> CryoResult<Box<dyn Stream>> {
        let refused = self.with_state(|s| {
            if !s.refuse {
                s.connects += 1;
            }
            s.refuse
        });
        if refused {
            return Err(CryoError::Connection("connection refused".into()));
        }

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve(self.state.clone(), server));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "fake instrument".to_string()
    }
}

async fn serve(state: Arc<Mutex<FakeState>>, stream: DuplexStream) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = state.lock().unwrap().handle(&line);
        if let Some(reply) = reply {
            if write.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                break;
            }
        }
    }
}
