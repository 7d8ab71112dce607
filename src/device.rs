//! The CryoCon device: batched polling, cached reads, writes and state.
//!
//! Attribute reads never talk to the instrument one by one. Whatever has to
//! be refreshed is queried in a single grouped request, always led by the
//! `control` flag, and the decoded replies replace the last-values cache in
//! one go. The same `control` reply feeds the device state and status.

use std::{fmt, time::Duration, time::SystemTime};

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::{
    attributes::{self, Attribute, AttributeDescriptor, DataType, Value},
    cache::{Entry, LastValues},
    config::Config,
    connection::{Connection, ConnectionSpec, Connector},
    drivers::cryocon::CryoCon,
    error::{CryoError, CryoResult},
    state::{DevState, RunState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Valid,
    Invalid,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quality::Valid => "VALID",
            Quality::Invalid => "INVALID",
        })
    }
}

/// A value as handed to clients, with the time of the poll it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub timestamp: SystemTime,
    pub quality: Quality,
}

impl Reading {
    /// Unavailable readings render as NaN for numbers and as an empty string
    /// otherwise, flagged invalid.
    fn new(data_type: DataType, value: Value, timestamp: SystemTime) -> Self {
        match value {
            Value::Missing => Self {
                value: match data_type {
                    DataType::Float => Value::Float(f64::NAN),
                    DataType::Bool | DataType::Text => Value::Text(String::new()),
                },
                timestamp,
                quality: Quality::Invalid,
            },
            value => Self {
                value,
                timestamp,
                quality: Quality::Valid,
            },
        }
    }

    /// Seconds since the UNIX epoch.
    pub fn unix_timestamp(&self) -> f64 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64())
    }
}

pub struct CryoConDevice {
    driver: CryoCon,
    attributes: Vec<AttributeDescriptor>,
    read_validity: Duration,
    auto_lock: bool,
    cache: LastValues,
    run_state: RunState,
}

impl CryoConDevice {
    /// Builds the device from configuration. No I/O happens here; the
    /// connection is opened by the first request.
    pub fn from_config(config: &Config) -> CryoResult<Self> {
        let attributes = attributes::declare(&config.channels()?, &config.loops()?)?;
        let spec = ConnectionSpec::from_config(config)?;
        let read_validity = Duration::try_from_secs_f64(config.read_validity_period)
            .map_err(|e| CryoError::Config(format!("read_validity_period: {e}")))?;

        info!(
            "Declared {} attributes on {}",
            attributes.len(),
            spec.describe()
        );
        let reply_timeout = spec.reply_timeout;
        let mut device = Self::new(Box::new(spec), reply_timeout, attributes, read_validity);
        device.auto_lock = config.auto_lock_front_panel;
        Ok(device)
    }

    pub fn new(
        connector: Box<dyn Connector>,
        reply_timeout: Duration,
        attributes: Vec<AttributeDescriptor>,
        read_validity: Duration,
    ) -> Self {
        Self {
            driver: CryoCon::new(Connection::new(connector, reply_timeout)),
            attributes,
            read_validity,
            auto_lock: false,
            cache: LastValues::new(),
            run_state: RunState::new(),
        }
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    /// Resolves a client supplied name against the declared attributes.
    pub fn resolve(&self, name: &str) -> CryoResult<Attribute> {
        Attribute::parse(name)
            .filter(|attr| self.attributes.iter().any(|d| d.attribute == *attr))
            .ok_or_else(|| CryoError::UnknownAttribute(name.to_string()))
    }

    /// Refreshes `requested` in one round trip and replaces the cache.
    ///
    /// `control` is always queried first. A failing sub-request only fails
    /// its own entry; a failure of the exchange itself leaves the cache and
    /// the state untouched and is returned.
    pub async fn poll(&mut self, requested: &[Attribute]) -> CryoResult<&[Entry]> {
        let mut batch = vec![Attribute::Control];
        for attr in requested {
            if !batch.contains(attr) {
                batch.push(*attr);
            }
        }

        let mut group = self.driver.group();
        for attr in &batch {
            group.queue(attr.query());
        }
        let replies = group.send().await?;

        let entries: Vec<Entry> = batch
            .iter()
            .zip(&replies)
            .map(|(attr, reply)| (*attr, attr.decode(reply)))
            .collect();
        for (attr, result) in &entries {
            if let Err(e) = result {
                warn!("Reading {attr} failed: {e}");
            }
        }

        let control = control_value(&entries);
        self.cache
            .replace(entries, SystemTime::now(), Instant::now());
        self.derive_state(Some(control)).await;
        debug!("Polled {} attributes", batch.len());

        Ok(self.cache.entries())
    }

    /// Polls every declared attribute.
    pub async fn poll_all(&mut self) -> CryoResult<&[Entry]> {
        let all: Vec<Attribute> = self.attributes.iter().map(|d| d.attribute).collect();
        self.poll(&all).await
    }

    /// Reads one attribute by name, polling first when the cached value is
    /// too old or was not part of the last poll.
    pub async fn read(&mut self, name: &str) -> CryoResult<Reading> {
        let attr = self.resolve(name)?;
        self.read_many(&[attr])
            .await?
            .pop()
            .unwrap_or(Err(CryoError::UnknownAttribute(name.to_string())))
    }

    /// Reads several attributes, refreshing all of them in a single poll
    /// when needed. Each reading carries its own value or stored error.
    pub async fn read_many(&mut self, attrs: &[Attribute]) -> CryoResult<Vec<CryoResult<Reading>>> {
        let stale = !self.cache.is_fresh(Instant::now(), self.read_validity)
            || attrs.iter().any(|a| !self.cache.contains(*a));
        if stale {
            self.poll(attrs).await?;
        }
        Ok(attrs.iter().map(|a| self.cached(*a)).collect())
    }

    /// Names of the attributes whose last poll failed.
    pub fn failed(&self) -> Vec<String> {
        self.cache.failed().map(|attr| attr.name()).collect()
    }

    /// The cached reading of `attr`, without touching the instrument.
    pub fn cached(&self, attr: Attribute) -> CryoResult<Reading> {
        let timestamp = self.cache.polled_at().unwrap_or(SystemTime::UNIX_EPOCH);
        match self.cache.get(attr) {
            Some(Ok(value)) => Ok(Reading::new(attr.data_type(), value.clone(), timestamp)),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(Reading::new(attr.data_type(), Value::Missing, timestamp)),
        }
    }

    /// Writes a client supplied value. Nothing is sent when the attribute is
    /// read-only or the value does not parse.
    pub async fn write(&mut self, name: &str, raw: &str) -> CryoResult<()> {
        let attr = self.resolve(name)?;
        if !attr.is_writable() {
            return Err(CryoError::ReadOnly(attr.name()));
        }
        let value = attr.parse_value(raw)?;
        info!("Writing {attr} = {value}");
        self.driver.write(attr, &value).await?;
        self.cache.invalidate();
        if attr == Attribute::Control {
            self.run_state.invalidate();
        }
        Ok(())
    }

    pub async fn on(&mut self) -> CryoResult<()> {
        self.set_control(true).await
    }

    pub async fn off(&mut self) -> CryoResult<()> {
        self.set_control(false).await
    }

    async fn set_control(&mut self, on: bool) -> CryoResult<()> {
        self.driver.set_control(on).await?;
        self.cache.invalidate();
        self.run_state.invalidate();
        Ok(())
    }

    /// Raw pass-through to the instrument.
    pub async fn run(&mut self, command: &str) -> CryoResult<String> {
        info!("Running raw command '{}'", command.trim());
        self.driver.ask(command).await
    }

    /// Derives (state, status) from an explicit control value, or refreshes
    /// it from the instrument when the last derivation is old enough.
    pub async fn derive_state(&mut self, control: Option<CryoResult<bool>>) -> (DevState, String) {
        let now = Instant::now();
        let control = match control {
            Some(control) => control,
            None if self.run_state.is_due(now) => self.driver.control().await,
            None => return self.run_state.current(),
        };
        self.run_state.apply(control.as_ref().copied(), now)
    }

    /// Current state, refreshed at most once per second.
    pub async fn state(&mut self) -> (DevState, String) {
        self.derive_state(None).await
    }

    /// Last derived state, without touching the instrument.
    pub fn current_state(&self) -> (DevState, String) {
        self.run_state.current()
    }

    pub fn set_channel_unit(&mut self, _units: &str) -> CryoResult<()> {
        Err(CryoError::NotImplemented("SetChannelUnit"))
    }

    /// Locks the front panel when configured to. Failures are only logged.
    pub async fn lock_front_panel(&mut self) {
        if !self.auto_lock {
            return;
        }
        match self.driver.lock_front_panel(true).await {
            Ok(()) => info!("Front panel locked"),
            Err(e) => warn!("Failed to lock front panel: {e}"),
        }
    }

    /// Closes the connection. Failures are only logged.
    pub async fn close(&mut self) {
        if let Err(e) = self.driver.close().await {
            warn!("Failed to close connection: {e}");
        }
    }
}

fn control_value(entries: &[Entry]) -> CryoResult<bool> {
    match entries.first() {
        Some((Attribute::Control, Ok(Value::Bool(on)))) => Ok(*on),
        Some((Attribute::Control, Err(e))) => Err(e.clone()),
        _ => Err(CryoError::Decode {
            command: Attribute::Control.query().to_string(),
            reply: String::new(),
            reason: "control state unavailable".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attributes::{ChannelId, LoopAttr, LoopId},
        testing::{FakeInstrument, fake_device as device},
    };
    use pretty_assertions::assert_eq;

    const A: Attribute = Attribute::Channel(ChannelId::A);
    const B: Attribute = Attribute::Channel(ChannelId::B);
    const C: Attribute = Attribute::Channel(ChannelId::C);

    fn setpoint(n: u8) -> Attribute {
        Attribute::Loop(LoopId::new(n).unwrap(), LoopAttr::SetPoint)
    }

    #[tokio::test]
    async fn poll_leads_with_control_in_one_line() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        let entries = dev.poll(&[A, B]).await.unwrap().to_vec();

        assert_eq!(
            entries,
            vec![
                (Attribute::Control, Ok(Value::Bool(false))),
                (A, Ok(Value::Float(77.345))),
                (B, Ok(Value::Float(300.12))),
            ]
        );
        assert_eq!(
            fake.received(),
            vec!["CONTROL?;INPUT A:TEMP?;INPUT B:TEMP?"]
        );
    }

    #[tokio::test]
    async fn requested_control_is_not_duplicated() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        let entries = dev.poll(&[A, Attribute::Control]).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, Attribute::Control);
        assert_eq!(fake.received(), vec!["CONTROL?;INPUT A:TEMP?"]);
    }

    #[tokio::test]
    async fn poll_derives_state_from_control() {
        let fake = FakeInstrument::new();
        fake.set_reply("CONTROL?", "ON");
        let mut dev = device(&fake);

        dev.poll(&[A]).await.unwrap();
        assert_eq!(dev.state().await, (DevState::On, "Control is On".to_string()));
        // Served from the derivation made by the poll.
        assert_eq!(fake.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_entry_is_isolated_and_surfaces_on_read() {
        let fake = FakeInstrument::new();
        fake.set_reply("INPUT B:TEMP?", "NAK");
        let mut dev = device(&fake);

        dev.poll(&[A, B]).await.unwrap();

        assert_eq!(dev.cached(A).unwrap().value, Value::Float(77.345));
        let err = dev.cached(B).unwrap_err();
        assert!(matches!(&err, CryoError::Decode { reply, .. } if reply == "NAK"));
        // Still the same error on the next read within the validity period.
        assert_eq!(dev.read("channelb").await.unwrap_err(), err);
        assert_eq!(fake.received().len(), 1);
        assert_eq!(dev.failed(), vec!["channelb".to_string()]);

        // Cleared once a later poll succeeds for the attribute.
        fake.set_reply("INPUT B:TEMP?", "299.5");
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(dev.read("channelb").await.unwrap().value, Value::Float(299.5));
        assert!(dev.failed().is_empty());
    }

    #[tokio::test]
    async fn control_error_faults_the_state_without_aborting_the_batch() {
        let fake = FakeInstrument::new();
        fake.set_reply("CONTROL?", "WARM");
        let mut dev = device(&fake);

        let entries = dev.poll(&[A]).await.unwrap().to_vec();
        assert!(entries[0].1.is_err());
        assert_eq!(entries[1], (A, Ok(Value::Float(77.345))));

        let (state, status) = dev.state().await;
        assert_eq!(state, DevState::Fault);
        assert!(status.starts_with("Error: "));
        assert!(status.contains("WARM"));
    }

    #[tokio::test]
    async fn connection_failure_leaves_cache_untouched() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);
        dev.poll(&[A]).await.unwrap();
        let before = dev.cache.entries().to_vec();

        fake.set_mute(true);
        let err = dev.poll(&[A, B]).await.unwrap_err();
        assert!(err.is_connection_failure());
        assert_eq!(dev.cache.entries(), before.as_slice());

        fake.set_raw_reply(Some("OFF"));
        fake.set_mute(false);
        let err = dev.poll(&[A, B]).await.unwrap_err();
        assert_eq!(err, CryoError::ReplyCount { expected: 3, got: 1 });
        assert_eq!(dev.cache.entries(), before.as_slice());

        fake.set_raw_reply(None);
        dev.poll(&[B]).await.unwrap();
        assert!(!dev.cache.contains(A));
        assert_eq!(fake.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_poll_only_when_stale() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        let reading = dev.read("channelA").await.unwrap();
        assert_eq!(reading.value, Value::Float(77.345));
        assert_eq!(reading.quality, Quality::Valid);
        assert!(reading.unix_timestamp() > 0.0);

        dev.read("channela").await.unwrap();
        assert_eq!(fake.received().len(), 1);

        // Not part of the last poll, so it is fetched even though fresh.
        dev.read("channeld").await.unwrap();
        assert_eq!(fake.received().len(), 2);

        tokio::time::advance(Duration::from_millis(100)).await;
        dev.read("channeld").await.unwrap();
        assert_eq!(fake.received().len(), 3);
    }

    #[tokio::test]
    async fn read_many_refreshes_in_one_batch() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        let readings = dev.read_many(&[A, C, setpoint(2)]).await.unwrap();
        assert_eq!(fake.received(), vec!["CONTROL?;INPUT A:TEMP?;INPUT C:TEMP?;LOOP 2:SETPT?"]);

        assert_eq!(readings[0].as_ref().unwrap().value, Value::Float(77.345));
        let missing = readings[1].as_ref().unwrap();
        assert_eq!(missing.quality, Quality::Invalid);
        assert!(matches!(missing.value, Value::Float(v) if v.is_nan()));
        assert_eq!(readings[2].as_ref().unwrap().value, Value::Float(80.0));
    }

    #[tokio::test]
    async fn missing_text_renders_empty() {
        let fake = FakeInstrument::new();
        fake.set_reply("LOOP 1:TYPE?", "----");
        let mut dev = device(&fake);

        let reading = dev.read("loop1type").await.unwrap();
        assert_eq!(reading.value, Value::Text(String::new()));
        assert_eq!(reading.quality, Quality::Invalid);
    }

    #[tokio::test]
    async fn undeclared_names_are_rejected() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        assert_eq!(
            dev.read("loop3setpoint").await,
            Err(CryoError::UnknownAttribute("loop3setpoint".into()))
        );
        assert_eq!(
            dev.read("banana").await,
            Err(CryoError::UnknownAttribute("banana".into()))
        );
        assert_eq!(fake.connects(), 0);
    }

    #[tokio::test]
    async fn writes_reach_the_instrument() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        dev.write("loop2setpoint", "42.5").await.unwrap();
        dev.write("loop1ramp", "on").await.unwrap();
        dev.write("loop1range", "mid").await.unwrap();
        assert_eq!(
            fake.received(),
            vec!["LOOP 2:SETPT 42.5", "LOOP 1:RAMP ON", "LOOP 1:RANGE MID"]
        );

        let reading = dev.read("loop2setpoint").await.unwrap();
        assert_eq!(reading.value, Value::Float(42.5));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_after_a_write_see_the_new_value() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        assert_eq!(dev.read("loop1setpoint").await.unwrap().value, Value::Float(80.0));
        assert_eq!(dev.read("control").await.unwrap().value, Value::Bool(false));

        dev.write("loop1setpoint", "42.5").await.unwrap();
        assert_eq!(dev.read("loop1setpoint").await.unwrap().value, Value::Float(42.5));

        dev.on().await.unwrap();
        assert_eq!(dev.read("control").await.unwrap().value, Value::Bool(true));
        assert_eq!(
            fake.received(),
            vec![
                "CONTROL?;LOOP 1:SETPT?",
                "LOOP 1:SETPT 42.5",
                "CONTROL?;LOOP 1:SETPT?",
                "CONTROL",
                "CONTROL?",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_writes_do_not_touch_the_connection() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        assert_eq!(
            dev.write("channela", "4").await,
            Err(CryoError::ReadOnly("channela".into()))
        );
        assert_eq!(
            dev.write("loop1pgain", "4").await,
            Err(CryoError::ReadOnly("loop1pgain".into()))
        );
        assert!(matches!(
            dev.write("loop1setpoint", "cold").await,
            Err(CryoError::InvalidValue { .. })
        ));
        assert_eq!(fake.connects(), 0);
    }

    #[tokio::test]
    async fn on_and_off_drive_the_state() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        dev.on().await.unwrap();
        assert_eq!(dev.state().await.0, DevState::On);
        dev.off().await.unwrap();
        assert_eq!(dev.state().await, (DevState::Off, "Control is Off".to_string()));

        dev.write("control", "true").await.unwrap();
        assert_eq!(dev.state().await.0, DevState::On);
    }

    #[tokio::test(start_paused = true)]
    async fn state_refresh_is_throttled() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        let first = dev.state().await;
        assert_eq!(first, (DevState::Off, "Control is Off".to_string()));

        fake.set_reply("CONTROL?", "ON");
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(dev.state().await, first);
        assert_eq!(fake.received().len(), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(dev.state().await.0, DevState::On);
        assert_eq!(fake.received().len(), 2);
    }

    #[tokio::test]
    async fn state_query_failure_is_a_fault() {
        let fake = FakeInstrument::new();
        fake.set_refuse_connections(true);
        let mut dev = device(&fake);

        let (state, status) = dev.state().await;
        assert_eq!(state, DevState::Fault);
        assert_eq!(status, "Error: connection error: connection refused");
    }

    #[tokio::test]
    async fn explicit_values_bypass_the_throttle() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        assert_eq!(dev.derive_state(Some(Ok(true))).await.0, DevState::On);
        assert_eq!(dev.derive_state(Some(Ok(false))).await.0, DevState::Off);
        let (state, status) = dev
            .derive_state(Some(Err(CryoError::Connection("x".into()))))
            .await;
        assert_eq!(state, DevState::Fault);
        assert!(status.contains('x'));
        assert_eq!(fake.connects(), 0);
    }

    #[tokio::test]
    async fn run_passes_raw_commands() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        assert_eq!(dev.run("*IDN?").await.unwrap(), "Cryo-con,24C,204683,1.06A");
        assert_eq!(dev.run("SYSTEM:BEEP 1").await.unwrap(), "");
    }

    #[tokio::test]
    async fn set_channel_unit_is_not_implemented() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);
        assert_eq!(
            dev.set_channel_unit("KKKK"),
            Err(CryoError::NotImplemented("SetChannelUnit"))
        );
    }

    #[tokio::test]
    async fn front_panel_lock_follows_configuration() {
        let fake = FakeInstrument::new();
        let mut dev = device(&fake);

        dev.lock_front_panel().await;
        assert!(fake.received().is_empty());

        dev.auto_lock = true;
        dev.lock_front_panel().await;
        assert_eq!(fake.received(), vec!["SYSTEM:LOCKOUT ON"]);

        fake.set_refuse_connections(true);
        dev.close().await;
        dev.lock_front_panel().await;
    }

    #[test]
    fn from_config_rejects_empty_tables_without_io() {
        let config = Config {
            used_channels: String::new(),
            url: "tcp://127.0.0.1:1".into(),
            ..Config::default()
        };
        assert!(matches!(
            CryoConDevice::from_config(&config),
            Err(CryoError::Config(_))
        ));

        let config = Config {
            used_loops: vec![],
            ..config
        };
        assert!(matches!(
            CryoConDevice::from_config(&config),
            Err(CryoError::Config(_))
        ));
    }

    #[test]
    fn from_config_declares_configured_attributes() {
        let config = Config {
            used_channels: "AB".into(),
            used_loops: vec![1],
            url: "tcp://127.0.0.1".into(),
            ..Config::default()
        };
        let dev = CryoConDevice::from_config(&config).unwrap();
        assert_eq!(dev.attributes().len(), 2 + 2 + LoopAttr::ALL.len());
        assert!(dev.resolve("channelc").is_err());
        assert_eq!(dev.resolve("Loop1Output"), Ok(Attribute::Loop(LoopId::new(1).unwrap(), LoopAttr::Output)));
    }
}
