//! Line-oriented transport to the controller.
//!
//! The instrument speaks newline-terminated ASCII over either a serial line
//! or a raw TCP socket. [`ConnectionSpec`] turns the configured URL into
//! transport parameters; [`Connection`] owns the open stream, connects lazily
//! on first use and drops the stream after any transport failure so the next
//! request starts from a fresh connection.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};
use tokio_serial::SerialPortBuilderExt;
use url::Url;

use crate::{
    config::{Config, Parity},
    error::{CryoError, CryoResult},
};

/// Port used by the instrument's ethernet interface.
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Anything the connection can read lines from and write lines to.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Opens a fresh stream to the instrument.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> CryoResult<Box<dyn Stream>>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transport {
    Serial {
        path: String,
        baudrate: u32,
        bytesize: u8,
        parity: Parity,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

/// Transport parameters resolved from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub transport: Transport,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
}

impl ConnectionSpec {
    pub fn from_config(config: &Config) -> CryoResult<Self> {
        let transport = parse_url(config)?;
        let (connect_timeout, reply_timeout) = match transport {
            Transport::Serial { .. } => {
                let serial = seconds("serial_timeout", config.serial_timeout)?;
                (serial, serial)
            }
            Transport::Tcp { .. } => (
                seconds("tcp_connection_timeout", config.tcp_connection_timeout)?,
                seconds("tcp_timeout", config.tcp_timeout)?,
            ),
        };

        Ok(Self {
            transport,
            connect_timeout,
            reply_timeout,
        })
    }
}

fn seconds(name: &str, value: f64) -> CryoResult<Duration> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(CryoError::Config(format!(
            "{name} must be a positive number of seconds, got {value}"
        ))),
    }
}

fn parse_url(config: &Config) -> CryoResult<Transport> {
    let serial = |path: &str| -> CryoResult<Transport> {
        if path.is_empty() {
            return Err(CryoError::Config(format!(
                "serial url '{}' has no device path",
                config.url
            )));
        }
        Ok(Transport::Serial {
            path: path.to_string(),
            baudrate: config.baudrate,
            bytesize: config.bytesize,
            parity: config.parity,
        })
    };

    let url = match Url::parse(&config.url) {
        Ok(url) => url,
        // A bare device path such as /dev/ttyUSB0.
        Err(url::ParseError::RelativeUrlWithoutBase) => return serial(config.url.trim()),
        Err(e) => {
            return Err(CryoError::Config(format!(
                "malformed url '{}': {e}",
                config.url
            )));
        }
    };

    match url.scheme() {
        "serial" => serial(url.path()),
        "tcp" => {
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| CryoError::Config(format!("tcp url '{}' has no host", config.url)))?;
            Ok(Transport::Tcp {
                host: host.to_string(),
                port: url.port().unwrap_or(DEFAULT_TCP_PORT),
            })
        }
        "rfc2217" => Err(CryoError::Config(format!(
            "rfc2217 connections are not supported ('{}')",
            config.url
        ))),
        other => Err(CryoError::Config(format!(
            "unsupported url scheme '{other}' in '{}'",
            config.url
        ))),
    }
}

fn data_bits(bytesize: u8) -> CryoResult<tokio_serial::DataBits> {
    match bytesize {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(CryoError::Config(format!(
            "bytesize must be 5, 6, 7 or 8, got {other}"
        ))),
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[async_trait]
impl Connector for ConnectionSpec {
    async fn connect(&self) -> CryoResult<Box<dyn Stream>> {
        match &self.transport {
            Transport::Serial {
                path,
                baudrate,
                bytesize,
                parity,
            } => {
                let port = tokio_serial::new(path, *baudrate)
                    .data_bits(data_bits(*bytesize)?)
                    .parity((*parity).into())
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .timeout(self.reply_timeout)
                    .open_native_async()
                    .map_err(|e| CryoError::Connection(format!("cannot open {path}: {e}")))?;
                Ok(Box::new(port))
            }
            Transport::Tcp { host, port } => {
                let stream = timeout(
                    self.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| CryoError::Timeout(self.connect_timeout))?
                .map_err(|e| CryoError::Connection(format!("cannot connect to {host}:{port}: {e}")))?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    fn describe(&self) -> String {
        match &self.transport {
            Transport::Serial { path, baudrate, .. } => format!("serial {path} @ {baudrate}"),
            Transport::Tcp { host, port } => format!("tcp {host}:{port}"),
        }
    }
}

/// A lazily opened, line-oriented connection to the instrument.
pub struct Connection {
    connector: Box<dyn Connector>,
    reply_timeout: Duration,
    stream: Option<BufReader<Box<dyn Stream>>>,
}

impl Connection {
    pub fn new(connector: Box<dyn Connector>, reply_timeout: Duration) -> Self {
        Self {
            connector,
            reply_timeout,
            stream: None,
        }
    }

    /// Whether a stream is currently open.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends one line and, when `expect_reply` is set, waits for one reply
    /// line. The reply is returned without its line terminator.
    ///
    /// Any transport failure closes the connection.
    pub async fn request(&mut self, line: &str, expect_reply: bool) -> CryoResult<Option<String>> {
        let result = self.exchange(line, expect_reply).await;
        if let Err(e) = &result {
            if e.is_connection_failure() && self.stream.take().is_some() {
                warn!("Dropping connection to {}: {e}", self.connector.describe());
            }
        }
        result
    }

    async fn exchange(&mut self, line: &str, expect_reply: bool) -> CryoResult<Option<String>> {
        let reply_timeout = self.reply_timeout;
        let stream = self.stream().await?;

        debug!("-> {line}");
        stream.write_all(format!("{line}\n").as_bytes()).await?;
        stream.flush().await?;

        if !expect_reply {
            return Ok(None);
        }

        let mut reply = String::new();
        let read = timeout(reply_timeout, stream.read_line(&mut reply))
            .await
            .map_err(|_| CryoError::Timeout(reply_timeout))??;
        if read == 0 {
            return Err(CryoError::Connection("connection closed by instrument".into()));
        }

        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!("<- {reply}");
        Ok(Some(reply))
    }

    async fn stream(&mut self) -> CryoResult<&mut BufReader<Box<dyn Stream>>> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let target = self.connector.describe();
                let stream = self.connector.connect().await?;
                info!("Connected to {target}");
                BufReader::new(stream)
            }
        };
        Ok(self.stream.insert(stream))
    }

    /// Drops the stream; the next request reconnects.
    pub async fn close(&mut self) -> CryoResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            info!("Closed connection to {}", self.connector.describe());
        }
        Ok(())
    }
}
