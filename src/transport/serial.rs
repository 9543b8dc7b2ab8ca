//! Serial implementation of the MCU channel.
//!
//! 115200 baud, 8N1, newline-delimited JSON frames. The port sits behind an
//! async mutex; a request writes one line and reads one line under the same
//! guard, so replies cannot be attributed to the wrong request.

use super::Transport;
use crate::error::TransportError;
use crate::protocol::{self, McuRequest, McuResponse};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const BAUD_RATE: u32 = 115_200;

pub struct SerialTransport {
    path: String,
    port: Mutex<Option<BufReader<SerialPort>>>,
    broken: AtomicBool,
    /// Set after a timeout: the next request discards any stale reply bytes
    /// before writing, keeping request/reply pairing intact.
    stale_input: AtomicBool,
}

impl SerialTransport {
    /// Open the port and wait out the firmware's boot banner.
    pub async fn open(path: &str) -> Result<Self, TransportError> {
        let reader = Self::open_port(path)?;
        Ok(Self {
            path: path.to_string(),
            port: Mutex::new(Some(reader)),
            broken: AtomicBool::new(false),
            stale_input: AtomicBool::new(false),
        })
    }

    fn open_port(path: &str) -> Result<BufReader<SerialPort>, TransportError> {
        let port = SerialPort::open(path, |mut settings: serial2::Settings| {
            settings.set_raw();
            settings.set_baud_rate(BAUD_RATE)?;
            Ok(settings)
        })
        .map_err(|e| TransportError::Io(format!("open {path}: {e}")))?;
        Ok(BufReader::new(port))
    }

    fn mark_broken(&self, context: &str, err: &std::io::Error) -> TransportError {
        warn!("serial link broken during {context}: {err}");
        self.broken.store(true, Ordering::SeqCst);
        TransportError::Io(format!("{context}: {err}"))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send_request(
        &self,
        request: &McuRequest,
        timeout: Duration,
    ) -> Result<McuResponse, TransportError> {
        if self.is_broken() {
            return Err(TransportError::LinkLost);
        }
        let mut guard = self.port.lock().await;

        if self.stale_input.swap(false, Ordering::SeqCst) {
            // rebuild the reader so both the OS buffers and any partially
            // buffered line are gone before the next exchange
            let inner = guard.take().ok_or(TransportError::LinkLost)?.into_inner();
            if let Err(e) = inner.discard_buffers() {
                return Err(self.mark_broken("input drain", &e));
            }
            *guard = Some(BufReader::new(inner));
        }
        let reader = guard.as_mut().ok_or(TransportError::LinkLost)?;

        let frame = protocol::encode_frame(request)?;
        debug!(cmd = request.name(), "-> {}", frame.trim());
        if let Err(e) = reader.get_mut().write_all(frame.as_bytes()).await {
            *guard = None;
            return Err(self.mark_broken("write", &e));
        }

        let mut line = String::new();
        match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
            Err(_) => {
                self.stale_input.store(true, Ordering::SeqCst);
                Err(TransportError::Timeout)
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(self.mark_broken("read", &e))
            }
            Ok(Ok(0)) => {
                *guard = None;
                let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "port closed");
                Err(self.mark_broken("read", &e))
            }
            Ok(Ok(_)) => {
                debug!(cmd = request.name(), "<- {}", line.trim());
                protocol::decode_reply(&line)
            }
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let reader = Self::open_port(&self.path)?;
        let mut guard = self.port.lock().await;
        *guard = Some(reader);
        self.stale_input.store(false, Ordering::SeqCst);
        self.broken.store(false, Ordering::SeqCst);
        debug!("serial link to {} reopened", self.path);
        Ok(())
    }
}
