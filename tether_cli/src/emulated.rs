//! In-process emulated peer for end-to-end smoke runs without radio
//! hardware. Exposes one service with a single writable characteristic,
//! rejects oversized bodies, and wedges on a magic marker so the driver's
//! timeout path can be exercised from the command line.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tether_core::{Advertisement, HostError, HostStack, PeerConnection};
use tokio::sync::mpsc;
use tracing::info;

/// Largest write body the emulated peer accepts.
const MAX_ACCEPTED_WRITE: usize = 64;
/// Bodies starting with this marker wedge the peer.
const WEDGE_MARKER: &[u8] = b"HANG";

const SERVICE_HANDLE: u16 = 0x0001;
const CHARACTERISTIC_HANDLE: u16 = 0x0003;

pub struct EmulatedHost {
    transport: String,
}

impl EmulatedHost {
    pub fn new(transport: &str) -> Self {
        Self {
            transport: transport.to_string(),
        }
    }
}

#[async_trait]
impl HostStack for EmulatedHost {
    type Conn = EmulatedConn;

    async fn start_scan(&mut self) -> Result<mpsc::Receiver<Advertisement>, HostError> {
        info!(transport = %self.transport, "emulated backend; transport address unused");
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx
                .send(Advertisement {
                    address: "emulated:00:01".into(),
                })
                .await;
        });
        Ok(rx)
    }

    async fn stop_scan(&mut self) -> Result<(), HostError> {
        Ok(())
    }

    async fn connect(&mut self, address: &str) -> Result<Self::Conn, HostError> {
        info!(address, "emulated peer connected");
        Ok(EmulatedConn::new())
    }
}

pub struct EmulatedConn {
    values: HashMap<u16, Vec<u8>>,
}

impl EmulatedConn {
    fn new() -> Self {
        Self {
            values: HashMap::from([(CHARACTERISTIC_HANDLE, vec![0u8])]),
        }
    }
}

#[async_trait]
impl PeerConnection for EmulatedConn {
    async fn discover_services(&mut self) -> Result<Vec<u16>, HostError> {
        Ok(vec![SERVICE_HANDLE])
    }

    async fn discover_characteristics(&mut self, service: u16) -> Result<Vec<u16>, HostError> {
        if service == SERVICE_HANDLE {
            Ok(vec![CHARACTERISTIC_HANDLE])
        } else {
            Ok(Vec::new())
        }
    }

    async fn discover_descriptors(&mut self, _characteristic: u16) -> Result<Vec<u16>, HostError> {
        Ok(Vec::new())
    }

    async fn write(&mut self, handle: u16, payload: &[u8], _confirm: bool) -> Result<(), HostError> {
        if payload.starts_with(WEDGE_MARKER) {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            unreachable!("wedged write should have been timed out by the driver");
        }
        if payload.len() > MAX_ACCEPTED_WRITE {
            return Err(HostError::Protocol(format!(
                "write of {} bytes exceeds the emulated MTU",
                payload.len()
            )));
        }
        match self.values.get_mut(&handle) {
            Some(slot) => {
                *slot = payload.to_vec();
                Ok(())
            }
            None => Err(HostError::Protocol(format!(
                "handle 0x{handle:04X} is not writable"
            ))),
        }
    }

    async fn read(&mut self, handle: u16) -> Result<Vec<u8>, HostError> {
        self.values
            .get(&handle)
            .cloned()
            .ok_or_else(|| HostError::Protocol(format!("handle 0x{handle:04X} is not readable")))
    }
}
