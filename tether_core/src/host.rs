use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by the wireless host stack.
///
/// `Protocol` is the peer explicitly refusing an operation (an ATT error
/// response, for example). That is an expected fuzzing signal and is
/// recoverable; the other variants mean there is no usable peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Connection establishment failed; the session cannot start.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The peer rejected the operation at the protocol level.
    #[error("peer rejected the operation: {0}")]
    Protocol(String),

    /// The underlying transport failed (peer disconnected, link dropped).
    #[error("transport failure: {0}")]
    Transport(String),
}

/// One advertisement reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Peer address in the host stack's own textual form.
    pub address: String,
}

/// The BLE host stack consumed by the session driver.
///
/// Implementations own device power-on, scanning and connection
/// establishment. Advertisements are posted as events into the channel
/// returned by [`HostStack::start_scan`]; the driver polls that channel
/// rather than the stack reaching into shared session state.
#[async_trait]
pub trait HostStack: Send {
    type Conn: PeerConnection + Send;

    /// Begin scanning. Matching advertisements arrive on the returned
    /// receiver until [`HostStack::stop_scan`] is called.
    async fn start_scan(&mut self) -> Result<mpsc::Receiver<Advertisement>, HostError>;

    async fn stop_scan(&mut self) -> Result<(), HostError>;

    /// Establish a connection to the advertised peer. Only one connection
    /// attempt is ever in flight.
    async fn connect(&mut self, address: &str) -> Result<Self::Conn, HostError>;
}

/// An established connection to the peer's attribute server.
///
/// The three `discover_*` methods enumerate one level of the peer's
/// capability tree each; flattening and indexing is owned by
/// [`crate::attribute::AttributeTable`], not by implementations.
#[async_trait]
pub trait PeerConnection: Send {
    /// Handles of all primary services, in discovery order.
    async fn discover_services(&mut self) -> Result<Vec<u16>, HostError>;

    /// Handles of the characteristics of one service, in discovery order.
    async fn discover_characteristics(&mut self, service: u16) -> Result<Vec<u16>, HostError>;

    /// Handles of the descriptors of one characteristic, in discovery order.
    async fn discover_descriptors(&mut self, characteristic: u16) -> Result<Vec<u16>, HostError>;

    /// Write `payload` to the attribute at `handle`. With `confirm` set the
    /// write is acknowledged by the peer before this returns.
    async fn write(&mut self, handle: u16, payload: &[u8], confirm: bool) -> Result<(), HostError>;

    /// Read the current value of the attribute at `handle`. An empty value
    /// is a valid result.
    async fn read(&mut self, handle: u16) -> Result<Vec<u8>, HostError>;
}
