pub mod attribute;
pub mod config;
pub mod frame;
pub mod host;
pub mod session;
pub mod signal;
pub mod transaction;

pub use attribute::{Attribute, AttributeKind, AttributeTable, TableError};
pub use config::TetherConfig;
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use host::{Advertisement, HostError, HostStack, PeerConnection};
pub use session::{SessionDriver, SessionError, SessionParams, SessionState, SessionVerdict};
pub use signal::{CompletionSignal, CompletionWait, SignalError, completion};
pub use transaction::{Outcome, TransactionExecutor};
