pub mod meldrx;
pub mod metrics;
pub mod session;
pub mod session_store;
pub mod streaming;
pub mod token_broker;

pub use meldrx::MeldRxClient;
pub use metrics::{get_metrics, init_metrics};
pub use session::{
    MediaHandle, SessionBootstrapper, SessionConfig, SessionEvent, SessionHandle, SessionPhase,
};
pub use session_store::{FileSessionStore, MemorySessionStore, SessionStateStore};
pub use streaming::{StreamingClient, StreamingSession};
pub use token_broker::{Clock, SystemClock, TokenBroker};
