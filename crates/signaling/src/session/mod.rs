//! Session management
//!
//! - [`SessionRegistry`]: which sessions are live and what they own
//! - [`CandidateBuffer`] / [`CandidateLane`]: ICE candidates that beat their
//!   transport endpoint, and ordered delivery once it exists
//! - [`SignalingSession`]: the per-connection state machine

pub mod candidates;
pub mod machine;
pub mod registry;

pub use candidates::{CandidateBuffer, CandidateLane};
pub use machine::{PendingCall, SignalingContext, SignalingSession};
pub use registry::{CandidateRoute, ResourceBundle, SessionPhase, SessionRegistry, SessionTicket, Teardown};
