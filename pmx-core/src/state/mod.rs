//! Connection and command state shared by the client and server sessions.

pub mod pending;
pub mod pipe;

pub use pending::{CommandPhase, Delivery, InFlight, PendingTable};
pub use pipe::{PipeState, PipeStateMachine};
