//! Abstract interfaces between the adapter and its hosting application.
//!
//! These traits define the contracts for:
//! - Inbound dispatch (handing consumed events to application logic)
//! - Declared interest (which topics the application listens to)
//! - Processing outcomes (recoverable vs. unrecoverable failures)

pub mod dispatcher;
pub mod router;

pub use dispatcher::{InboundDispatcher, Interest, ProcessingError};
pub use router::{EventHandler, EventRouter};
