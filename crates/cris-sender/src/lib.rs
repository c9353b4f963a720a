//! Cris sender
//!
//! Client side of the command bus: command graphs, ambient value
//! propagation and a retrying sender over pluggable transports.

pub mod ambient;
pub mod command;
pub mod error;
pub mod sender;
pub mod transport;

pub use ambient::{apply_ambient_values, ApplyReport, MAX_DEPTH};
pub use command::{ClientCommand, CommandModel, CommandRef, FieldValue};
pub use error::{CommunicationError, Result, SenderError, TransportError};
pub use sender::{CrisSender, SenderConfig};
pub use transport::{LocalTransport, Transport};
