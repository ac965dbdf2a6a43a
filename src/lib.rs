//! Clique connector.
//!
//! Reliable request/response exchanges between a coordinator and competing
//! agents over an at-least-once message broker.
//!
//! - [`envelope`]: JSON envelopes identified by a content checksum
//! - [`topology`]: command queue, response queues, status exchange
//! - [`messenger`]: publisher and cancellable listeners
//! - [`correlator`]: the requester and responder exchanges
//! - [`broker`]: the broker collaborator (AMQP or in-process)

pub mod broker;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod messenger;
pub mod topology;
pub mod utils;

pub use correlator::{
    Connector, Machine, MachineProvider, MachineRequest, RequestHandler, ServeOutcome, Serving,
};
pub use envelope::{Checksum, Envelope, Headers, Payload, PeerId};
pub use error::{Error, Result, Stage};
pub use messenger::{CancelHandle, Incoming, Messenger, Subscription};
