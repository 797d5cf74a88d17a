//! Server-side ("slave") implementation of the IEC 60870-5-104 telecontrol
//! protocol: APCI framing, per-connection sliding-window sequencing,
//! priority-ordered ASDU queues, and redundancy-group fan-out.

pub mod apci;
pub mod asdu;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod handler;
pub mod ip;
pub mod queue;
pub mod redundancy;
pub mod scheduler;
pub mod server;
pub mod time;

pub use config::{ApciParameters, AppLayerParameters, ServerConfig, ServerMode};
pub use error::{Error, Result};
pub use facade::ConnectionFacade;
pub use handler::{
    AsduHandler, ConnectionEventHandler, HandlerResult, NullAsduHandler, NullConnectionEventHandler,
};
pub use scheduler::{ThreadedScheduler, TickScheduler};
pub use server::{GroupSpec, Server};
