//! Trait objects standing in for `original_source`'s callback-function-table
//! (`IMasterConnection`'s handler slots, keyed by ASDU type/purpose). The
//! Design Notes call for turning untyped callback/user-pointer pairs into
//! ordinary trait objects with captured environment; this module is that
//! translation.

use std::net::IpAddr;

use crate::asdu::AsduView;
use crate::facade::ConnectionFacade;

/// Whether a registered ASDU handler claims responsibility for the command
/// it was given. An unclaimed ASDU falls through to `generic_asdu`, and
/// ultimately to the engine's `UNKNOWN_TYPE_ID`/`UNKNOWN_COT` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Handled,
    NotHandled,
}

/// Per-type command handlers, dispatched by `connection::handle_asdu`
/// according to the type-identification/COT table in SPEC_FULL.md §4.9.
pub trait AsduHandler: Send + Sync {
    fn interrogation(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    fn counter_interrogation(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    fn read(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    fn clock_sync(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    fn reset_process(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    fn delay_acquisition(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }

    /// Catch-all for anything not covered by a dedicated callback above.
    fn generic_asdu(&self, _conn: &ConnectionFacade, _asdu: &AsduView) -> HandlerResult {
        HandlerResult::NotHandled
    }
}

/// A handler that claims nothing; every ASDU falls through to the engine's
/// standard `UNKNOWN_TYPE_ID`/`UNKNOWN_COT` response. Useful as a default
/// and in tests.
pub struct NullAsduHandler;

impl AsduHandler for NullAsduHandler {}

/// Connection lifecycle and raw-message observation callbacks.
pub trait ConnectionEventHandler: Send + Sync {
    /// Called before accepting a new TCP connection; returning `false`
    /// rejects it before any APCI handshake occurs.
    fn connection_request(&self, _peer: IpAddr) -> bool {
        true
    }

    fn opened(&self, _conn: &ConnectionFacade) {}

    fn closed(&self, _conn: &ConnectionFacade) {}

    fn activated(&self, _conn: &ConnectionFacade) {}

    fn deactivated(&self, _conn: &ConnectionFacade) {}

    fn raw_message_received(&self, _conn: &ConnectionFacade, _bytes: &[u8]) {}

    fn raw_message_sent(&self, _conn: &ConnectionFacade, _bytes: &[u8]) {}
}

pub struct NullConnectionEventHandler;

impl ConnectionEventHandler for NullConnectionEventHandler {}
