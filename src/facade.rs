//! The narrow interface handed to user callbacks, grounded on
//! `original_source`'s `IMasterConnection` façade: enough to answer a
//! command and nothing that would let a handler reach into scheduling or
//! queue internals.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::AppLayerParameters;
use crate::connection::Connection;
use crate::error::Result;

#[derive(Clone)]
pub struct ConnectionFacade {
    pub(crate) connection: Arc<Connection>,
}

impl ConnectionFacade {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        ConnectionFacade { connection }
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    /// Sends an ASDU as a response. Queues it on the high-priority queue if
    /// the sliding window is currently full, matching
    /// `send_asdu_internal`'s fallback in the source.
    pub fn send_asdu(&self, asdu: &[u8]) -> Result<()> {
        self.connection.send_asdu_internal(asdu)
    }

    /// Sends the same ASDU back with COT rewritten to an activation
    /// confirmation (optionally negative).
    pub fn send_act_con(&self, asdu: &[u8], negative: bool) -> Result<()> {
        self.connection.send_act_con(asdu, negative)
    }

    pub fn send_act_term(&self, asdu: &[u8]) -> Result<()> {
        self.connection.send_act_term(asdu)
    }

    pub fn close(&self) {
        self.connection.request_close();
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn app_layer_parameters(&self) -> AppLayerParameters {
        self.connection.app_layer_parameters()
    }
}
