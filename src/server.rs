//! The slave server (C7): lifecycle, connection admission, and the
//! mode-dependent `enqueue_asdu` fan-out. Grounded on `original_source`'s
//! `CS104_Slave_start`/`CS104_Slave_enqueueASDU`/`getMatchingRedundancyGroup`.

use std::net::{IpAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::config::{ServerConfig, ServerMode};
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::handler::{AsduHandler, ConnectionEventHandler};
use crate::ip::AllowedClient;
use crate::redundancy::{self, RedundancyGroup};

/// A redundancy group's static definition, supplied up front for
/// `ServerMode::MultipleGroups`. `Single` and `ConnectionIsGroup` derive
/// their groups automatically and ignore this list.
#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    pub name: Option<String>,
    pub allowed_clients: Vec<AllowedClient>,
}

pub struct Server {
    config: ServerConfig,
    groups: Vec<Arc<RedundancyGroup>>,
    registry: ConnectionRegistry,
    asdu_handler: Arc<dyn AsduHandler>,
    event_handler: Arc<dyn ConnectionEventHandler>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        group_specs: Vec<GroupSpec>,
        asdu_handler: Arc<dyn AsduHandler>,
        event_handler: Arc<dyn ConnectionEventHandler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let groups = match config.mode {
            ServerMode::Single => {
                vec![Arc::new(RedundancyGroup::new(None, Vec::new(), config.queue))]
            }
            ServerMode::MultipleGroups => {
                if group_specs.is_empty() {
                    return Err(Error::InvalidConfig(
                        "MultipleGroups mode requires at least one group",
                    ));
                }
                group_specs
                    .into_iter()
                    .map(|g| Arc::new(RedundancyGroup::new(g.name, g.allowed_clients, config.queue)))
                    .collect()
            }
            ServerMode::ConnectionIsGroup => Vec::new(),
        };

        Ok(Arc::new(Server {
            config,
            groups,
            registry: Arc::new(Mutex::new(Vec::new())),
            asdu_handler,
            event_handler,
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Deposits `asdu` into the appropriate queue(s), per the server-mode
    /// fan-out in SPEC_FULL.md §4.6.
    pub fn enqueue_asdu(&self, asdu: &[u8]) -> Result<()> {
        if asdu.len() > self.config.app_layer.max_asdu_len {
            return Err(Error::Framing("ASDU exceeds configured maximum length"));
        }
        match self.config.mode {
            ServerMode::Single => {
                self.groups[0].low_priority.lock().unwrap().enqueue(asdu.to_vec());
            }
            ServerMode::MultipleGroups => {
                for group in &self.groups {
                    group.low_priority.lock().unwrap().enqueue(asdu.to_vec());
                }
            }
            ServerMode::ConnectionIsGroup => {
                for conn in self.registry.lock().unwrap().iter() {
                    conn.group.low_priority.lock().unwrap().enqueue(asdu.to_vec());
                }
            }
        }
        Ok(())
    }

    /// Accepts one TCP connection onto the registry, resolving its
    /// redundancy group and running the connection-request gate. Returns
    /// `Ok(None)` if the peer was rejected (not a connection-level error).
    pub(crate) fn admit(self: &Arc<Self>, stream: TcpStream, peer_addr: std::net::SocketAddr) -> Result<Option<Arc<Connection>>> {
        let peer_ip: IpAddr = peer_addr.ip();

        if self.registry.lock().unwrap().len() >= self.config.max_connections {
            warn!("rejecting connection from {peer_ip}: connection slot pool exhausted");
            return Ok(None);
        }

        if !self.event_handler.connection_request(peer_ip) {
            info!("rejecting connection from {peer_ip}: connection_request declined");
            return Ok(None);
        }

        let (group_index, group) = match self.config.mode {
            ServerMode::Single => (0, self.groups[0].clone()),
            ServerMode::MultipleGroups => match redundancy::resolve_group(&self.groups, peer_ip) {
                Some(g) => {
                    let idx = self.groups.iter().position(|x| Arc::ptr_eq(x, g)).unwrap();
                    (idx, self.groups[idx].clone())
                }
                None => {
                    warn!("rejecting connection from {peer_ip}: no matching redundancy group");
                    return Ok(None);
                }
            },
            ServerMode::ConnectionIsGroup => (
                0,
                Arc::new(RedundancyGroup::new(None, Vec::new(), self.config.queue)),
            ),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::new(
            id,
            stream,
            peer_addr,
            self.config.apci,
            self.config.app_layer,
            self.config.mode,
            group_index,
            group,
            self.registry.clone(),
            self.asdu_handler.clone(),
            self.event_handler.clone(),
        )?;

        self.registry.lock().unwrap().push(conn.clone());
        conn.opened();
        info!("connection {id} accepted from {peer_addr}");
        Ok(Some(conn))
    }

    /// Removes a connection from the registry and fires its close event.
    pub(crate) fn retire(&self, conn: &Arc<Connection>) {
        self.registry.lock().unwrap().retain(|c| c.id() != conn.id());
        conn.on_closed();
        info!("connection {} retired", conn.id());
    }

    pub(crate) fn snapshot_connections(&self) -> Vec<Arc<Connection>> {
        self.registry.lock().unwrap().clone()
    }
}
