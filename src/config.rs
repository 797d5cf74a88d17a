//! Runtime configuration: the engine is configured purely through
//! constructor calls from embedding code, never a config file, mirroring
//! `defaultConnectionParameters`/`defaultAppLayerParameters` in the source
//! this crate is grounded on.

use crate::error::Error;

/// Sliding-window and timer parameters for the APCI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApciParameters {
    /// Maximum outstanding unacknowledged I-frames.
    pub k: u16,
    /// Receiver must acknowledge at least every `w` I-frames.
    pub w: u16,
    /// Seconds: connection-establishment timeout.
    pub t0: u32,
    /// Seconds: send-ack timeout.
    pub t1: u32,
    /// Seconds: ack-delay timeout.
    pub t2: u32,
    /// Seconds: idle/test-frame timeout.
    pub t3: u32,
}

impl Default for ApciParameters {
    fn default() -> Self {
        ApciParameters {
            k: 12,
            w: 8,
            t0: 10,
            t1: 15,
            t2: 10,
            t3: 20,
        }
    }
}

impl ApciParameters {
    pub fn new(k: u16, w: u16, t0: u32, t1: u32, t2: u32, t3: u32) -> Result<Self, Error> {
        let p = ApciParameters { k, w, t0, t1, t2, t3 };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.k == 0 {
            return Err(Error::InvalidConfig("k must be non-zero"));
        }
        if self.k > 32767 {
            return Err(Error::InvalidConfig("k must not exceed 32767"));
        }
        if self.w == 0 {
            return Err(Error::InvalidConfig("w must be non-zero"));
        }
        if self.w > self.k {
            return Err(Error::InvalidConfig("w must not exceed k"));
        }
        if self.t0 == 0 || self.t1 == 0 || self.t2 == 0 || self.t3 == 0 {
            return Err(Error::InvalidConfig("timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Field widths for the ASDU header, mirroring `defaultAppLayerParameters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppLayerParameters {
    pub size_of_type_id: u8,
    pub size_of_vsq: u8,
    pub size_of_cot: u8,
    pub size_of_ca: u8,
    pub size_of_ioa: u8,
    pub max_asdu_len: usize,
}

impl Default for AppLayerParameters {
    fn default() -> Self {
        AppLayerParameters {
            size_of_type_id: 1,
            size_of_vsq: 1,
            size_of_cot: 2,
            size_of_ca: 2,
            size_of_ioa: 3,
            max_asdu_len: crate::apci::MAX_ASDU_LEN,
        }
    }
}

impl AppLayerParameters {
    pub fn header_len(&self) -> usize {
        (self.size_of_type_id + self.size_of_vsq + self.size_of_cot + self.size_of_ca) as usize
    }
}

/// Decides how an incoming connection is bound to redundancy groups and
/// which connections are mutually exclusive for activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    /// One active connection at a time, sharing a single queue pair.
    Single,
    /// Every connection is its own implicit redundancy group.
    ConnectionIsGroup,
    /// Explicit redundancy groups, chosen by matching the peer's address.
    MultipleGroups,
}

/// Capacities for a redundancy group's queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub low_priority_capacity_bytes: usize,
    pub high_priority_capacity_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            low_priority_capacity_bytes: 100 * (6 + crate::apci::MAX_ASDU_LEN),
            high_priority_capacity_entries: 100,
        }
    }
}

/// Top-level, validated configuration for a `Server`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub mode: ServerMode,
    pub apci: ApciParameters,
    pub app_layer: AppLayerParameters,
    pub queue: QueueConfig,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 2404,
            mode: ServerMode::Single,
            apci: ApciParameters::default(),
            app_layer: AppLayerParameters::default(),
            queue: QueueConfig::default(),
            max_connections: 10,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.apci.validate()?;
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be non-zero"));
        }
        if self.queue.high_priority_capacity_entries == 0 {
            return Err(Error::InvalidConfig(
                "high_priority_capacity_entries must be non-zero",
            ));
        }
        Ok(())
    }
}
