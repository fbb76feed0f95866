use super::*;
use crate::transport::announce_table::DEFAULT_ANNOUNCE_CAP;

impl TransportConfig {
    pub fn new<T: Into<String>>(name: T, identity: &PrivateIdentity, broadcast: bool) -> Self {
        Self {
            name: name.into(),
            identity: identity.clone(),
            broadcast,
            retransmit: false,
            announce_cache_capacity: 100_000,
            announce_retry_limit: announce_table::DEFAULT_RETRIES,
            announce_cap_fraction: DEFAULT_ANNOUNCE_CAP,
            path_request_queue_len: 64,
            path_request_cap: 128,
            path_request_timeout_secs: 30,
            link_proof_timeout_secs: 60,
            link_idle_timeout_secs: 900,
            resource_retry_interval_secs: 2,
            resource_retry_limit: 5,
            path_ttls: PathTtlConfig::default(),
            storage: None,
            panic_on_interface_error: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &PrivateIdentity {
        &self.identity
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.broadcast = broadcast;
    }

    pub fn set_retransmit(&mut self, retransmit: bool) {
        self.retransmit = retransmit;
    }

    pub fn set_announce_cache_capacity(&mut self, capacity: usize) {
        self.announce_cache_capacity = capacity;
    }

    pub fn set_announce_retry_limit(&mut self, limit: u8) {
        self.announce_retry_limit = limit;
    }

    /// Fraction of each interface's bitrate that outbound announces may
    /// occupy.
    pub fn set_announce_cap_fraction(&mut self, fraction: f64) {
        self.announce_cap_fraction = fraction;
    }

    pub fn set_path_request_queue_len(&mut self, len: usize) {
        self.path_request_queue_len = len;
    }

    pub fn set_path_request_cap(&mut self, cap: usize) {
        self.path_request_cap = cap;
    }

    pub fn set_path_request_timeout_secs(&mut self, secs: u64) {
        self.path_request_timeout_secs = secs;
    }

    pub fn set_link_proof_timeout_secs(&mut self, secs: u64) {
        self.link_proof_timeout_secs = secs;
    }

    pub fn set_link_idle_timeout_secs(&mut self, secs: u64) {
        self.link_idle_timeout_secs = secs;
    }

    pub fn set_resource_retry_interval_secs(&mut self, secs: u64) {
        self.resource_retry_interval_secs = secs;
    }

    pub fn set_resource_retry_limit(&mut self, limit: u8) {
        self.resource_retry_limit = limit;
    }

    pub fn set_path_ttls(&mut self, ttls: PathTtlConfig) {
        self.path_ttls = ttls;
    }

    /// Enables persistence under a config root: destination table, packet
    /// hashlist, tunnels, announce cache and the ratchet ledger.
    pub fn set_storage_root<P: Into<PathBuf>>(&mut self, root: P) {
        self.storage = Some(StoragePaths::new(root));
    }

    /// When set, an unrecoverable interface error brings the instance down
    /// instead of silently detaching the interface.
    pub fn set_panic_on_interface_error(&mut self, panic: bool) {
        self.panic_on_interface_error = panic;
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new("tp", &PrivateIdentity::generate(OsRng), false)
    }
}
