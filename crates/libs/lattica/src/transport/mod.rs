//! The transport instance: inbound dispatch, announce propagation, path and
//! link tables, resource transfers and the periodic maintenance jobs.

pub mod announce_limits;
pub mod announce_table;
pub mod link_table;
pub mod packet_cache;
pub mod path_requests;
pub mod path_table;

mod announce;
mod config;
mod core;
mod handler;
mod inbound;
mod jobs;
mod links;

pub use announce_table::{AnnounceBudget, AnnounceTable};
pub use link_table::LinkTable;
pub use packet_cache::PacketCache;
pub use path_requests::{PathRequests, TagBytes};
pub use path_table::{PathTable, PathTtlConfig};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::destination::link::{
    Link, LinkEvent, LinkEventData, LinkHandleResult, LinkId, LinkStatus,
};
use crate::destination::{
    DestinationAnnounce, DestinationDesc, DestinationHandleStatus, DestinationName,
    SingleInputDestination, SingleOutputDestination, NAME_HASH_LENGTH, RATCHET_LENGTH,
};
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash};
use crate::identity::{Identity, PrivateIdentity};
use crate::iface::{
    InterfaceManager, InterfaceMode, InterfaceRxReceiver, RxMessage, TxDispatchTrace, TxMessage,
    TxMessageType,
};
use crate::packet::{
    DestinationType, HeaderType, Packet, PacketContext, PacketPayload, PacketType,
    PropagationType,
};
use crate::ratchets::{now_secs, seal_for_public_key, RatchetLedger};
use crate::resource::{ResourceEvent, ResourceManager};
use crate::storage::StoragePaths;

/// Hop ceiling. A packet that would exceed this many hops is dropped by
/// every forwarder.
pub const PATHFINDER_M: u8 = 128;

const INTERVAL_LINKS_CHECK: Duration = Duration::from_secs(1);
const INTERVAL_INPUT_LINK_CLEANUP: Duration = Duration::from_secs(120);
const INTERVAL_OUTPUT_LINK_REPEAT: Duration = Duration::from_secs(6);
const INTERVAL_OUTPUT_LINK_KEEP: Duration = Duration::from_secs(5);
const INTERVAL_IFACE_CLEANUP: Duration = Duration::from_secs(10);
const INTERVAL_ANNOUNCES: Duration = Duration::from_secs(1);
const INTERVAL_TABLE_SWEEP: Duration = Duration::from_secs(90);
const INTERVAL_KEEP_PACKET_CACHED: Duration = Duration::from_secs(180);
const INTERVAL_PERSIST: Duration = Duration::from_secs(60);
const INTERVAL_REQUEST_SWEEP: Duration = Duration::from_secs(2);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Decrypted payload delivered to a local destination or surfaced from a
/// link.
#[derive(Clone)]
pub struct ReceivedData {
    pub destination: ShortHash,
    /// Set when the payload arrived over a link.
    pub link_id: Option<LinkId>,
    pub data: PacketPayload,
    pub ratchet_used: bool,
    pub context: Option<PacketContext>,
    pub request_id: Option<[u8; 16]>,
    pub hops: Option<u8>,
    pub interface: Option<ShortHash>,
}

/// A verified announce, as handed to subscribers.
#[derive(Clone)]
pub struct AnnounceEvent {
    pub destination: Arc<Mutex<SingleOutputDestination>>,
    pub app_data: PacketPayload,
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
    pub name_hash: [u8; NAME_HASH_LENGTH],
    pub hops: u8,
    pub interface: ShortHash,
}

/// Where an outbound packet ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    SentDirect,
    SentBroadcast,
    DroppedUnknownDestination,
    DroppedTooLarge,
    DroppedEncryptFailed,
    DroppedNoRoute,
}

/// Per-instance counters for silently dropped traffic. Cryptographic
/// failures are never logged above debug, but they are counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub duplicates_dropped: u64,
    pub crypto_failures: u64,
    pub malformed_dropped: u64,
    pub hop_limit_dropped: u64,
    pub announces_accepted: u64,
    pub announces_rejected: u64,
}

pub struct TransportConfig {
    name: String,
    identity: PrivateIdentity,
    /// Re-flood inbound data packets (promiscuous relaying on broadcast
    /// media).
    broadcast: bool,
    /// Act as a transport instance: forward announces and packets for
    /// others.
    retransmit: bool,
    announce_cache_capacity: usize,
    announce_retry_limit: u8,
    announce_cap_fraction: f64,
    path_request_queue_len: usize,
    path_request_cap: usize,
    path_request_timeout_secs: u64,
    link_proof_timeout_secs: u64,
    link_idle_timeout_secs: u64,
    resource_retry_interval_secs: u64,
    resource_retry_limit: u8,
    path_ttls: PathTtlConfig,
    storage: Option<StoragePaths>,
    panic_on_interface_error: bool,
}

pub(crate) struct TransportHandler {
    config: TransportConfig,
    iface_manager: Arc<Mutex<InterfaceManager>>,

    path_table: PathTable,
    announce_table: AnnounceTable,
    announce_budget: AnnounceBudget,
    announce_limits: announce_limits::AnnounceLimits,
    link_table: LinkTable,
    packet_cache: PacketCache,
    path_requests: PathRequests,

    single_in_destinations: HashMap<ShortHash, Arc<Mutex<SingleInputDestination>>>,
    single_out_destinations: HashMap<ShortHash, Arc<Mutex<SingleOutputDestination>>>,

    out_links: HashMap<ShortHash, Arc<Mutex<Link>>>,
    in_links: HashMap<LinkId, Arc<Mutex<Link>>>,
    /// Interface each local link last heard its peer on; outbound link
    /// traffic is pinned to it so it follows the proven path.
    link_ifaces: HashMap<LinkId, ShortHash>,

    ratchet_ledger: Option<RatchetLedger>,
    resource_manager: ResourceManager,

    path_request_listener: ShortHash,
    stats: TransportStats,

    announce_tx: broadcast::Sender<AnnounceEvent>,
    link_in_event_tx: broadcast::Sender<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
    resource_events_tx: broadcast::Sender<ResourceEvent>,

    cancel: CancellationToken,
}

/// The public face of one instance. Cheap to clone handles out of; owns the
/// background tasks through its cancellation token.
pub struct Transport {
    name: String,
    handler: Arc<Mutex<TransportHandler>>,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    link_in_event_tx: broadcast::Sender<LinkEventData>,
    link_out_event_tx: broadcast::Sender<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
    iface_messages_tx: broadcast::Sender<RxMessage>,
    resource_events_tx: broadcast::Sender<ResourceEvent>,
    cancel: CancellationToken,
}
