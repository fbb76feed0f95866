use super::jobs::run_transport;
use super::*;
use crate::storage::{read_optional, write_atomic};

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (announce_tx, _) = broadcast::channel(64);
        let (link_in_event_tx, _) = broadcast::channel(64);
        let (link_out_event_tx, _) = broadcast::channel(64);
        let (received_data_tx, _) = broadcast::channel(64);
        let (iface_messages_tx, _) = broadcast::channel(64);
        let (resource_events_tx, _) = broadcast::channel(64);

        let iface_manager = InterfaceManager::new(128);
        let rx_receiver = iface_manager.receiver();
        let iface_manager = Arc::new(Mutex::new(iface_manager));

        let ratchet_ledger = config.storage.as_ref().map(|paths| {
            let mut ledger = RatchetLedger::new(paths.ratchets_dir());
            ledger.sweep_expired(now_secs());
            ledger
        });

        let transport_id =
            config.retransmit.then(|| *config.identity.address_hash());
        let path_requests = PathRequests::new(
            transport_id,
            config.path_request_queue_len,
            config.path_request_cap,
            config.path_request_timeout_secs,
        );
        let path_request_listener = path_requests.listener_hash();

        let mut path_table = PathTable::new(config.path_ttls);
        let mut packet_cache = PacketCache::new();
        let mut link_table = LinkTable::new(
            Duration::from_secs(config.link_proof_timeout_secs),
            Duration::from_secs(config.link_idle_timeout_secs),
        );

        if let Some(paths) = config.storage.as_ref() {
            if let Err(err) = paths.ensure_layout() {
                log::warn!("tp({}): storage layout unavailable: {}", config.name, err);
            }
            if let Some(data) = read_optional(&paths.destination_table()) {
                match path_table.restore(&data) {
                    Ok(count) => log::info!("tp({}): restored {} paths", config.name, count),
                    Err(_) => log::warn!("tp({}): destination table unreadable", config.name),
                }
            }
            if let Some(data) = read_optional(&paths.packet_hashlist()) {
                let _ = packet_cache.restore(&data);
            }
            if let Some(data) = read_optional(&paths.tunnels()) {
                match link_table.restore(&data) {
                    Ok(count) => log::debug!("tp({}): restored {} tunnels", config.name, count),
                    Err(_) => log::warn!("tp({}): tunnel table unreadable", config.name),
                }
            }
        }

        // Re-seed the known-destinations ledger from the announce cache, so
        // identities recalled before shutdown stay recallable.
        let mut single_out_destinations = HashMap::new();
        if let Some(paths) = config.storage.as_ref() {
            if let Ok(entries) = std::fs::read_dir(paths.cache_dir()) {
                for entry in entries.flatten() {
                    let Ok(wire) = std::fs::read(entry.path()) else {
                        continue;
                    };
                    let Ok(packet) = Packet::from_wire(&wire) else {
                        continue;
                    };
                    let Ok(announce) = DestinationAnnounce::validate(&packet) else {
                        continue;
                    };
                    single_out_destinations
                        .insert(packet.destination, Arc::new(Mutex::new(announce.destination)));
                }
                if !single_out_destinations.is_empty() {
                    log::debug!(
                        "tp({}): recalled {} destinations from cache",
                        config.name,
                        single_out_destinations.len()
                    );
                }
            }
        }

        let announce_budget = AnnounceBudget::new(config.announce_cap_fraction);
        let resource_manager = ResourceManager::with_config(
            Duration::from_secs(config.resource_retry_interval_secs),
            config.resource_retry_limit,
        );

        let cancel = CancellationToken::new();
        let name = config.name.clone();
        let handler = Arc::new(Mutex::new(TransportHandler {
            announce_table: AnnounceTable::new(
                config.announce_cache_capacity,
                config.announce_retry_limit,
            ),
            announce_budget,
            announce_limits: announce_limits::AnnounceLimits::new(),
            config,
            iface_manager: iface_manager.clone(),
            path_table,
            link_table,
            packet_cache,
            path_requests,
            single_in_destinations: HashMap::new(),
            single_out_destinations,
            out_links: HashMap::new(),
            in_links: HashMap::new(),
            link_ifaces: HashMap::new(),
            ratchet_ledger,
            resource_manager,
            path_request_listener,
            stats: TransportStats::default(),
            announce_tx,
            link_in_event_tx: link_in_event_tx.clone(),
            received_data_tx: received_data_tx.clone(),
            resource_events_tx: resource_events_tx.clone(),
            cancel: cancel.clone(),
        }));

        tokio::spawn(run_transport(handler.clone(), rx_receiver, iface_messages_tx.clone()));

        // Link payload events feed the common received-data stream so
        // callers can consume one channel regardless of transport type.
        for link_events in [link_in_event_tx.subscribe(), link_out_event_tx.subscribe()] {
            spawn_link_data_pump(link_events, received_data_tx.clone());
        }

        Self {
            name,
            handler,
            iface_manager,
            link_in_event_tx,
            link_out_event_tx,
            received_data_tx,
            iface_messages_tx,
            resource_events_tx,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iface_manager(&self) -> Arc<Mutex<InterfaceManager>> {
        self.iface_manager.clone()
    }

    pub fn iface_rx(&self) -> broadcast::Receiver<RxMessage> {
        self.iface_messages_tx.subscribe()
    }

    pub async fn recv_announces(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.handler.lock().await.announce_tx.subscribe()
    }

    pub fn received_data_events(&self) -> broadcast::Receiver<ReceivedData> {
        self.received_data_tx.subscribe()
    }

    pub fn in_link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_in_event_tx.subscribe()
    }

    pub fn out_link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_out_event_tx.subscribe()
    }

    pub fn resource_events(&self) -> broadcast::Receiver<ResourceEvent> {
        self.resource_events_tx.subscribe()
    }

    /// Registers a local destination for inbound traffic.
    pub async fn add_destination(
        &self,
        identity: PrivateIdentity,
        name: DestinationName,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let destination = SingleInputDestination::new(identity, name);
        let address_hash = destination.desc.address_hash;

        log::debug!("tp({}): add destination {}", self.name, address_hash);

        let destination = Arc::new(Mutex::new(destination));
        self.handler
            .lock()
            .await
            .single_in_destinations
            .insert(address_hash, destination.clone());
        destination
    }

    pub async fn remove_destination(&self, address: &ShortHash) {
        self.handler.lock().await.single_in_destinations.remove(address);
    }

    pub async fn has_destination(&self, address: &ShortHash) -> bool {
        self.handler.lock().await.single_in_destinations.contains_key(address)
    }

    pub async fn knows_destination(&self, address: &ShortHash) -> bool {
        self.handler.lock().await.single_out_destinations.contains_key(address)
    }

    /// Recalls the public identity behind a destination hash from the
    /// announce ledger.
    pub async fn recall_identity(&self, address: &ShortHash) -> Option<Identity> {
        let destination =
            self.handler.lock().await.single_out_destinations.get(address).cloned()?;
        let destination = destination.lock().await;
        Some(destination.identity)
    }

    /// Recalls the announced name hash of a destination.
    pub async fn recall_name(&self, address: &ShortHash) -> Option<DestinationName> {
        let destination =
            self.handler.lock().await.single_out_destinations.get(address).cloned()?;
        let destination = destination.lock().await;
        Some(destination.desc.name)
    }

    /// Handle of a locally registered destination.
    pub async fn destination_handle(
        &self,
        address: &ShortHash,
    ) -> Option<Arc<Mutex<SingleInputDestination>>> {
        self.handler.lock().await.single_in_destinations.get(address).cloned()
    }

    pub async fn hops_to(&self, address: &ShortHash) -> Option<u8> {
        self.handler.lock().await.path_table.hops_to(address)
    }

    pub async fn stats(&self) -> TransportStats {
        self.handler.lock().await.stats
    }

    /// Announces a local destination on all interfaces.
    pub async fn send_announce(
        &self,
        destination: &Arc<Mutex<SingleInputDestination>>,
        app_data: Option<&[u8]>,
    ) {
        let packet = {
            let mut destination = destination.lock().await;
            match destination.announce(OsRng, app_data) {
                Ok(packet) => packet,
                Err(err) => {
                    log::warn!("tp({}): announce build failed: {}", self.name, err);
                    return;
                }
            }
        };

        let mut handler = self.handler.lock().await;
        handler.send_packet(packet).await;
    }

    pub async fn send_packet(&self, packet: Packet) {
        self.handler.lock().await.send_packet(packet).await;
    }

    pub async fn send_packet_with_outcome(&self, packet: Packet) -> SendOutcome {
        self.handler.lock().await.send_packet_with_outcome(packet).await
    }

    pub async fn send_broadcast(&self, packet: Packet, exclude_iface: Option<ShortHash>) {
        self.handler
            .lock()
            .await
            .send(TxMessage { tx_type: TxMessageType::Broadcast(exclude_iface), packet })
            .await;
    }

    pub async fn send_direct(&self, iface: ShortHash, packet: Packet) {
        self.handler
            .lock()
            .await
            .send(TxMessage { tx_type: TxMessageType::Direct(iface), packet })
            .await;
    }

    /// Broadcasts a path request for an unknown destination.
    pub async fn request_path(
        &self,
        destination: &ShortHash,
        on_iface: Option<ShortHash>,
        tag: Option<TagBytes>,
    ) {
        self.handler.lock().await.request_path(destination, on_iface, tag).await;
    }

    /// Writes all persisted state now; also runs periodically.
    pub async fn persist_now(&self) {
        self.handler.lock().await.persist().await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_link_data_pump(
    mut link_rx: broadcast::Receiver<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
) {
    tokio::spawn(async move {
        loop {
            match link_rx.recv().await {
                Ok(event) => {
                    if let LinkEvent::Data(payload) = event.event {
                        let _ = received_data_tx.send(ReceivedData {
                            destination: event.address_hash,
                            link_id: Some(event.id),
                            data: PacketPayload::from_slice(payload.as_slice()),
                            ratchet_used: false,
                            context: Some(payload.context()),
                            request_id: payload.request_id(),
                            hops: None,
                            interface: None,
                        });
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
}

impl TransportHandler {
    /// Flushes persisted state: destination table, packet hashlist and
    /// tunnel snapshots under the storage root.
    pub(super) async fn persist(&mut self) {
        let Some(paths) = self.config.storage.clone() else {
            return;
        };

        if let Ok(snapshot) = self.path_table.snapshot() {
            let _ = write_atomic(&paths.destination_table(), &snapshot);
        }
        if let Ok(snapshot) = self.packet_cache.snapshot() {
            let _ = write_atomic(&paths.packet_hashlist(), &snapshot);
        }
        if let Ok(snapshot) = self.link_table.snapshot() {
            let _ = write_atomic(&paths.tunnels(), &snapshot);
        }
    }
}
