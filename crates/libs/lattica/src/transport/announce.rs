use super::*;

/// Processes an inbound announce: admission, validation, path learning,
/// forward scheduling and subscriber notification.
pub(super) async fn handle_announce<'a>(
    packet: &Packet,
    mut handler: MutexGuard<'a, TransportHandler>,
    iface: ShortHash,
) {
    // A duplicate is not processed again, but overhearing it can cancel our
    // own pending retransmission when a node farther out took over.
    if !handler.packet_cache.observe(packet) {
        let destination = packet.destination;
        let hops = packet.header.hops;
        handler.announce_table.heard_retransmission(&destination, hops);
        handler.stats.duplicates_dropped += 1;
        return;
    }

    if let Some(blocked) = handler.announce_limits.check(&packet.destination) {
        log::info!(
            "tp({}): announce flood from {}, blocked for {}s",
            handler.config.name,
            packet.destination,
            blocked.as_secs(),
        );
        handler.stats.announces_rejected += 1;
        return;
    }

    let announce = match DestinationAnnounce::validate(packet) {
        Ok(announce) => announce,
        Err(err) => {
            log::debug!(
                "tp({}): invalid announce for {}: {}",
                handler.config.name,
                packet.destination,
                err
            );
            handler.stats.announces_rejected += 1;
            return;
        }
    };
    handler.stats.announces_accepted += 1;

    let ratchet = announce.ratchet;
    if let Some(ratchet_bytes) = ratchet {
        if let Some(ledger) = handler.ratchet_ledger.as_mut() {
            if let Err(err) = ledger.remember(&packet.destination, ratchet_bytes) {
                log::warn!(
                    "tp({}): ratchet for {} not persisted: {}",
                    handler.config.name,
                    packet.destination,
                    err
                );
            }
        }
    }

    let name_hash = {
        let mut name_hash = [0u8; NAME_HASH_LENGTH];
        name_hash.copy_from_slice(announce.destination.desc.name.name_hash_slice());
        name_hash
    };
    let app_data = PacketPayload::from_slice(announce.app_data);
    let destination = Arc::new(Mutex::new(announce.destination));

    let local_destination = handler.has_destination(&packet.destination);
    if !local_destination {
        handler
            .single_out_destinations
            .entry(packet.destination)
            .or_insert_with(|| destination.clone());

        let iface_mode = handler
            .iface_manager
            .lock()
            .await
            .properties_of(&iface)
            .map(|properties| properties.mode)
            .unwrap_or(InterfaceMode::Full);

        handler.path_table.handle_announce(packet, packet.transport, iface, iface_mode);
        handler.remember_announce(packet);

        if handler.config.retransmit {
            handler.announce_table.enqueue(packet, packet.destination, iface);
        }
    }

    let _ = handler.announce_tx.send(AnnounceEvent {
        destination,
        app_data,
        ratchet,
        name_hash,
        hops: packet.header.hops,
        interface: iface,
    });
}

/// Periodic announce pump: syncs the bandwidth ledger with the attached
/// interfaces and sends everything the scheduler has due.
pub(super) async fn pump_announces<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    let transport_id = *handler.config.identity.address_hash();

    {
        let iface_manager = handler.iface_manager.clone();
        let iface_manager = iface_manager.lock().await;
        for address in iface_manager.addresses() {
            if let Some(properties) = iface_manager.properties_of(&address) {
                handler.announce_budget.register(address, properties.bitrate);
            }
        }
    }

    let messages = {
        let TransportHandler { announce_table, announce_budget, .. } = &mut *handler;
        announce_table.due_messages(&transport_id, announce_budget)
    };

    for message in messages {
        handler.send(message).await;
    }
}
