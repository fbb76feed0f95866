use super::*;

/// Outbound single-destination data packets are sealed here, transparently
/// to the caller. Everything else (announces, link traffic, plain and group
/// payloads) passes through as built.
fn needs_envelope(packet: &Packet) -> bool {
    packet.header.packet_type == PacketType::Data
        && packet.header.destination_type == DestinationType::Single
        && packet.context == PacketContext::None
}

impl TransportHandler {
    pub(super) async fn send_packet(&mut self, packet: Packet) {
        let _ = self.send_packet_with_outcome(packet).await;
    }

    pub(super) async fn send_packet_with_outcome(&mut self, mut packet: Packet) -> SendOutcome {
        if needs_envelope(&packet) {
            let Some(destination) =
                self.single_out_destinations.get(&packet.destination).cloned()
            else {
                log::warn!(
                    "tp({}): no identity known for {}",
                    self.config.name,
                    packet.destination
                );
                return SendOutcome::DroppedUnknownDestination;
            };

            let identity = destination.lock().await.identity;
            let salt = identity.address_hash;

            // Prefer the destination's announced ratchet key; the long-term
            // key remains the fallback.
            let ratchet = self
                .ratchet_ledger
                .as_mut()
                .and_then(|ledger| ledger.current(&packet.destination));
            let public_key = ratchet
                .map(x25519_dalek::PublicKey::from)
                .unwrap_or(identity.public_key);

            match seal_for_public_key(&public_key, salt.as_slice(), packet.data.as_slice(), OsRng)
            {
                Ok(sealed) => {
                    let mut payload = PacketPayload::new();
                    if payload.push(&sealed).is_err() {
                        log::warn!(
                            "tp({}): sealed payload exceeds packet MDU for {}",
                            self.config.name,
                            packet.destination
                        );
                        return SendOutcome::DroppedTooLarge;
                    }
                    packet.data = payload;
                }
                Err(err) => {
                    self.stats.crypto_failures += 1;
                    log::warn!(
                        "tp({}): seal failed for {}: {}",
                        self.config.name,
                        packet.destination,
                        err
                    );
                    return SendOutcome::DroppedEncryptFailed;
                }
            }
        }

        // Link traffic follows the interface the link was proven over.
        if packet.header.destination_type == DestinationType::Link {
            if let Some(iface) = self.link_ifaces.get(&packet.destination).copied() {
                let dispatch =
                    self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet }).await;
                return if dispatch.sent_ifaces > 0 {
                    SendOutcome::SentDirect
                } else {
                    SendOutcome::DroppedNoRoute
                };
            }
        }

        let (packet, maybe_iface) = self.path_table.route_outbound(&packet);
        if let Some(iface) = maybe_iface {
            let dispatch =
                self.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet }).await;
            if dispatch.sent_ifaces > 0 {
                SendOutcome::SentDirect
            } else {
                SendOutcome::DroppedNoRoute
            }
        } else if self.config.broadcast || packet.header.packet_type == PacketType::Announce {
            let dispatch =
                self.send(TxMessage { tx_type: TxMessageType::Broadcast(None), packet }).await;
            if dispatch.sent_ifaces > 0 {
                SendOutcome::SentBroadcast
            } else {
                SendOutcome::DroppedNoRoute
            }
        } else {
            log::trace!(
                "tp({}): no route for outbound packet to {}",
                self.config.name,
                packet.destination
            );
            SendOutcome::DroppedNoRoute
        }
    }

    /// Dispatches a message to the interfaces, recording it in the dedup
    /// window so our own transmissions are not re-processed when overheard.
    pub(super) async fn send(&mut self, message: TxMessage) -> TxDispatchTrace {
        self.packet_cache.observe(&message.packet);
        self.stats.packets_out += 1;
        self.iface_manager.lock().await.send(message).await
    }

    pub(super) fn has_destination(&self, address: &ShortHash) -> bool {
        self.single_in_destinations.contains_key(address)
    }

    /// Duplicate filtering with the protocol's deliberate exceptions:
    /// announces run their own dedup in the announce path, link requests
    /// may be legitimately re-received while unproven, keepalives repeat by
    /// design, and a repeated link-request proof is allowed while the link
    /// is still pending. Relayed link traffic passes unfiltered: selective
    /// retransmissions are byte-identical, and endpoints dedup them
    /// themselves.
    pub(super) async fn admit_packet(&mut self, packet: &Packet) -> bool {
        let mut allow_duplicate = false;

        match packet.header.packet_type {
            PacketType::Announce => return true,
            PacketType::LinkRequest => allow_duplicate = true,
            PacketType::Data => {
                let relayed_link_traffic = packet.header.destination_type
                    == DestinationType::Link
                    && !self.in_links.contains_key(&packet.destination)
                    && self.out_links_by_id(&packet.destination).is_none();
                allow_duplicate =
                    packet.context == PacketContext::KeepAlive || relayed_link_traffic;
            }
            PacketType::Proof => {
                if packet.context == PacketContext::LinkRequestProof {
                    if let Some(link) = self.out_links_by_id(&packet.destination) {
                        if link.lock().await.status().not_yet_active() {
                            allow_duplicate = true;
                        }
                    }
                }
                // Relayed proofs pass through like relayed link data.
                if self.link_table.contains(&packet.destination)
                    && !self.in_links.contains_key(&packet.destination)
                {
                    allow_duplicate = true;
                }
            }
        }

        let is_new = self.packet_cache.observe(packet);
        if !is_new && !allow_duplicate {
            self.stats.duplicates_dropped += 1;
        }

        is_new || allow_duplicate
    }

    pub(super) fn out_links_by_id(&self, link_id: &ShortHash) -> Option<Arc<Mutex<Link>>> {
        // Outbound links are keyed by destination; scan for the id.
        self.out_links.values().find(|link| {
            link.try_lock().map(|link| link.id() == link_id).unwrap_or(false)
        }).cloned()
    }

    pub(super) async fn request_path(
        &mut self,
        address: &ShortHash,
        on_iface: Option<ShortHash>,
        tag: Option<TagBytes>,
    ) {
        let packet = self.path_requests.generate(address, tag);
        self.send(TxMessage { tx_type: TxMessageType::Broadcast(on_iface), packet }).await;
    }

    /// Remembers a verified announce in the out-destination ledger and, when
    /// storage is configured, mirrors the raw announce to the cache
    /// directory so the ledger survives restarts.
    pub(super) fn remember_announce(&mut self, packet: &Packet) {
        let Some(paths) = self.config.storage.as_ref() else {
            return;
        };
        let Ok(wire) = packet.to_wire() else {
            return;
        };
        let path = paths.cache_dir().join(packet.destination.to_hex());
        if crate::storage::write_atomic(&path, &wire).is_err() {
            log::debug!("tp({}): announce cache write failed", self.config.name);
        }
    }
}
