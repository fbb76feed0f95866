use super::announce::handle_announce;
use super::*;
use crate::destination::link::validate_link_proof;

/// Full inbound dispatch for one packet from one interface.
pub(super) async fn handle_inbound(
    message: RxMessage,
    handler_arc: &Arc<Mutex<TransportHandler>>,
) {
    let packet = message.packet;
    let iface = message.address;

    let mut handler = handler_arc.lock().await;
    handler.stats.packets_in += 1;

    // Hop ceiling: anything at or past the diameter is dead, addressed to
    // us or not.
    if packet.header.hops >= PATHFINDER_M {
        handler.stats.hop_limit_dropped += 1;
        return;
    }

    // The path-request listener is a fixed destination outside the normal
    // dedup rules (tags carry their own).
    if packet.destination == handler.path_request_listener {
        handle_path_request(&packet, &mut handler, iface).await;
        return;
    }

    if !handler.admit_packet(&packet).await && packet.header.packet_type != PacketType::Announce {
        log::debug!(
            "tp({}): duplicate {:?} for {} dropped",
            handler.config.name,
            packet.header.packet_type,
            packet.destination
        );
        return;
    }

    match packet.header.packet_type {
        PacketType::Announce => handle_announce(&packet, handler, iface).await,
        PacketType::LinkRequest => handle_link_request(&packet, iface, handler).await,
        PacketType::Proof => {
            drop(handler);
            handle_proof(packet, iface, handler_arc).await;
        }
        PacketType::Data => {
            drop(handler);
            handle_data(packet, iface, handler_arc).await;
        }
    }
}

pub(super) async fn handle_path_request<'a>(
    packet: &Packet,
    handler: &mut MutexGuard<'a, TransportHandler>,
    iface: ShortHash,
) {
    let Some(request) = handler.path_requests.decode(packet.data.as_slice()) else {
        return;
    };

    // A destination we own answers immediately and directly.
    if let Some(destination) = handler.single_in_destinations.get(&request.destination).cloned() {
        let response = {
            let mut destination = destination.lock().await;
            match destination.path_response(OsRng, None) {
                Ok(response) => response,
                Err(err) => {
                    log::warn!("tp({}): path response build failed: {}", handler.config.name, err);
                    return;
                }
            }
        };

        handler.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: response }).await;
        log::trace!(
            "tp({}): answered path request for {} over {}",
            handler.config.name,
            request.destination,
            iface
        );
        return;
    }

    if !handler.config.retransmit {
        return;
    }

    // A known remote path is answered out of the announce cache.
    if let Some(entry) = handler.path_table.get(&request.destination) {
        if let Some(requestor) = request.requesting_transport {
            if requestor == entry.received_from {
                log::trace!(
                    "tp({}): circular path request for {} dropped",
                    handler.config.name,
                    request.destination
                );
                return;
            }
        }

        let hops = entry.hops;
        if handler.announce_table.add_response(request.destination, iface, hops) {
            log::trace!(
                "tp({}): scheduled path response for {} ({} hops) over {}",
                handler.config.name,
                request.destination,
                hops,
                iface
            );
            return;
        }
    }

    // Unknown everywhere: recurse outward, capped.
    let recursive = handler.path_requests.generate_recursive(&request.destination, None);
    if let Some(packet) = recursive {
        handler
            .send(TxMessage { tx_type: TxMessageType::Broadcast(Some(iface)), packet })
            .await;
    }
}

async fn handle_link_request<'a>(
    packet: &Packet,
    iface: ShortHash,
    mut handler: MutexGuard<'a, TransportHandler>,
) {
    // Terminating case: the request is for a destination we own.
    if let Some(destination) = handler.single_in_destinations.get(&packet.destination).cloned() {
        let mut destination = destination.lock().await;
        if !matches!(destination.handle_packet(packet), DestinationHandleStatus::LinkProof) {
            return;
        }

        let link_id = crate::destination::link::link_id_from_request(packet);
        if handler.in_links.contains_key(&link_id) {
            return;
        }

        let link = Link::from_request(
            packet,
            destination.signing_key().clone(),
            destination.desc,
            handler.link_in_event_tx.clone(),
        );

        let Ok(mut link) = link else {
            handler.stats.malformed_dropped += 1;
            return;
        };

        // The proof goes back over the interface the request arrived on so
        // the relays along the path can validate and upgrade their entries.
        let proof = link.prove();
        handler.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: proof }).await;

        log::debug!(
            "tp({}): inbound link {} for {}",
            handler.config.name,
            link.id(),
            link.destination().address_hash
        );
        handler.in_links.insert(*link.id(), Arc::new(Mutex::new(link)));
        return;
    }

    // Forwarding case: remember the reverse path, pass the request on.
    if let Some((next_hop, next_iface)) = handler.path_table.next_hop_full(&packet.destination) {
        handler.link_table.add(packet, packet.destination, iface, iface, next_hop, next_iface);

        let (forwarded, maybe_iface) = handler.path_table.route_inbound(packet, None);
        if let Some(out_iface) = maybe_iface {
            handler
                .send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: forwarded })
                .await;
        }
        return;
    }

    log::trace!(
        "tp({}): link request for unknown destination {} dropped",
        handler.config.name,
        packet.destination
    );
}

async fn handle_proof(packet: Packet, iface: ShortHash, handler_arc: &Arc<Mutex<TransportHandler>>) {
    // Initiator side: a link-request proof activates a pending link.
    let out_link = {
        let handler = handler_arc.lock().await;
        handler.out_links_by_id(&packet.destination)
    };

    if let Some(link) = out_link {
        if packet.context == PacketContext::LinkRequestProof {
            let activated = {
                let mut link = link.lock().await;
                matches!(link.handle_packet(&packet), LinkHandleResult::Activated)
            };

            let mut handler = handler_arc.lock().await;
            if activated {
                // Pin the return interface so everything this link sends
                // follows the proven path.
                handler.link_ifaces.insert(packet.destination, iface);

                let rtt_packet = {
                    let link = link.lock().await;
                    link.rtt_packet()
                };
                match rtt_packet {
                    Ok(rtt) => {
                        handler
                            .send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: rtt })
                            .await;
                    }
                    Err(err) => {
                        log::warn!("tp({}): rtt packet failed: {}", handler.config.name, err)
                    }
                }
            } else {
                handler.stats.crypto_failures += 1;
            }
            return;
        }

        // Delivery or resource proofs for one of our links.
        handle_link_bound_locally(&packet, iface, link, handler_arc).await;
        return;
    }

    let in_link = {
        let handler = handler_arc.lock().await;
        handler.in_links.get(&packet.destination).cloned()
    };
    if let Some(link) = in_link {
        handle_link_bound_locally(&packet, iface, link, handler_arc).await;
        return;
    }

    // Relay side: validate against the destination's announced signing key
    // before upgrading the tunnel and sending the proof backwards. A relay
    // never learns the session key, but it can still tell a forged proof
    // from a genuine one.
    let mut handler = handler_arc.lock().await;
    if packet.context == PacketContext::LinkRequestProof
        && handler.link_table.contains(&packet.destination)
    {
        let destination_identity = handler
            .link_table
            .pending_destination(&packet.destination)
            .and_then(|destination| handler.single_out_destinations.get(&destination).cloned());

        if let Some(destination) = destination_identity {
            let desc = destination.lock().await.desc;
            if validate_link_proof(&desc, &packet.destination, &packet).is_err() {
                handler.stats.crypto_failures += 1;
                log::debug!(
                    "tp({}): forged link proof for {} dropped",
                    handler.config.name,
                    packet.destination
                );
                return;
            }
        }

        if let Some((reversed, out_iface)) = handler.link_table.handle_proof(&packet) {
            handler
                .send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: reversed })
                .await;
        }
        return;
    }

    // Any other link-bound proof in transit follows the tunnel.
    forward_link_bound(&packet, iface, &mut handler).await;
}

async fn handle_data(
    packet: Packet,
    iface: ShortHash,
    handler_arc: &Arc<Mutex<TransportHandler>>,
) {
    let mut handler = handler_arc.lock().await;

    // Local single destination: unwrap the envelope and deliver.
    if let Some(destination) = handler.single_in_destinations.get(&packet.destination).cloned() {
        let opened = {
            let mut destination = destination.lock().await;
            destination.open_envelope(packet.data.as_slice())
        };

        match opened {
            Ok((plain, ratchet_used)) => {
                let _ = handler.received_data_tx.send(ReceivedData {
                    destination: packet.destination,
                    link_id: None,
                    data: PacketPayload::from_slice(&plain),
                    ratchet_used,
                    context: Some(packet.context),
                    request_id: None,
                    hops: Some(packet.header.hops),
                    interface: Some(iface),
                });
            }
            Err(_) => {
                handler.stats.crypto_failures += 1;
                log::debug!(
                    "tp({}): undecryptable packet for {} dropped",
                    handler.config.name,
                    packet.destination
                );
            }
        }
        return;
    }

    // One of our links, either side.
    let local_link = handler
        .in_links
        .get(&packet.destination)
        .cloned()
        .or_else(|| handler.out_links_by_id(&packet.destination));
    if let Some(link) = local_link {
        drop(handler);
        handle_link_bound_locally(&packet, iface, link, handler_arc).await;
        return;
    }

    // Somebody else's link crossing this node.
    if handler.link_table.contains(&packet.destination) {
        forward_link_bound(&packet, iface, &mut handler).await;
        return;
    }

    // Addressed transport traffic for us to forward.
    if handler.config.retransmit
        && packet.header.header_type == HeaderType::Type2
        && packet.header.propagation_type == PropagationType::Transport
        && packet.transport == Some(*handler.config.identity.address_hash())
    {
        let (forwarded, maybe_iface) = handler.path_table.route_inbound(&packet, None);
        if let Some(out_iface) = maybe_iface {
            handler
                .send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: forwarded })
                .await;
        }
        return;
    }

    // Promiscuous re-flood for broadcast media.
    if handler.config.broadcast {
        let mut reflooded = packet;
        reflooded.header.hops = reflooded.header.hops.saturating_add(1);
        handler
            .send(TxMessage {
                tx_type: TxMessageType::Broadcast(Some(iface)),
                packet: reflooded,
            })
            .await;
    }
}

/// Handles a packet for a link endpoint living in this process: runs the
/// link state machine, sends whatever it wants transmitted, and feeds the
/// resource machinery for resource contexts.
async fn handle_link_bound_locally(
    packet: &Packet,
    iface: ShortHash,
    link: Arc<Mutex<Link>>,
    handler_arc: &Arc<Mutex<TransportHandler>>,
) {
    let is_resource_context = matches!(
        packet.context,
        PacketContext::Resource
            | PacketContext::ResourceAdvertisement
            | PacketContext::ResourceRequest
            | PacketContext::ResourceHashUpdate
            | PacketContext::ResourceProof
            | PacketContext::ResourceInitiatorCancel
            | PacketContext::ResourceReceiverCancel
    );

    {
        let mut handler = handler_arc.lock().await;
        handler.link_ifaces.insert(packet.destination, iface);
    }

    if is_resource_context {
        let replies = {
            let mut handler = handler_arc.lock().await;
            let mut link = link.lock().await;
            handler.resource_manager.handle_packet(packet, &mut link)
        };

        let mut handler = handler_arc.lock().await;
        for reply in replies {
            handler
                .send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: reply })
                .await;
        }

        let events = handler.resource_manager.drain_events();
        for event in events {
            let _ = handler.resource_events_tx.send(event);
        }
        return;
    }

    let result = {
        let mut link = link.lock().await;
        link.handle_packet(packet)
    };

    match result {
        LinkHandleResult::Proof(proof) => {
            let mut handler = handler_arc.lock().await;
            handler.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: proof }).await;
        }
        LinkHandleResult::KeepAlive => {
            let reply = {
                let link = link.lock().await;
                link.keep_alive_packet(crate::destination::link::KEEPALIVE_REPLY)
            };
            let mut handler = handler_arc.lock().await;
            handler.send(TxMessage { tx_type: TxMessageType::Direct(iface), packet: reply }).await;
        }
        LinkHandleResult::Activated | LinkHandleResult::None => {}
    }
}

/// Routes a link-bound packet crossing this relay. Direction follows the
/// arrival interface: traffic from the initiator side flows toward the
/// destination, anything else flows back.
async fn forward_link_bound<'a>(
    packet: &Packet,
    iface: ShortHash,
    handler: &mut MutexGuard<'a, TransportHandler>,
) {
    if packet.header.hops.saturating_add(1) > PATHFINDER_M {
        handler.stats.hop_limit_dropped += 1;
        return;
    }

    let routed = {
        let came_from_initiator = handler
            .link_table
            .arrival_side(&packet.destination, &iface)
            .unwrap_or(false);

        if came_from_initiator {
            handler.link_table.route_forward(packet)
        } else {
            handler.link_table.route_reverse(packet)
        }
    };

    if let Some((forwarded, out_iface)) = routed {
        handler
            .send(TxMessage { tx_type: TxMessageType::Direct(out_iface), packet: forwarded })
            .await;
    }
}
