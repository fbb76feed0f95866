use super::announce::pump_announces;
use super::inbound::handle_inbound;
use super::*;

/// Link lifecycle sweep: closes dead links, repeats unanswered link
/// requests, advances staleness clocks.
pub(super) async fn check_links<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    let mut to_remove: Vec<ShortHash> = Vec::new();
    let mut to_repeat: Vec<Packet> = Vec::new();

    for (address, link) in &handler.in_links {
        let mut link = link.lock().await;
        link.check_timeouts();

        if link.status() == LinkStatus::Closed
            || link.elapsed() > INTERVAL_INPUT_LINK_CLEANUP && link.status().not_yet_active()
        {
            link.close();
            to_remove.push(*address);
        }
    }
    for address in to_remove.drain(..) {
        handler.in_links.remove(&address);
        handler.link_ifaces.remove(&address);
    }

    for (address, link) in &handler.out_links {
        let mut link = link.lock().await;
        link.check_timeouts();

        if link.status() == LinkStatus::Closed {
            to_remove.push(*address);
        } else if link.status() == LinkStatus::Pending
            && link.elapsed() > INTERVAL_OUTPUT_LINK_REPEAT
        {
            log::debug!("tp({}): repeating link request {}", handler.config.name, link.id());
            to_repeat.push(link.request());
        }
    }
    for address in to_remove {
        if let Some(link) = handler.out_links.remove(&address) {
            let link_id = *link.lock().await.id();
            handler.link_ifaces.remove(&link_id);
        }
    }

    for packet in to_repeat {
        handler.send_packet(packet).await;
    }
}

/// Keepalive emitter for active outbound links.
pub(super) async fn keep_links<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    let mut probes = Vec::new();

    for link in handler.out_links.values() {
        let link = link.lock().await;
        if link.status() != LinkStatus::Active {
            continue;
        }

        // Probe often enough that the peer never goes stale between probes.
        if link.silence() * 3 >= link.stale_after() {
            probes.push(link.keep_alive_packet(crate::destination::link::KEEPALIVE_PROBE));
        }
    }

    for packet in probes {
        handler.send_packet(packet).await;
    }
}

/// Reliable-request sweep: retransmits unanswered link requests/responses,
/// reports the ones out of budget.
pub(super) async fn sweep_link_requests<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    let mut to_send = Vec::new();

    for link in handler.out_links.values().chain(handler.in_links.values()) {
        let mut link = link.lock().await;
        let (resend, failed) = link.sweep_requests(REQUEST_TIMEOUT);
        to_send.extend(resend);
        for request_id in failed {
            log::debug!(
                "tp({}): request {} on link {} timed out",
                handler.config.name,
                hex::encode(request_id),
                link.id()
            );
        }
    }

    for packet in to_send {
        handler.send_packet(packet).await;
    }
}

pub(super) async fn sweep_tables<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    handler.packet_cache.release(INTERVAL_KEEP_PACKET_CACHED);
    let dropped_links = handler.link_table.sweep_stale();
    let dropped_paths = handler.path_table.sweep_expired();
    if let Some(ledger) = handler.ratchet_ledger.as_mut() {
        ledger.sweep_expired(now_secs());
    }

    if dropped_links + dropped_paths > 0 {
        log::trace!(
            "tp({}): swept {} links, {} paths",
            handler.config.name,
            dropped_links,
            dropped_paths
        );
    }
}

pub(super) async fn retry_resources<'a>(mut handler: MutexGuard<'a, TransportHandler>) {
    let now = Instant::now();
    let requests = handler.resource_manager.retry_requests(now);

    for (link_id, request) in requests {
        let link = handler
            .in_links
            .get(&link_id)
            .cloned()
            .or_else(|| handler.out_links_by_id(&link_id));
        let Some(link) = link else {
            continue;
        };

        let packet = {
            let link = link.lock().await;
            crate::resource::build_link_packet(
                &link,
                PacketType::Data,
                PacketContext::ResourceRequest,
                &request.encode(),
            )
        };
        match packet {
            Ok(packet) => handler.send_packet(packet).await,
            Err(_) => log::warn!("tp({}): resource retry packet failed", handler.config.name),
        }
    }

    let events = handler.resource_manager.drain_events();
    for event in events {
        let _ = handler.resource_events_tx.send(event);
    }
}

/// Spawns the instance's task set: the inbound pump plus the periodic
/// maintenance loops, all tied to the cancellation token.
pub(super) async fn run_transport(
    handler_arc: Arc<Mutex<TransportHandler>>,
    rx_receiver: Arc<Mutex<InterfaceRxReceiver>>,
    iface_messages_tx: broadcast::Sender<RxMessage>,
) {
    let cancel = handler_arc.lock().await.cancel.clone();
    let retransmit = handler_arc.lock().await.config.retransmit;

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();

        log::trace!("tp: inbound pump started");

        tokio::spawn(async move {
            loop {
                let mut rx_receiver = rx_receiver.lock().await;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(message) = rx_receiver.recv() => {
                        let _ = iface_messages_tx.send(message);
                        drop(rx_receiver);
                        handle_inbound(message, &handler_arc).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_LINKS_CHECK) => {
                        check_links(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_OUTPUT_LINK_KEEP) => {
                        keep_links(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_REQUEST_SWEEP) => {
                        sweep_link_requests(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_TABLE_SWEEP) => {
                        sweep_tables(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_PERSIST) => {
                        handler_arc.lock().await.persist().await;
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_IFACE_CLEANUP) => {
                        let (iface_manager, panic_on_error) = {
                            let handler = handler_arc.lock().await;
                            (handler.iface_manager.clone(), handler.config.panic_on_interface_error)
                        };
                        let detached = iface_manager.lock().await.cleanup();

                        // Detaching silently is the default; a hard-failure
                        // deployment can demand the whole instance stops
                        // instead.
                        if detached > 0 && panic_on_error {
                            panic!("{} interface(s) failed and panic_on_interface_error is set", detached);
                        }
                    }
                }
            }
        });
    }

    {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        let retry_interval = Duration::from_secs(
            handler_arc.lock().await.config.resource_retry_interval_secs.max(1),
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(retry_interval) => {
                        retry_resources(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }

    if retransmit {
        let handler_arc = handler_arc.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(INTERVAL_ANNOUNCES) => {
                        pump_announces(handler_arc.lock().await).await;
                    }
                }
            }
        });
    }
}
