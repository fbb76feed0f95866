use super::*;

impl Transport {
    /// Opens (or reuses) a link to a destination whose identity is known.
    /// The request goes out immediately; activation arrives through the
    /// out-link event stream.
    pub async fn link(&self, destination: DestinationDesc) -> Arc<Mutex<Link>> {
        if let Some(link) = self.handler.lock().await.out_links.get(&destination.address_hash) {
            if link.lock().await.status() != LinkStatus::Closed {
                return link.clone();
            }
            log::debug!("tp({}): previous link was closed, reopening", self.name);
        }

        let mut link = Link::new(destination, self.link_out_event_tx.clone());
        let packet = link.request();

        log::debug!(
            "tp({}): opening link {} to {}",
            self.name,
            link.id(),
            destination.address_hash
        );

        let link = Arc::new(Mutex::new(link));
        {
            let mut handler = self.handler.lock().await;
            handler.out_links.insert(destination.address_hash, link.clone());
            handler.send_packet(packet).await;
        }

        link
    }

    /// Closes a link explicitly, notifying the peer.
    pub async fn close_link(&self, link_id: &LinkId) {
        let link = {
            let handler = self.handler.lock().await;
            handler
                .in_links
                .get(link_id)
                .cloned()
                .or_else(|| handler.out_links_by_id(link_id))
        };

        let Some(link) = link else {
            return;
        };

        let close_packet = {
            let mut link = link.lock().await;
            let packet = link.close_packet();
            link.close();
            packet
        };

        let mut handler = self.handler.lock().await;
        handler.send_packet(close_packet).await;
        handler.in_links.remove(link_id);
        handler.out_links.retain(|_, candidate| {
            candidate.try_lock().map(|link| link.id() != link_id).unwrap_or(true)
        });
        handler.link_ifaces.remove(link_id);
    }

    pub async fn find_in_link(&self, link_id: &LinkId) -> Option<Arc<Mutex<Link>>> {
        self.handler.lock().await.in_links.get(link_id).cloned()
    }

    pub async fn find_out_link(&self, link_id: &LinkId) -> Option<Arc<Mutex<Link>>> {
        self.handler.lock().await.out_links_by_id(link_id)
    }

    /// Sends a payload over every active outbound link to `destination`.
    pub async fn send_to_out_links(&self, destination: &ShortHash, payload: &[u8]) {
        let packets = {
            let handler = self.handler.lock().await;
            let mut packets = Vec::new();
            for link in handler.out_links.values() {
                let link = link.lock().await;
                if link.destination().address_hash == *destination
                    && link.status() == LinkStatus::Active
                {
                    if let Ok(packet) = link.data_packet(payload) {
                        packets.push(packet);
                    }
                }
            }
            packets
        };

        if packets.is_empty() {
            log::trace!("tp({}): no active out links for {}", self.name, destination);
            return;
        }

        let mut handler = self.handler.lock().await;
        for packet in packets {
            handler.send_packet(packet).await;
        }
    }

    /// Sends a payload over every active inbound link bound to one of our
    /// destinations.
    pub async fn send_to_in_links(&self, destination: &ShortHash, payload: &[u8]) {
        let packets = {
            let handler = self.handler.lock().await;
            let mut packets = Vec::new();
            for link in handler.in_links.values() {
                let link = link.lock().await;
                if link.destination().address_hash == *destination
                    && link.status() == LinkStatus::Active
                {
                    if let Ok(packet) = link.data_packet(payload) {
                        packets.push(packet);
                    }
                }
            }
            packets
        };

        if packets.is_empty() {
            log::trace!("tp({}): no active in links for {}", self.name, destination);
            return;
        }

        let mut handler = self.handler.lock().await;
        for packet in packets {
            handler.send_packet(packet).await;
        }
    }

    /// Issues a reliable request over a link; the response arrives through
    /// the received-data stream tagged with the returned request id.
    pub async fn send_request(
        &self,
        link_id: &LinkId,
        method: &ShortHash,
        arguments: &[u8],
    ) -> Result<[u8; 16], LatticaError> {
        let link = self
            .find_out_link(link_id)
            .await
            .or(self.find_in_link(link_id).await)
            .ok_or(LatticaError::InvalidArgument)?;

        let (request_id, packet) = {
            let mut link = link.lock().await;
            if link.status() != LinkStatus::Active {
                return Err(LatticaError::ConnectionError);
            }
            link.request_packet(method, arguments)?
        };

        self.handler.lock().await.send_packet(packet).await;
        Ok(request_id)
    }

    /// Answers a request received over a link.
    pub async fn send_response(
        &self,
        link_id: &LinkId,
        request_id: &[u8; 16],
        data: &[u8],
    ) -> Result<(), LatticaError> {
        let link = self
            .find_in_link(link_id)
            .await
            .or(self.find_out_link(link_id).await)
            .ok_or(LatticaError::InvalidArgument)?;

        let packet = {
            let link = link.lock().await;
            link.response_packet(request_id, data)?
        };

        self.handler.lock().await.send_packet(packet).await;
        Ok(())
    }

    /// Identifies this node to the link's peer over the encrypted channel.
    pub async fn identify_on_link(
        &self,
        link_id: &LinkId,
        identity: &PrivateIdentity,
    ) -> Result<(), LatticaError> {
        let link = self
            .find_out_link(link_id)
            .await
            .ok_or(LatticaError::InvalidArgument)?;

        let packet = {
            let link = link.lock().await;
            link.identify_packet(identity)?
        };

        self.handler.lock().await.send_packet(packet).await;
        Ok(())
    }

    /// Cancels a transfer in either direction: local state is dropped
    /// (outbound transfers stay addressable for a late proof) and the peer
    /// is told to stop.
    pub async fn cancel_resource(
        &self,
        link_id: &LinkId,
        resource_hash: &Hash,
    ) -> Result<(), LatticaError> {
        let link = {
            let handler = self.handler.lock().await;
            handler
                .in_links
                .get(link_id)
                .cloned()
                .or_else(|| handler.out_links_by_id(link_id))
        }
        .ok_or(LatticaError::InvalidArgument)?;

        let mut handler = self.handler.lock().await;
        handler.resource_manager.cancel_local(resource_hash);

        let packet = {
            let link = link.lock().await;
            crate::resource::build_link_packet(
                &link,
                PacketType::Data,
                PacketContext::ResourceInitiatorCancel,
                resource_hash.as_slice(),
            )?
        };
        handler.send_packet(packet).await;
        Ok(())
    }

    /// Starts a bulk transfer over an established link. Progress and
    /// completion arrive through the resource event stream.
    pub async fn send_resource(
        &self,
        link_id: &LinkId,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<Hash, LatticaError> {
        let link = {
            let handler = self.handler.lock().await;
            handler
                .in_links
                .get(link_id)
                .cloned()
                .or_else(|| handler.out_links_by_id(link_id))
        }
        .ok_or(LatticaError::InvalidArgument)?;

        let mut handler = self.handler.lock().await;
        let (resource_hash, packet) = {
            let link = link.lock().await;
            handler.resource_manager.start_send(&link, data, metadata)?
        };
        handler.send_packet(packet).await;
        Ok(resource_hash)
    }
}
