use std::cmp::min;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signature, SigningKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use rand_core::OsRng;
use sha2::Digest;
use x25519_dalek::StaticSecret;

use crate::buffer::ByteWriter;
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash, SHORT_HASH_SIZE};
use crate::identity::{DerivedKey, Identity, PrivateIdentity};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketPayload, PacketType, PACKET_MDU,
};

use super::DestinationDesc;

const LINK_SIGNALLING_SIZE: usize = 3;

/// Packets sealed under one ratchet epoch before the key advances.
const LINK_RATCHET_SPAN: u32 = 64;

/// Inbound silence floor before a link is considered stale.
pub const LINK_STALE_FLOOR: Duration = Duration::from_secs(60);

/// Multiple of the measured RTT that extends the staleness window on slow
/// paths.
pub const LINK_STALE_RTT_FACTOR: u32 = 6;

/// Additional silence after staleness before the link closes.
pub const LINK_STALE_GRACE: Duration = Duration::from_secs(30);

pub const KEEPALIVE_PROBE: u8 = 0xFF;
pub const KEEPALIVE_REPLY: u8 = 0xFE;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        matches!(self, LinkStatus::Pending | LinkStatus::Handshake)
    }
}

pub type LinkId = ShortHash;

/// Derives the link id from a link-request packet: the packet hash with any
/// payload beyond the two public keys masked out, so that optional
/// signalling bytes do not shift the id.
pub fn link_id_from_request(packet: &Packet) -> LinkId {
    let data = packet.data.as_slice();
    let keys_len = min(data.len(), PUBLIC_KEY_LENGTH * 2);

    ShortHash::truncating(&Hash::new(
        Hash::hasher()
            .chain_update([packet.header.to_flags() & 0b0000_1111])
            .chain_update(packet.destination.as_slice())
            .chain_update([packet.context as u8])
            .chain_update(&data[..keys_len])
            .finalize()
            .into(),
    ))
}

#[derive(Clone)]
pub struct LinkPayload {
    buffer: [u8; PACKET_MDU],
    len: usize,
    context: PacketContext,
    request_id: Option<[u8; SHORT_HASH_SIZE]>,
}

impl LinkPayload {
    pub fn new(data: &[u8], context: PacketContext) -> Self {
        let mut buffer = [0u8; PACKET_MDU];
        let len = min(data.len(), buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Self { buffer, len, context, request_id: None }
    }

    pub fn with_request_id(
        data: &[u8],
        context: PacketContext,
        request_id: Option<[u8; SHORT_HASH_SIZE]>,
    ) -> Self {
        let mut payload = Self::new(data, context);
        payload.request_id = request_id;
        payload
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn context(&self) -> PacketContext {
        self.context
    }

    pub fn request_id(&self) -> Option<[u8; SHORT_HASH_SIZE]> {
        self.request_id
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

#[allow(clippy::large_enum_variant)]
pub enum LinkHandleResult {
    None,
    Activated,
    Proof(Packet),
    KeepAlive,
}

#[derive(Clone)]
pub enum LinkEvent {
    Activated,
    Data(Box<LinkPayload>),
    Stale,
    Closed,
}

#[derive(Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub address_hash: ShortHash,
    pub event: LinkEvent,
}

struct PendingRequest {
    packet: Packet,
    sent_at: Instant,
    retries_left: u8,
}

/// One end of an encrypted session. Both roles share this type: the
/// initiator drives `request` → proof verification → RTT, the responder is
/// constructed from the inbound request and answers with `prove`.
pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    ephemeral_identity: PrivateIdentity,
    peer_identity: Identity,
    session_key: DerivedKey,
    signalling: Option<[u8; LINK_SIGNALLING_SIZE]>,
    status: LinkStatus,
    request_time: Instant,
    last_inbound: Instant,
    rtt: Duration,
    pending_requests: HashMap<[u8; SHORT_HASH_SIZE], PendingRequest>,
    // Ratchet epochs; atomics so sealing stays possible through `&self`.
    tx_epoch: std::sync::atomic::AtomicU32,
    tx_sealed: std::sync::atomic::AtomicU32,
    rx_epoch: std::sync::atomic::AtomicU32,
    event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
}

impl Link {
    pub fn new(
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: ShortHash::zero(),
            destination,
            ephemeral_identity: PrivateIdentity::generate(OsRng),
            peer_identity: Identity::default(),
            session_key: DerivedKey::empty(),
            signalling: None,
            status: LinkStatus::Pending,
            request_time: now,
            last_inbound: now,
            rtt: Duration::ZERO,
            pending_requests: HashMap::new(),
            tx_epoch: std::sync::atomic::AtomicU32::new(0),
            tx_sealed: std::sync::atomic::AtomicU32::new(0),
            rx_epoch: std::sync::atomic::AtomicU32::new(0),
            event_tx,
        }
    }

    /// Responder-side construction from a received link request. The request
    /// carries the initiator's ephemeral keys; the responder generates its
    /// own ephemeral agreement key but signs with the destination key so
    /// forwarders can validate the proof.
    pub fn from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        event_tx: tokio::sync::broadcast::Sender<LinkEventData>,
    ) -> Result<Self, LatticaError> {
        if packet.data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(LatticaError::PacketError);
        }

        let data = packet.data.as_slice();
        let peer_identity = Identity::from_slices(
            &data[..PUBLIC_KEY_LENGTH],
            &data[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
        )?;

        let signalling = if data.len() >= PUBLIC_KEY_LENGTH * 2 + LINK_SIGNALLING_SIZE {
            let mut bytes = [0u8; LINK_SIGNALLING_SIZE];
            bytes.copy_from_slice(
                &data[PUBLIC_KEY_LENGTH * 2..PUBLIC_KEY_LENGTH * 2 + LINK_SIGNALLING_SIZE],
            );
            Some(bytes)
        } else {
            None
        };

        let link_id = link_id_from_request(packet);
        log::debug!("link({}): created from inbound request", link_id);

        let now = Instant::now();
        let mut link = Self {
            id: link_id,
            destination,
            ephemeral_identity: PrivateIdentity::new(
                StaticSecret::random_from_rng(OsRng),
                signing_key,
            ),
            peer_identity,
            session_key: DerivedKey::empty(),
            signalling,
            status: LinkStatus::Pending,
            request_time: now,
            last_inbound: now,
            rtt: Duration::ZERO,
            pending_requests: HashMap::new(),
            tx_epoch: std::sync::atomic::AtomicU32::new(0),
            tx_sealed: std::sync::atomic::AtomicU32::new(0),
            rx_epoch: std::sync::atomic::AtomicU32::new(0),
            event_tx,
        };

        link.handshake(peer_identity);
        Ok(link)
    }

    /// Initiator packet one: a broadcast link request carrying the fresh
    /// ephemeral keys. The packet's hash becomes the link id.
    pub fn request(&mut self) -> Packet {
        let mut payload = PacketPayload::new();
        payload.push_truncated(self.ephemeral_identity.as_identity().public_key.as_bytes());
        payload.push_truncated(self.ephemeral_identity.as_identity().verifying_key.as_bytes());

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            ifac: None,
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: payload,
        };

        self.status = LinkStatus::Pending;
        self.id = link_id_from_request(&packet);
        self.request_time = Instant::now();

        packet
    }

    /// Responder packet two: the proof, addressed to the link id. Signed
    /// over `link_id ∥ responder keys (∥ signalling)` with the destination
    /// signing key, so forwarders holding the announced identity can vet it
    /// without learning any session material.
    pub fn prove(&mut self) -> Packet {
        log::debug!("link({}): proving", self.id);

        if self.status != LinkStatus::Active {
            self.status = LinkStatus::Active;
            self.post_event(LinkEvent::Activated);
        }

        let mut signed = PacketPayload::new();
        signed.push_truncated(self.id.as_slice());
        signed.push_truncated(self.ephemeral_identity.as_identity().public_key.as_bytes());
        signed.push_truncated(self.ephemeral_identity.as_identity().verifying_key.as_bytes());
        if let Some(signalling) = self.signalling {
            signed.push_truncated(&signalling);
        }

        let signature = self.ephemeral_identity.sign(signed.as_slice());

        let mut payload = PacketPayload::new();
        payload.push_truncated(&signature.to_bytes());
        payload.push_truncated(self.ephemeral_identity.as_identity().public_key.as_bytes());
        if let Some(signalling) = self.signalling {
            payload.push_truncated(&signalling);
        }

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: payload,
        }
    }

    /// Per-packet delivery proof: signed packet hash, addressed to the link.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash().to_bytes();
        let signature = self.ephemeral_identity.sign(&hash).to_bytes();

        let mut payload = PacketPayload::new();
        payload.push_truncated(&hash);
        payload.push_truncated(&signature);

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkProof,
            data: payload,
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if self.status != LinkStatus::Active && self.status != LinkStatus::Stale {
            log::warn!("link({}): data packet in {:?} state", self.id, self.status);
        }

        match packet.context {
            PacketContext::None
            | PacketContext::Request
            | PacketContext::Response
            | PacketContext::LinkIdentify => {
                let mut buffer = [0u8; PACKET_MDU];
                let Ok(plain) = self.open(packet.data.as_slice(), &mut buffer[..]) else {
                    log::error!("link({}): undecryptable packet", self.id);
                    return LinkHandleResult::None;
                };

                self.touch_inbound();

                let (request_id, body) = match packet.context {
                    PacketContext::Request => {
                        // The request id is the request packet's own hash.
                        let hash = packet.hash().to_bytes();
                        let mut id = [0u8; SHORT_HASH_SIZE];
                        id.copy_from_slice(&hash[..SHORT_HASH_SIZE]);
                        (Some(id), plain)
                    }
                    PacketContext::Response => {
                        if plain.len() < SHORT_HASH_SIZE {
                            return LinkHandleResult::None;
                        }
                        let mut id = [0u8; SHORT_HASH_SIZE];
                        id.copy_from_slice(&plain[..SHORT_HASH_SIZE]);
                        self.pending_requests.remove(&id);
                        (Some(id), &plain[SHORT_HASH_SIZE..])
                    }
                    _ => (None, plain),
                };

                self.post_event(LinkEvent::Data(Box::new(LinkPayload::with_request_id(
                    body,
                    packet.context,
                    request_id,
                ))));
                return LinkHandleResult::Proof(self.prove_packet(packet));
            }
            PacketContext::KeepAlive => {
                if packet.data.as_slice().first() == Some(&KEEPALIVE_PROBE) {
                    self.touch_inbound();
                    return LinkHandleResult::KeepAlive;
                }
                if packet.data.as_slice().first() == Some(&KEEPALIVE_REPLY) {
                    self.touch_inbound();
                    return LinkHandleResult::None;
                }
            }
            PacketContext::LinkClose => {
                self.close();
            }
            PacketContext::LinkRtt => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plain) = self.open(packet.data.as_slice(), &mut buffer[..]) {
                    if let Ok(rtt) = rmp_serde::from_slice::<f32>(plain) {
                        self.rtt = Duration::from_secs_f32(rtt.max(0.0));
                        self.touch_inbound();
                        log::trace!("link({}): peer rtt {:.3}s", self.id, rtt);
                    }
                }
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> LinkHandleResult {
        if packet.destination != self.id {
            return LinkHandleResult::None;
        }

        match packet.header.packet_type {
            PacketType::Data => return self.handle_data_packet(packet),
            PacketType::Proof => {
                if packet.context == PacketContext::LinkRequestProof
                    && self.status == LinkStatus::Pending
                {
                    match validate_link_proof(&self.destination, &self.id, packet) {
                        Ok(identity) => {
                            log::debug!("link({}): proof verified", self.id);

                            self.handshake(identity);
                            self.status = LinkStatus::Active;
                            self.rtt = self.request_time.elapsed();
                            self.touch_inbound();

                            self.post_event(LinkEvent::Activated);
                            return LinkHandleResult::Activated;
                        }
                        Err(_) => {
                            log::warn!("link({}): rejecting invalid proof", self.id);
                        }
                    }
                }

                if packet.context == PacketContext::LinkProof {
                    // Delivery confirmation for one of our packets.
                    if self.verify_packet_proof(packet).is_some() {
                        self.touch_inbound();
                    }
                }
            }
            _ => {}
        }

        LinkHandleResult::None
    }

    /// Checks a per-packet proof against pending requests. Returns the
    /// confirmed packet hash when the signature verifies.
    pub fn verify_packet_proof(&mut self, proof: &Packet) -> Option<Hash> {
        let data = proof.data.as_slice();
        if data.len() < 32 + SIGNATURE_LENGTH {
            return None;
        }

        let hash = Hash::from_slice(&data[..32]).ok()?;
        let signature = Signature::from_slice(&data[32..32 + SIGNATURE_LENGTH]).ok()?;
        self.peer_identity.verify(hash.as_slice(), &signature).ok()?;

        let mut id = [0u8; SHORT_HASH_SIZE];
        id.copy_from_slice(&hash.as_slice()[..SHORT_HASH_SIZE]);
        self.pending_requests.remove(&id);

        Some(hash)
    }

    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, LatticaError> {
        self.sealed_packet(data, PacketContext::None)
    }

    /// Reliable request: `method ∥ arguments` sealed under the session key.
    /// The returned request id is the packet's truncated hash; the packet is
    /// retransmitted by the owner until a response or proof arrives.
    pub fn request_packet(
        &mut self,
        method: &ShortHash,
        arguments: &[u8],
    ) -> Result<([u8; SHORT_HASH_SIZE], Packet), LatticaError> {
        let mut body = vec![0u8; SHORT_HASH_SIZE + arguments.len()];
        {
            let mut writer = ByteWriter::new(&mut body);
            writer.write(method.as_slice())?;
            writer.write(arguments)?;
        }

        let packet = self.sealed_packet(&body, PacketContext::Request)?;

        let hash = packet.hash().to_bytes();
        let mut request_id = [0u8; SHORT_HASH_SIZE];
        request_id.copy_from_slice(&hash[..SHORT_HASH_SIZE]);

        self.pending_requests.insert(
            request_id,
            PendingRequest { packet, sent_at: Instant::now(), retries_left: 3 },
        );

        Ok((request_id, packet))
    }

    pub fn response_packet(
        &self,
        request_id: &[u8; SHORT_HASH_SIZE],
        data: &[u8],
    ) -> Result<Packet, LatticaError> {
        let mut body = vec![0u8; SHORT_HASH_SIZE + data.len()];
        {
            let mut writer = ByteWriter::new(&mut body);
            writer.write(request_id)?;
            writer.write(data)?;
        }
        self.sealed_packet(&body, PacketContext::Response)
    }

    /// Optional peer identification, sent over the encrypted channel only:
    /// the initiator's long-term keys and a signature over
    /// `link_id ∥ public keys`.
    pub fn identify_packet(&self, identity: &PrivateIdentity) -> Result<Packet, LatticaError> {
        let mut signed = PacketPayload::new();
        signed.push_truncated(self.id.as_slice());
        signed.push_truncated(identity.as_identity().public_key_bytes());
        signed.push_truncated(identity.as_identity().verifying_key_bytes());
        let signature = identity.sign(signed.as_slice());

        let mut body = Vec::with_capacity(PUBLIC_KEY_LENGTH * 2 + SIGNATURE_LENGTH);
        body.extend_from_slice(identity.as_identity().public_key_bytes());
        body.extend_from_slice(identity.as_identity().verifying_key_bytes());
        body.extend_from_slice(&signature.to_bytes());

        self.sealed_packet(&body, PacketContext::LinkIdentify)
    }

    fn sealed_packet(&self, data: &[u8], context: PacketContext) -> Result<Packet, LatticaError> {
        if self.status != LinkStatus::Active {
            log::warn!("link({}): sealing packet while {:?}", self.id, self.status);
        }

        let mut payload = PacketPayload::new();
        let sealed_len = {
            let sealed = self.seal(data, payload.grow_max())?;
            sealed.len()
        };
        payload.truncate(sealed_len);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context,
            data: payload,
        })
    }

    /// 14-byte keepalive carrier: header, link id, context and a one-byte
    /// body, unencrypted by design so relays can refresh their tables.
    pub fn keep_alive_packet(&self, body: u8) -> Packet {
        let mut payload = PacketPayload::new();
        payload.push_truncated(&[body]);

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: payload,
        }
    }

    /// Initiator packet three: the encrypted RTT measurement, which also
    /// proves to the responder that the initiator completed the exchange.
    pub fn rtt_packet(&self) -> Result<Packet, LatticaError> {
        let rtt = self.rtt.as_secs_f32();
        let body = rmp_serde::to_vec(&rtt).map_err(|_| LatticaError::PacketError)?;

        let mut payload = PacketPayload::new();
        let sealed_len = {
            let sealed = self.seal(&body, payload.grow_max())?;
            sealed.len()
        };
        payload.truncate(sealed_len);

        log::trace!("link({}): rtt measured at {:.3}s", self.id, rtt);

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRtt,
            data: payload,
        })
    }

    pub fn close_packet(&self) -> Packet {
        let mut payload = PacketPayload::new();
        payload.push_truncated(self.id.as_slice());

        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkClose,
            data: payload,
        }
    }

    /// Traffic key for one ratchet epoch, derived from the session key and
    /// the counter. Epoch 0 is the first traffic key; the raw session key
    /// never touches a packet.
    fn key_for_epoch(&self, epoch: u32) -> DerivedKey {
        let mut info = [0u8; 11];
        info[..7].copy_from_slice(b"ratchet");
        info[7..].copy_from_slice(&epoch.to_be_bytes());
        self.session_key.advanced(&info)
    }

    /// Seals under the current TX epoch and advances the ratchet every
    /// [`LINK_RATCHET_SPAN`] sealed payloads.
    pub fn seal<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], LatticaError> {
        use std::sync::atomic::Ordering;

        let epoch = self.tx_epoch.load(Ordering::Relaxed);
        let sealed =
            self.ephemeral_identity.seal(OsRng, text, &self.key_for_epoch(epoch), out_buf)?;

        if self.tx_sealed.fetch_add(1, Ordering::Relaxed) + 1 >= LINK_RATCHET_SPAN {
            self.tx_sealed.store(0, Ordering::Relaxed);
            self.tx_epoch.store(epoch.wrapping_add(1), Ordering::Relaxed);
            log::trace!("link({}): tx ratchet advanced to {}", self.id, epoch.wrapping_add(1));
        }

        Ok(sealed)
    }

    /// Opens against the peer's last known epoch, probing the neighbouring
    /// epochs so the two ends re-synchronise after loss.
    pub fn open<'a>(&self, data: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], LatticaError> {
        use std::sync::atomic::Ordering;

        let base = self.rx_epoch.load(Ordering::Relaxed);
        let candidates =
            [base, base.wrapping_add(1), base.wrapping_add(2), base.saturating_sub(1)];

        let mut matched = None;
        for candidate in candidates {
            let key = self.key_for_epoch(candidate);
            let (sign_half, cipher_half) = key.halves();
            let cipher =
                crate::crypt::token::TokenCipher::from_halves(sign_half, cipher_half, OsRng);
            if cipher.verify(crate::crypt::token::Token::from(data)).is_ok() {
                matched = Some(candidate);
                break;
            }
        }

        let epoch = matched.ok_or(LatticaError::CryptoError)?;
        if epoch != base {
            self.rx_epoch.store(epoch, Ordering::Relaxed);
        }

        self.ephemeral_identity.open(OsRng, data, &self.key_for_epoch(epoch), out_buf)
    }

    /// Requests due for retransmission; requests out of retries are dropped
    /// and reported.
    pub fn sweep_requests(&mut self, timeout: Duration) -> (Vec<Packet>, Vec<[u8; SHORT_HASH_SIZE]>) {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut failed = Vec::new();

        for (id, pending) in self.pending_requests.iter_mut() {
            if now.duration_since(pending.sent_at) < timeout {
                continue;
            }
            if pending.retries_left == 0 {
                failed.push(*id);
                continue;
            }
            pending.retries_left -= 1;
            pending.sent_at = now;
            resend.push(pending.packet);
        }

        for id in &failed {
            self.pending_requests.remove(id);
        }

        (resend, failed)
    }

    fn handshake(&mut self, peer_identity: Identity) {
        use std::sync::atomic::Ordering;

        log::debug!("link({}): handshake", self.id);

        self.status = LinkStatus::Handshake;
        self.peer_identity = peer_identity;
        self.session_key = self
            .ephemeral_identity
            .derive_key(&self.peer_identity.public_key, Some(self.id.as_slice()));
        self.tx_epoch.store(0, Ordering::Relaxed);
        self.tx_sealed.store(0, Ordering::Relaxed);
        self.rx_epoch.store(0, Ordering::Relaxed);
    }

    fn post_event(&self, event: LinkEvent) {
        let _ = self.event_tx.send(LinkEventData {
            id: self.id,
            address_hash: self.destination.address_hash,
            event,
        });
    }

    fn touch_inbound(&mut self) {
        self.last_inbound = Instant::now();
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
        }
    }

    /// Silence threshold after which this link counts as stale.
    pub fn stale_after(&self) -> Duration {
        LINK_STALE_FLOOR.max(self.rtt * LINK_STALE_RTT_FACTOR)
    }

    /// Advances the staleness state machine; returns the new status when it
    /// changed.
    pub fn check_timeouts(&mut self) -> Option<LinkStatus> {
        if self.status != LinkStatus::Active && self.status != LinkStatus::Stale {
            return None;
        }

        let silence = self.last_inbound.elapsed();
        match self.status {
            LinkStatus::Active if silence > self.stale_after() => {
                self.status = LinkStatus::Stale;
                self.post_event(LinkEvent::Stale);
                log::debug!("link({}): stale after {:?} of silence", self.id, silence);
                Some(LinkStatus::Stale)
            }
            LinkStatus::Stale if silence > self.stale_after() + LINK_STALE_GRACE => {
                self.close();
                Some(LinkStatus::Closed)
            }
            _ => None,
        }
    }

    pub fn close(&mut self) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.post_event(LinkEvent::Closed);
        log::debug!("link({}): closed", self.id);
    }

    pub fn restart(&mut self) {
        log::debug!(
            "link({}): restarting after {}s",
            self.id,
            self.request_time.elapsed().as_secs()
        );
        self.status = LinkStatus::Pending;
    }

    pub fn elapsed(&self) -> Duration {
        self.request_time.elapsed()
    }

    pub fn silence(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }
}

/// Forwarder- and initiator-side proof validation. Needs only the
/// destination's announced identity, never the session key.
pub fn validate_link_proof(
    destination: &DestinationDesc,
    id: &LinkId,
    packet: &Packet,
) -> Result<Identity, LatticaError> {
    const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
    const SIGNED_MAX: usize = SHORT_HASH_SIZE + PUBLIC_KEY_LENGTH * 2 + LINK_SIGNALLING_SIZE;

    let data = packet.data.as_slice();
    if data.len() < MIN_PROOF_LEN {
        return Err(LatticaError::PacketError);
    }

    let verifying_key = destination.identity.verifying_key.as_bytes();

    let mut signed = [0u8; SIGNED_MAX];
    let signed_len = {
        let mut writer = ByteWriter::new(&mut signed[..]);
        writer.write(id.as_slice())?;
        writer.write(&data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH])?;
        writer.write(verifying_key)?;
        if data.len() > MIN_PROOF_LEN {
            writer.write(&data[MIN_PROOF_LEN..])?;
        }
        writer.written()
    };

    let identity = Identity::from_slices(
        &data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH],
        verifying_key,
    )?;

    let signature =
        Signature::from_slice(&data[..SIGNATURE_LENGTH]).map_err(|_| LatticaError::CryptoError)?;

    identity.verify(&signed[..signed_len], &signature)?;

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{link_id_from_request, validate_link_proof, Link, LinkHandleResult, LinkStatus};
    use crate::destination::{DestinationName, SingleInputDestination, SingleOutputDestination};
    use crate::hash::ShortHash;
    use crate::identity::PrivateIdentity;

    fn destination_pair() -> (SingleInputDestination, SingleOutputDestination) {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("linktest", "node");
        let input = SingleInputDestination::new(identity.clone(), name);
        let output = SingleOutputDestination::new(*identity.as_identity(), name);
        (input, output)
    }

    fn establish() -> (Link, Link) {
        let (input, output) = destination_pair();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);

        let mut initiator = Link::new(output.desc, tx.clone());
        let request = initiator.request();

        let mut responder =
            Link::from_request(&request, input.signing_key().clone(), input.desc, tx)
                .expect("responder link");
        let proof = responder.prove();

        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));
        (initiator, responder)
    }

    #[test]
    fn three_packet_establishment_yields_matching_keys() {
        let (initiator, responder) = establish();
        assert_eq!(initiator.status(), LinkStatus::Active);
        assert_eq!(responder.status(), LinkStatus::Active);
        assert_eq!(initiator.id(), responder.id());

        let packet = initiator.data_packet(b"across the session").expect("data packet");
        let mut buffer = [0u8; 512];
        let plain = responder.open(packet.data.as_slice(), &mut buffer).expect("opens");
        assert_eq!(plain, b"across the session");
    }

    #[test]
    fn tampered_proof_keeps_link_pending() {
        let (input, output) = destination_pair();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);

        let mut initiator = Link::new(output.desc, tx.clone());
        let request = initiator.request();

        let mut responder =
            Link::from_request(&request, input.signing_key().clone(), input.desc, tx)
                .expect("responder link");
        let mut proof = responder.prove();
        proof.data.as_mut_slice()[0] ^= 0x01;

        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::None));
        assert_eq!(initiator.status(), LinkStatus::Pending);
        assert!(validate_link_proof(&output.desc, initiator.id(), &proof).is_err());
    }

    #[test]
    fn link_id_survives_signalling_bytes() {
        let (_, output) = destination_pair();
        let (tx, _rx) = tokio::sync::broadcast::channel(16);

        let mut link = Link::new(output.desc, tx);
        let mut request = link.request();
        let id = *link.id();

        // Trailing signalling must not shift the id.
        request.data.push_truncated(&[0x01, 0xF4, 0x00]);
        assert_eq!(link_id_from_request(&request), id);
    }

    #[test]
    fn request_response_roundtrip_matches_ids() {
        let (mut initiator, mut responder) = establish();

        let method = ShortHash::of(b"status");
        let (request_id, request) =
            initiator.request_packet(&method, b"verbose").expect("request");

        let result = responder.handle_packet(&request);
        assert!(matches!(result, LinkHandleResult::Proof(_)));

        let response = responder.response_packet(&request_id, b"ready").expect("response");
        let result = initiator.handle_packet(&response);
        assert!(matches!(result, LinkHandleResult::Proof(_)));

        // The matched request must no longer be pending.
        let (resend, failed) = initiator.sweep_requests(std::time::Duration::ZERO);
        assert!(resend.is_empty());
        assert!(failed.is_empty());
    }

    #[test]
    fn keepalive_probe_is_recognised() {
        let (initiator, mut responder) = establish();
        let probe = initiator.keep_alive_packet(super::KEEPALIVE_PROBE);
        assert!(matches!(responder.handle_packet(&probe), LinkHandleResult::KeepAlive));
    }

    #[test]
    fn identify_packet_carries_verifiable_signature() {
        let (initiator, mut responder) = establish();

        let long_term = PrivateIdentity::generate(OsRng);
        let identify = initiator.identify_packet(&long_term).expect("identify packet");

        // Responder decrypts and the payload surfaces through the event
        // channel; here we check the plaintext shape directly.
        let mut buffer = [0u8; 512];
        let plain = responder.open(identify.data.as_slice(), &mut buffer).expect("opens");
        assert_eq!(plain.len(), 32 + 32 + 64);
        assert_eq!(&plain[..32], long_term.as_identity().public_key_bytes());
        assert!(matches!(responder.handle_packet(&identify), LinkHandleResult::Proof(_)));
    }

    #[test]
    fn stale_threshold_scales_with_rtt() {
        let (initiator, _responder) = establish();
        assert!(initiator.stale_after() >= super::LINK_STALE_FLOOR);
    }

    #[test]
    fn ratchet_epochs_advance_and_peer_resyncs() {
        let (initiator, mut responder) = establish();

        // Enough traffic to cross several ratchet boundaries; every packet
        // must still open on the peer.
        for i in 0..(super::LINK_RATCHET_SPAN * 3 + 5) {
            let body = format!("payload {}", i);
            let packet = initiator.data_packet(body.as_bytes()).expect("data packet");
            assert!(
                matches!(responder.handle_packet(&packet), LinkHandleResult::Proof(_)),
                "packet {} must decrypt across epoch boundaries",
                i
            );
        }
    }
}
