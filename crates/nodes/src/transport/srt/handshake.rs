// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! SRT handshake state machine and the `HandshakeNode` that drives it over a
//! real `tokio::net::UdpSocket`. Grounded on `upipe_srt_handshake.c`'s
//! listener/caller state machines, restated as an explicit `HandshakeState`
//! enum instead of a callback-driven libuv-style event loop.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use streamkit_core::node::{NodeContext, ProcessorNode};
use streamkit_core::pins::{InputPin, OutputPin, PinCardinality};
use streamkit_core::registry::{NodeRegistry, StaticPins};
use streamkit_core::types::PacketType;
use streamkit_core::StreamKitError;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use super::crypto::{aes_key_unwrap, aes_key_wrap, derive_kek, KeyLength};
use super::wire::{
    ControlType, HandshakeCif, KeyMaterialExt, SrtHeader, HS_TYPE_CONCLUSION, HS_TYPE_INDUCTION,
    SRT_HANDSHAKE_CIF_SIZE,
};

/// SRT protocol version advertised in the handshake CIF.
const SRT_VERSION: u32 = 0x0105_0000;

/// Number of retries before a handshake attempt is abandoned (§4.J).
pub(crate) const MAX_HANDSHAKE_RETRIES: u32 = 5;

/// Base retransmit timeout for unanswered induction/conclusion packets.
pub(crate) const HANDSHAKE_RETRANSMIT: Duration = Duration::from_millis(250);

/// Overall deadline from the first induction packet: if `Established` isn't
/// reached by then the attempt aborts outright, independent of
/// [`MAX_HANDSHAKE_RETRIES`] (§4.J "Handshake timeout").
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Role this endpoint plays in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SrtRole {
    Caller,
    Listener,
}

/// Handshake progress, mirroring the listener/caller induction/conclusion
/// exchange described in §4.J.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    InductionSent { cookie: u32, attempt: u32 },
    InductionReceived { peer_cookie: u32 },
    ConclusionSent { attempt: u32 },
    Established { socket_id: u32, peer_socket_id: u32 },
    ShutdownSent,
    Failed(String),
}

/// Pure handshake state machine, independent of the socket it runs over, so
/// it can be exercised with synthetic packets in tests.
pub struct HandshakeSm {
    role: SrtRole,
    state: HandshakeState,
    local_socket_id: u32,
    passphrase: Option<String>,
    /// Salt and stream encryption key negotiated via the HSREQ/KMREQ
    /// extension, once a conclusion packet carrying one has been built
    /// (caller) or parsed (listener). `None` until then, or permanently if
    /// no `passphrase` was configured.
    key_material: Option<([u8; 16], Vec<u8>)>,
}

impl HandshakeSm {
    #[must_use]
    pub fn new(role: SrtRole, local_socket_id: u32, passphrase: Option<String>) -> Self {
        Self { role, state: HandshakeState::Idle, local_socket_id, passphrase, key_material: None }
    }

    #[must_use]
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Established { .. })
    }

    /// The negotiated `(salt, stream encryption key)` pair, present once the
    /// handshake completes with a passphrase configured on both ends.
    #[must_use]
    pub fn key_material(&self) -> Option<(&[u8; 16], &[u8])> {
        self.key_material.as_ref().map(|(salt, sek)| (salt, sek.as_slice()))
    }

    /// Begin a caller-side handshake: build the induction packet to send.
    #[must_use]
    pub fn start_caller(&mut self, initial_seq: u32) -> Vec<u8> {
        self.state = HandshakeState::InductionSent { cookie: 0, attempt: 0 };
        self.build_handshake_packet(HS_TYPE_INDUCTION, initial_seq, 0, 0)
    }

    /// Process an inbound handshake CIF payload (after the 16-byte header has
    /// already been stripped by the caller), returning bytes to send back (if
    /// any) and whether the handshake is now established.
    ///
    /// # Errors
    ///
    /// Returns [`StreamKitError::Network`] if the CIF cannot be parsed, or
    /// [`StreamKitError::Busy`] if a role switch is requested mid-handshake
    /// (the node must be recreated per §7's `Busy` mapping).
    pub fn on_handshake_cif(
        &mut self,
        cif_bytes: &[u8],
        initial_seq: u32,
    ) -> Result<Option<Vec<u8>>, StreamKitError> {
        let cif = HandshakeCif::parse(cif_bytes)
            .map_err(|e| StreamKitError::Network(format!("malformed handshake CIF: {e}")))?;

        match self.role {
            SrtRole::Listener => self.on_handshake_cif_as_listener(cif, cif_bytes, initial_seq),
            SrtRole::Caller => self.on_handshake_cif_as_caller(cif),
        }
    }

    fn on_handshake_cif_as_listener(
        &mut self,
        cif: HandshakeCif,
        cif_bytes: &[u8],
        initial_seq: u32,
    ) -> Result<Option<Vec<u8>>, StreamKitError> {
        match cif.handshake_type {
            HS_TYPE_INDUCTION => {
                let cookie = syn_cookie_for(cif.srt_socket_id);
                self.state = HandshakeState::InductionSent { cookie, attempt: 0 };
                let reply = self.build_handshake_packet(
                    HS_TYPE_INDUCTION,
                    initial_seq,
                    self.local_socket_id,
                    cookie,
                );
                Ok(Some(reply))
            },
            HS_TYPE_CONCLUSION => {
                let expected_cookie = match self.state {
                    HandshakeState::InductionSent { cookie, .. } => cookie,
                    _ => return Err(StreamKitError::Busy("handshake role switch mid-flow".into())),
                };
                if cif.syn_cookie != expected_cookie {
                    return Ok(None); // stale/spoofed conclusion, drop silently
                }
                if cif_bytes.len() > SRT_HANDSHAKE_CIF_SIZE {
                    self.accept_key_material_ext(&cif_bytes[SRT_HANDSHAKE_CIF_SIZE..]);
                }
                self.state = HandshakeState::Established {
                    socket_id: self.local_socket_id,
                    peer_socket_id: cif.srt_socket_id,
                };
                let reply = self.build_handshake_packet(
                    HS_TYPE_CONCLUSION,
                    initial_seq,
                    self.local_socket_id,
                    cif.syn_cookie,
                );
                Ok(Some(reply))
            },
            other => Err(StreamKitError::Network(format!("unexpected handshake type {other}"))),
        }
    }

    /// Parse a KMREQ extension from a received conclusion packet and, if this
    /// endpoint has a passphrase configured, unwrap the stream encryption key
    /// and store the negotiated `(salt, sek)` pair.
    fn accept_key_material_ext(&mut self, ext_bytes: &[u8]) {
        let Some(passphrase) = self.passphrase.clone() else { return };
        let Ok(ext) = KeyMaterialExt::parse(ext_bytes) else { return };
        let kek = derive_kek(passphrase.as_bytes(), &ext.salt, KeyLength::Aes128);
        match aes_key_unwrap(&kek, &ext.wrapped_sek) {
            Ok(sek) => self.key_material = Some((ext.salt, sek)),
            Err(e) => tracing::warn!("SRT KMREQ unwrap failed (wrong passphrase?): {e}"),
        }
    }

    /// Generate a fresh salt/SEK pair, wrap it with the KEK derived from this
    /// endpoint's passphrase, and remember the plaintext pair as this
    /// endpoint's negotiated key material. Returns the extension bytes to
    /// append to the conclusion packet, or `None` if no passphrase is set.
    fn generate_key_material_ext(&mut self) -> Option<Vec<u8>> {
        let passphrase = self.passphrase.clone()?;
        let salt: [u8; 16] = rand::random();
        let sek: [u8; 16] = rand::random();
        let kek = derive_kek(passphrase.as_bytes(), &salt, KeyLength::Aes128);
        let wrapped_sek = aes_key_wrap(&kek, &sek).ok()?;
        self.key_material = Some((salt, sek.to_vec()));
        Some(KeyMaterialExt { salt, wrapped_sek }.to_bytes())
    }

    fn on_handshake_cif_as_caller(
        &mut self,
        cif: HandshakeCif,
    ) -> Result<Option<Vec<u8>>, StreamKitError> {
        match cif.handshake_type {
            HS_TYPE_INDUCTION => {
                self.state = HandshakeState::InductionReceived { peer_cookie: cif.syn_cookie };
                let key_ext = self.generate_key_material_ext();
                let reply = self.build_handshake_packet_ext(
                    HS_TYPE_CONCLUSION,
                    cif.initial_seq_num,
                    self.local_socket_id,
                    cif.syn_cookie,
                    key_ext.as_deref(),
                );
                self.state = HandshakeState::ConclusionSent { attempt: 0 };
                Ok(Some(reply))
            },
            HS_TYPE_CONCLUSION => {
                if !matches!(self.state, HandshakeState::ConclusionSent { .. }) {
                    return Ok(None);
                }
                self.state = HandshakeState::Established {
                    socket_id: self.local_socket_id,
                    peer_socket_id: cif.srt_socket_id,
                };
                Ok(None)
            },
            other => Err(StreamKitError::Network(format!("unexpected handshake type {other}"))),
        }
    }

    /// Called on a retransmit timer tick; returns a packet to resend, or an
    /// error once retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StreamKitError::Network`] once [`MAX_HANDSHAKE_RETRIES`] is
    /// exceeded without reaching [`HandshakeState::Established`].
    pub fn on_retransmit_tick(&mut self, initial_seq: u32) -> Result<Vec<u8>, StreamKitError> {
        match self.state {
            HandshakeState::InductionSent { cookie, attempt } if attempt < MAX_HANDSHAKE_RETRIES => {
                self.state = HandshakeState::InductionSent { cookie, attempt: attempt + 1 };
                Ok(self.build_handshake_packet(
                    HS_TYPE_INDUCTION,
                    initial_seq,
                    self.local_socket_id,
                    cookie,
                ))
            },
            HandshakeState::ConclusionSent { attempt } if attempt < MAX_HANDSHAKE_RETRIES => {
                self.state = HandshakeState::ConclusionSent { attempt: attempt + 1 };
                Ok(self.build_handshake_packet(
                    HS_TYPE_CONCLUSION,
                    initial_seq,
                    self.local_socket_id,
                    0,
                ))
            },
            HandshakeState::InductionSent { .. } | HandshakeState::ConclusionSent { .. } => {
                self.state = HandshakeState::Failed("handshake retries exhausted".into());
                Err(StreamKitError::Network("handshake retries exhausted".into()))
            },
            _ => Err(StreamKitError::Busy("no retransmit pending in current state".into())),
        }
    }

    fn build_handshake_packet(
        &self,
        handshake_type: u32,
        initial_seq: u32,
        socket_id: u32,
        syn_cookie: u32,
    ) -> Vec<u8> {
        self.build_handshake_packet_ext(handshake_type, initial_seq, socket_id, syn_cookie, None)
    }

    /// Build a handshake packet, optionally appending a KMREQ extension
    /// block (salt + wrapped SEK) after the fixed CIF.
    fn build_handshake_packet_ext(
        &self,
        handshake_type: u32,
        initial_seq: u32,
        socket_id: u32,
        syn_cookie: u32,
        key_ext: Option<&[u8]>,
    ) -> Vec<u8> {
        let header = SrtHeader::Control {
            control_type: ControlType::Handshake,
            type_specific: 0,
            timestamp: 0,
            dest_sockid: 0,
        };
        let cif = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: u16::from(self.passphrase.is_some()),
            extension_field: u16::from(key_ext.is_some()),
            initial_seq_num: initial_seq,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type,
            srt_socket_id: socket_id,
            syn_cookie,
            peer_addr: [0; 16],
        };
        let mut out = Vec::with_capacity(16 + SRT_HANDSHAKE_CIF_SIZE + key_ext.map_or(0, <[u8]>::len));
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&cif.to_bytes());
        if let Some(ext) = key_ext {
            out.extend_from_slice(ext);
        }
        out
    }

    /// Derive the key-encrypting key for this handshake's passphrase, if
    /// one was configured.
    #[must_use]
    pub fn derive_kek(&self, salt: &[u8; 16], key_len: KeyLength) -> Option<Vec<u8>> {
        self.passphrase.as_ref().map(|p| derive_kek(p.as_bytes(), salt, key_len))
    }
}

/// Awaits the node's cancellation token, if one was provided, else never
/// resolves. Lets the handshake's `select!` loop treat cancellation
/// uniformly regardless of whether the engine wired one up.
async fn cancelled(context: &NodeContext) {
    match &context.cancellation_token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// A cheap, deterministic SYN cookie derived from the peer's advertised
/// socket id, so a listener need not keep per-attempt server-side state
/// before the conclusion round-trip (mirrors the source's stateless cookie
/// approach to resist induction-flood amplification).
fn syn_cookie_for(peer_socket_id: u32) -> u32 {
    peer_socket_id.wrapping_mul(2_654_435_761).rotate_left(13)
}

/// Connection parameters a completed handshake hands to whichever
/// [`super::receiver::ReceiverNode`]/[`super::sender::SenderNode`] is wired
/// downstream of [`HandshakeNode`]'s `established` pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedParams {
    pub socket_id: u32,
    pub peer_socket_id: u32,
    pub key_material: Option<([u8; 16], Vec<u8>)>,
}

impl EstablishedParams {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let extra = self.key_material.as_ref().map_or(0, |(_, sek)| 17 + sek.len());
        let mut out = Vec::with_capacity(9 + extra);
        out.extend_from_slice(&self.socket_id.to_be_bytes());
        out.extend_from_slice(&self.peer_socket_id.to_be_bytes());
        match &self.key_material {
            Some((salt, sek)) => {
                out.push(1);
                out.extend_from_slice(salt);
                out.push(u8::try_from(sek.len()).unwrap_or(0));
                out.extend_from_slice(sek);
            },
            None => out.push(0),
        }
        out
    }
}

/// Configuration for [`HandshakeNode`].
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct SrtHandshakeConfig {
    pub role: SrtRole,
    pub bind_addr: String,
    #[serde(default)]
    pub remote_addr: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

/// Drives a [`HandshakeSm`] to completion over a real UDP socket, then
/// forwards the bound socket's connection parameters downstream so
/// [`super::receiver::ReceiverNode`]/[`super::sender::SenderNode`] can adopt
/// it without repeating the handshake.
pub struct HandshakeNode {
    config: SrtHandshakeConfig,
}

impl HandshakeNode {
    #[must_use]
    pub fn new(config: SrtHandshakeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessorNode for HandshakeNode {
    fn input_pins(&self) -> Vec<InputPin> {
        Vec::new()
    }

    fn output_pins(&self) -> Vec<OutputPin> {
        vec![OutputPin {
            name: "established".into(),
            produces_type: PacketType::Binary,
            cardinality: PinCardinality::One,
        }]
    }

    async fn run(self: Box<Self>, mut context: NodeContext) -> Result<(), StreamKitError> {
        let bind_addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| StreamKitError::Configuration(format!("invalid bind_addr: {e}")))?;
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| StreamKitError::Network(format!("bind failed: {e}")))?;

        let local_socket_id: u32 = rand::random();
        let mut sm = HandshakeSm::new(self.config.role, local_socket_id, self.config.passphrase.clone());
        let initial_seq: u32 = rand::random::<u32>() & 0x7FFF_FFFF;

        let remote: Option<SocketAddr> = match &self.config.remote_addr {
            Some(addr) => Some(
                addr.parse()
                    .map_err(|e| StreamKitError::Configuration(format!("invalid remote_addr: {e}")))?,
            ),
            None => None,
        };

        let mut peer_addr = remote;
        if self.config.role == SrtRole::Caller {
            let Some(dst) = remote else {
                return Err(StreamKitError::Configuration(
                    "caller role requires remote_addr".into(),
                ));
            };
            let packet = sm.start_caller(initial_seq);
            socket
                .send_to(&packet, dst)
                .await
                .map_err(|e| StreamKitError::Network(format!("send failed: {e}")))?;
        }

        let mut buf = vec![0u8; 1500];
        let mut retransmit = tokio::time::interval_at(
            Instant::now() + HANDSHAKE_RETRANSMIT,
            HANDSHAKE_RETRANSMIT,
        );
        let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
        tokio::pin!(deadline);

        while !sm.is_established() {
            tokio::select! {
                biased;
                () = cancelled(&context) => {
                    return Ok(());
                }
                () = &mut deadline => {
                    return Err(StreamKitError::Network(
                        "SRT handshake did not establish within 3s of the first induction".into(),
                    ));
                }
                _ = retransmit.tick() => {
                    if let Some(dst) = peer_addr {
                        match sm.on_retransmit_tick(initial_seq) {
                            Ok(packet) => {
                                let _ = socket.send_to(&packet, dst).await;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                recv = socket.recv_from(&mut buf) => {
                    let (len, from) = recv.map_err(|e| StreamKitError::Network(format!("recv failed: {e}")))?;
                    if len < 16 {
                        continue;
                    }
                    let header = match SrtHeader::parse(&buf[..len]) {
                        Ok(h) => h,
                        Err(_) => continue,
                    };
                    if !matches!(header, SrtHeader::Control { control_type: ControlType::Handshake, .. }) {
                        continue;
                    }
                    peer_addr = Some(from);
                    if let Some(reply) = sm.on_handshake_cif(&buf[16..len], initial_seq)? {
                        let _ = socket.send_to(&reply, from).await;
                    }
                }
            }
        }

        if let &HandshakeState::Established { socket_id, peer_socket_id } = sm.state() {
            tracing::info!(
                socket_id,
                peer_socket_id,
                peer = ?peer_addr,
                "SRT handshake established"
            );
            let params = EstablishedParams {
                socket_id,
                peer_socket_id,
                key_material: sm.key_material().map(|(salt, sek)| (*salt, sek.to_vec())),
            };
            let packet = streamkit_core::types::Packet::Binary {
                data: bytes::Bytes::from(params.to_bytes()),
                content_type: Some(std::borrow::Cow::Borrowed("application/x-streamkit-srt-established")),
                metadata: None,
            };
            let _ = context.output_sender.send("established", packet).await;
        }

        Ok(())
    }
}

/// Register the handshake node factory with the given registry.
///
/// # Panics
///
/// Panics if the config schema cannot be serialized to JSON (should never happen).
pub fn register(registry: &mut NodeRegistry) {
    let outputs = vec![OutputPin {
        name: "established".to_string(),
        produces_type: PacketType::Binary,
        cardinality: PinCardinality::One,
    }];
    registry.register_static_with_description(
        "transport::srt_handshake",
        |config| {
            let config: SrtHandshakeConfig =
                streamkit_core::config_helpers::parse_config_required(config)?;
            Ok(Box::new(HandshakeNode::new(config)) as Box<dyn ProcessorNode>)
        },
        serde_json::to_value(schemars::schema_for!(SrtHandshakeConfig))
            .expect("SrtHandshakeConfig schema should serialize to JSON"),
        StaticPins { inputs: Vec::new(), outputs },
        vec!["transport".to_string(), "srt".to_string()],
        false,
        "Performs an SRT caller/listener handshake and emits connection parameters once established.",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_responds_to_induction_with_cookie() {
        let mut sm = HandshakeSm::new(SrtRole::Listener, 0x1111, None);
        let induction = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_seq_num: 1,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_INDUCTION,
            srt_socket_id: 0x2222,
            syn_cookie: 0,
            peer_addr: [0; 16],
        };
        let reply = sm.on_handshake_cif(&induction.to_bytes(), 1).unwrap();
        assert!(reply.is_some());
        assert!(matches!(sm.state(), HandshakeState::InductionSent { .. }));
    }

    #[test]
    fn listener_establishes_on_matching_conclusion_cookie() {
        let mut sm = HandshakeSm::new(SrtRole::Listener, 0x1111, None);
        let induction = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_seq_num: 1,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_INDUCTION,
            srt_socket_id: 0x2222,
            syn_cookie: 0,
            peer_addr: [0; 16],
        };
        sm.on_handshake_cif(&induction.to_bytes(), 1).unwrap();
        let cookie = match sm.state() {
            HandshakeState::InductionSent { cookie, .. } => *cookie,
            other => panic!("unexpected state {other:?}"),
        };
        let conclusion = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_seq_num: 1,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_CONCLUSION,
            srt_socket_id: 0x2222,
            syn_cookie: cookie,
            peer_addr: [0; 16],
        };
        sm.on_handshake_cif(&conclusion.to_bytes(), 1).unwrap();
        assert!(sm.is_established());
    }

    #[test]
    fn listener_ignores_conclusion_with_wrong_cookie() {
        let mut sm = HandshakeSm::new(SrtRole::Listener, 0x1111, None);
        let induction = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_seq_num: 1,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_INDUCTION,
            srt_socket_id: 0x2222,
            syn_cookie: 0,
            peer_addr: [0; 16],
        };
        sm.on_handshake_cif(&induction.to_bytes(), 1).unwrap();
        let conclusion = HandshakeCif {
            version: SRT_VERSION,
            encryption_field: 0,
            extension_field: 0,
            initial_seq_num: 1,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_CONCLUSION,
            srt_socket_id: 0x2222,
            syn_cookie: 0xBAD,
            peer_addr: [0; 16],
        };
        let reply = sm.on_handshake_cif(&conclusion.to_bytes(), 1).unwrap();
        assert!(reply.is_none());
        assert!(!sm.is_established());
    }

    #[test]
    fn caller_completes_full_round_trip_with_listener() {
        let mut caller = HandshakeSm::new(SrtRole::Caller, 0xAAAA, None);
        let mut listener = HandshakeSm::new(SrtRole::Listener, 0xBBBB, None);
        let caller_seq = 10;
        let listener_seq = 20;

        let induction = caller.start_caller(caller_seq);
        let induction_cif = &induction[16..];
        let listener_reply = listener.on_handshake_cif(induction_cif, listener_seq).unwrap().unwrap();

        let conclusion = caller.on_handshake_cif(&listener_reply[16..], caller_seq).unwrap().unwrap();
        let listener_final = listener.on_handshake_cif(&conclusion[16..], listener_seq).unwrap();

        assert!(caller.is_established());
        assert!(listener.is_established());
        assert!(listener_final.is_none());
    }

    #[test]
    fn retransmit_exhausts_after_max_retries() {
        let mut sm = HandshakeSm::new(SrtRole::Caller, 1, None);
        sm.start_caller(5);
        for _ in 0..MAX_HANDSHAKE_RETRIES {
            assert!(sm.on_retransmit_tick(5).is_ok());
        }
        assert!(sm.on_retransmit_tick(5).is_err());
    }

    #[test]
    fn full_round_trip_negotiates_matching_key_material() {
        let mut caller = HandshakeSm::new(SrtRole::Caller, 0xAAAA, Some("secret".into()));
        let mut listener = HandshakeSm::new(SrtRole::Listener, 0xBBBB, Some("secret".into()));
        let caller_seq = 10;
        let listener_seq = 20;

        let induction = caller.start_caller(caller_seq);
        let listener_reply =
            listener.on_handshake_cif(&induction[16..], listener_seq).unwrap().unwrap();
        let conclusion =
            caller.on_handshake_cif(&listener_reply[16..], caller_seq).unwrap().unwrap();
        listener.on_handshake_cif(&conclusion[16..], listener_seq).unwrap();

        assert!(caller.is_established());
        assert!(listener.is_established());
        let (caller_salt, caller_sek) = caller.key_material().expect("caller has key material");
        let (listener_salt, listener_sek) =
            listener.key_material().expect("listener has key material");
        assert_eq!(caller_salt, listener_salt);
        assert_eq!(caller_sek, listener_sek);
    }

    #[test]
    fn mismatched_passphrase_leaves_listener_without_key_material() {
        let mut caller = HandshakeSm::new(SrtRole::Caller, 0xAAAA, Some("secret".into()));
        let mut listener = HandshakeSm::new(SrtRole::Listener, 0xBBBB, Some("wrong".into()));
        let caller_seq = 1;
        let listener_seq = 2;

        let induction = caller.start_caller(caller_seq);
        let listener_reply =
            listener.on_handshake_cif(&induction[16..], listener_seq).unwrap().unwrap();
        let conclusion =
            caller.on_handshake_cif(&listener_reply[16..], caller_seq).unwrap().unwrap();
        listener.on_handshake_cif(&conclusion[16..], listener_seq).unwrap();

        assert!(listener.is_established());
        assert!(listener.key_material().is_none());
    }

    #[test]
    fn kek_derivation_present_only_with_passphrase() {
        let sm = HandshakeSm::new(SrtRole::Caller, 1, Some("secret".into()));
        assert!(sm.derive_kek(&[0; 16], KeyLength::Aes128).is_some());
        let sm_no_pass = HandshakeSm::new(SrtRole::Caller, 1, None);
        assert!(sm_no_pass.derive_kek(&[0; 16], KeyLength::Aes128).is_none());
    }
}
