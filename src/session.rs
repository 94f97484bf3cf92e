//! Session engine: handshake state machine, nonce discipline and the
//! outbound/inbound pipelines.
//!
//! One [`NadeSession`] owns all transport state for a single call between
//! two peers. Any mix of capture/playback/network/control threads may call
//! the entry points concurrently: the session record sits behind one mutex,
//! each ring behind its own, and a lock on the session record is never held
//! while waiting on anything but a single ring.

use crate::codec::{self, AdpcmState};
use crate::config::NadeConfig;
use crate::crypto::{self, NadeIdentity, NONCE_LEN, TAG_LEN};
use crate::error::{NadeError, Result};
use crate::frame::{
    self, FrameKind, PlainPayload, HANDSHAKE_PAYLOAD_LEN, HANGUP_TYPE, HEADER_LEN,
    KEEPALIVE_TYPE, MAX_FRAME_BODY,
};
use crate::modem::{FskConfig, FskModem};
use crate::rings::Ring;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

/// Samples per audio frame: 40 ms at 8 kHz.
pub const AUDIO_FRAME_SAMPLES: usize = 320;

const MIC_CAPACITY: usize = 65536;
const SPK_CAPACITY: usize = 65536;
const OUT_CAPACITY: usize = 262_144;
const IN_CAPACITY: usize = 262_144;
const FSK_MOD_CAPACITY: usize = 32_768;
const FSK_DEMOD_CAPACITY: usize = 8192;

const HANDSHAKE_RESEND_MS: u64 = 500;
const KEEPALIVE_INTERVAL_MS: u64 = 1000;

const HANDSHAKE_VERSION: u8 = 1;
const CAP_SENDS_ENCRYPT: u8 = 0x01;
const CAP_ACCEPTS_ENCRYPT: u8 = 0x02;

const HKDF_SALT: &[u8] = b"NADEv1";
const HKDF_INFO: &[u8] = b"NADE_SESS";

/// Which side of the call we are; breaks the tie for DH ordering and
/// key/nonce slot assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server = 1,
    Client = 2,
}

/// Handshake progress. `Acknowledged` is terminal while the session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HandshakePhase {
    Idle,
    /// Ephemeral key generated, announcing ourselves to the peer.
    Ready,
    /// Peer keys received, transport keys derived on our side.
    KeysDerived,
    /// The peer proved it derived the same keys by sending a frame we
    /// could authenticate.
    Acknowledged,
}

struct SessionState {
    active: bool,
    phase: HandshakePhase,
    role: Option<Role>,
    config: NadeConfig,
    expected_peer_static: Option<[u8; 32]>,
    peer_static: [u8; 32],
    peer_eph: [u8; 32],
    eph_priv: [u8; 32],
    eph_pub: [u8; 32],
    tx_key: [u8; 32],
    rx_key: [u8; 32],
    tx_nonce_base: [u8; NONCE_LEN],
    rx_nonce_base: [u8; NONCE_LEN],
    tx_counter: u64,
    rx_counter: u64,
    audio_seq: u16,
    peer_accepts_encrypt: bool,
    peer_sends_encrypt: bool,
    outbound_encrypted: bool,
    inbound_encrypted: bool,
    remote_hangup: bool,
    last_handshake_ms: u64,
    last_keepalive_ms: u64,
    enc_state: AdpcmState,
    dec_state: AdpcmState,
}

impl SessionState {
    fn new(config: NadeConfig) -> Self {
        Self {
            active: false,
            phase: HandshakePhase::Idle,
            role: None,
            config,
            expected_peer_static: None,
            peer_static: [0; 32],
            peer_eph: [0; 32],
            eph_priv: [0; 32],
            eph_pub: [0; 32],
            tx_key: [0; 32],
            rx_key: [0; 32],
            tx_nonce_base: [0; NONCE_LEN],
            rx_nonce_base: [0; NONCE_LEN],
            tx_counter: 0,
            rx_counter: 0,
            audio_seq: 0,
            peer_accepts_encrypt: false,
            peer_sends_encrypt: false,
            outbound_encrypted: false,
            inbound_encrypted: false,
            remote_hangup: false,
            last_handshake_ms: 0,
            last_keepalive_ms: 0,
            enc_state: AdpcmState::default(),
            dec_state: AdpcmState::default(),
        }
    }

    /// Wipe everything except the configured options. Key material is
    /// zeroised, not just overwritten by the compiler's leftovers.
    fn reset(&mut self) {
        self.eph_priv.zeroize();
        self.tx_key.zeroize();
        self.rx_key.zeroize();
        self.tx_nonce_base.zeroize();
        self.rx_nonce_base.zeroize();
        let config = self.config;
        *self = Self::new(config);
    }

    fn keys_derived(&self) -> bool {
        self.phase >= HandshakePhase::KeysDerived
    }
}

/// One peer-to-peer secure voice session.
///
/// Construct with a long-lived identity, then drive it from the host's
/// audio and network threads. The identity survives `stop_session`; all
/// other state is per-call.
pub struct NadeSession {
    identity: NadeIdentity,
    epoch: Instant,
    state: Mutex<SessionState>,
    mic: Mutex<Ring<i16>>,
    spk: Mutex<Ring<i16>>,
    outgoing: Mutex<Ring<u8>>,
    incoming: Mutex<Ring<u8>>,
    fsk: Mutex<FskModem>,
    fsk_mod: Mutex<Ring<i16>>,
    fsk_demod: Mutex<Ring<u8>>,
}

impl NadeSession {
    pub fn new(identity: NadeIdentity) -> Self {
        Self::with_fsk_config(identity, FskConfig::default())
    }

    pub fn with_fsk_config(identity: NadeIdentity, fsk_config: FskConfig) -> Self {
        Self {
            identity,
            epoch: Instant::now(),
            state: Mutex::new(SessionState::new(NadeConfig::default())),
            mic: Mutex::new(Ring::new(MIC_CAPACITY)),
            spk: Mutex::new(Ring::new(SPK_CAPACITY)),
            outgoing: Mutex::new(Ring::new(OUT_CAPACITY)),
            incoming: Mutex::new(Ring::new(IN_CAPACITY)),
            fsk: Mutex::new(FskModem::new(fsk_config)),
            fsk_mod: Mutex::new(Ring::new(FSK_MOD_CAPACITY)),
            fsk_demod: Mutex::new(Ring::new(FSK_DEMOD_CAPACITY)),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public_key()
    }

    pub fn config(&self) -> NadeConfig {
        self.state.lock().config
    }

    /// Replace the session options. Encryption flags take effect on the
    /// next frame in each direction; the FSK modem is reset when freshly
    /// enabled so no partial symbol leaks between calls.
    pub fn set_config(&self, config: NadeConfig) {
        let fsk_was_enabled;
        {
            let mut st = self.state.lock();
            fsk_was_enabled = st.config.fsk_enabled;
            st.config = config;
            st.outbound_encrypted = config.encrypt && st.peer_accepts_encrypt;
            st.inbound_encrypted = config.decrypt && st.peer_sends_encrypt;
        }
        if config.fsk_enabled && !fsk_was_enabled {
            self.reset_fsk();
        }
    }

    pub fn start_session_client(&self, pinned_peer: Option<[u8; 32]>) -> Result<()> {
        self.start_session(Role::Client, pinned_peer)
    }

    pub fn start_session_server(&self, pinned_peer: Option<[u8; 32]>) -> Result<()> {
        self.start_session(Role::Server, pinned_peer)
    }

    fn start_session(&self, role: Role, pinned_peer: Option<[u8; 32]>) -> Result<()> {
        let now = self.now_ms();
        {
            let mut st = self.state.lock();
            st.reset();
            st.role = Some(role);
            st.expected_peer_static = pinned_peer.filter(|key| key.iter().any(|&b| b != 0));
            let mut eph = [0u8; 32];
            if crypto::random_bytes(&mut eph).is_err() {
                warn!("no entropy for ephemeral key, session not started");
                return Err(NadeError::EntropyFailure);
            }
            st.eph_priv = crypto::clamp_scalar(eph);
            eph.zeroize();
            st.eph_pub = crypto::derive_public(&st.eph_priv);
            st.active = true;
            st.phase = HandshakePhase::Ready;
            st.last_handshake_ms = 0;
            st.last_keepalive_ms = now;
            st.outbound_encrypted = st.config.encrypt;
            st.inbound_encrypted = st.config.decrypt;
        }
        self.clear_transport_rings();
        self.reset_fsk();
        info!(?role, "session started");
        Ok(())
    }

    pub fn stop_session(&self) {
        self.state.lock().reset();
        self.clear_transport_rings();
        self.reset_fsk();
    }

    /// True once the peer has authenticated a frame we sealed with the
    /// derived keys (handshake acknowledged).
    pub fn is_established(&self) -> bool {
        self.state.lock().phase == HandshakePhase::Acknowledged
    }

    /// Negotiated `(outbound, inbound)` encryption, for host call UI.
    /// Either side is true only when our options and the peer's advertised
    /// capabilities both allow that direction to be sealed.
    pub fn encryption_state(&self) -> (bool, bool) {
        let st = self.state.lock();
        (st.outbound_encrypted, st.inbound_encrypted)
    }

    /// Queue captured microphone PCM for the outbound pipeline.
    pub fn feed_mic(&self, pcm: &[i16]) -> Result<()> {
        if pcm.is_empty() {
            return Err(NadeError::BadArgument("empty mic frame"));
        }
        if !self.state.lock().active {
            return Err(NadeError::NoSession);
        }
        self.mic.lock().push(pcm);
        Ok(())
    }

    /// Pop decoded speaker PCM; returns the number of samples written.
    pub fn pull_speaker(&self, out: &mut [i16]) -> usize {
        self.spk.lock().pop(out)
    }

    /// Run the outbound pipeline, then copy up to `out.len()` wire bytes.
    pub fn generate_outgoing(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        {
            let mut st = self.state.lock();
            if st.active {
                self.build_outgoing(&mut st);
            }
        }
        self.outgoing.lock().pop(out)
    }

    /// Append received wire bytes and parse every complete frame.
    pub fn handle_incoming(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(NadeError::BadArgument("empty incoming buffer"));
        }
        if !self.state.lock().active {
            return Err(NadeError::NoSession);
        }
        self.incoming.lock().push(data);
        let mut st = self.state.lock();
        self.process_incoming(&mut st);
        Ok(())
    }

    /// Flush pending output and queue an unencrypted hangup frame so it is
    /// visible to the peer even mid-handshake.
    pub fn send_hangup(&self) -> Result<()> {
        let st = self.state.lock();
        if !st.active {
            return Err(NadeError::NoSession);
        }
        info!("queueing hangup");
        self.outgoing.lock().clear();
        self.queue_control(HANGUP_TYPE);
        Ok(())
    }

    /// Read and clear the remote-hangup observation.
    pub fn consume_remote_hangup(&self) -> bool {
        let mut st = self.state.lock();
        std::mem::take(&mut st.remote_hangup)
    }

    // ---------------------------------------------------------------------
    // Outbound pipeline

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn build_outgoing(&self, st: &mut SessionState) {
        if st.phase != HandshakePhase::Acknowledged {
            self.queue_handshake(st);
            if !st.keys_derived() {
                return;
            }
        }
        self.queue_audio_frames(st);
        let now = self.now_ms();
        if now.saturating_sub(st.last_keepalive_ms) > KEEPALIVE_INTERVAL_MS {
            self.queue_control(KEEPALIVE_TYPE);
            st.last_keepalive_ms = now;
        }
    }

    fn queue_frame(&self, kind: FrameKind, body: &[u8]) {
        let mut out = self.outgoing.lock();
        out.push(&frame::encode_header(kind, body.len() as u16));
        out.push(body);
    }

    fn queue_control(&self, subtype: u8) {
        self.queue_frame(FrameKind::Control, &[subtype]);
    }

    fn queue_handshake(&self, st: &mut SessionState) {
        if st.phase < HandshakePhase::Ready {
            return;
        }
        let now = self.now_ms();
        if st.last_handshake_ms != 0 && now - st.last_handshake_ms < HANDSHAKE_RESEND_MS {
            return;
        }
        let role = match st.role {
            Some(role) => role,
            None => return,
        };
        let mut payload = [0u8; HANDSHAKE_PAYLOAD_LEN];
        payload[0] = HANDSHAKE_VERSION;
        payload[1] = role as u8;
        if st.config.encrypt {
            payload[2] |= CAP_SENDS_ENCRYPT;
        }
        if st.config.decrypt {
            payload[2] |= CAP_ACCEPTS_ENCRYPT;
        }
        let static_pub = self.identity.public_key();
        payload[4..36].copy_from_slice(&st.eph_pub);
        payload[36..68].copy_from_slice(&static_pub);
        payload[68..84].copy_from_slice(&crypto::sha256_prefix16(&static_pub));
        self.queue_frame(FrameKind::Handshake, &payload);
        st.last_handshake_ms = now;
        debug!(role = ?st.role, phase = ?st.phase, "queued handshake frame");
    }

    fn queue_audio_frames(&self, st: &mut SessionState) {
        let mut pcm = [0i16; AUDIO_FRAME_SAMPLES];
        loop {
            {
                let mut mic = self.mic.lock();
                if mic.len() < AUDIO_FRAME_SAMPLES {
                    break;
                }
                mic.pop(&mut pcm);
            }
            let adpcm = codec::encode_block(&pcm, &mut st.enc_state);
            if adpcm.is_empty() {
                break;
            }
            let seq = st.audio_seq;
            st.audio_seq = st.audio_seq.wrapping_add(1);
            let plain = frame::encode_audio(seq, AUDIO_FRAME_SAMPLES as u16, &adpcm);
            if plain.len() > MAX_FRAME_BODY - TAG_LEN {
                break;
            }
            if st.outbound_encrypted && st.keys_derived() {
                let nonce = crypto::compose_nonce(&st.tx_nonce_base, st.tx_counter);
                st.tx_counter += 1;
                match crypto::aead_seal(&st.tx_key, &nonce, &[], &plain) {
                    Ok(sealed) => self.queue_frame(FrameKind::Cipher, &sealed),
                    Err(_) => break,
                }
            } else {
                self.queue_frame(FrameKind::Plaintext, &plain);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Inbound pipeline

    fn process_incoming(&self, st: &mut SessionState) {
        loop {
            let mut header = [0u8; HEADER_LEN];
            let body_len;
            let mut body;
            {
                let mut incoming = self.incoming.lock();
                if !incoming.peek(&mut header) {
                    break;
                }
                body_len = u16::from_le_bytes([header[1], header[2]]) as usize;
                if incoming.len() < HEADER_LEN + body_len {
                    break;
                }
                incoming.drop_front(HEADER_LEN);
                if body_len > MAX_FRAME_BODY {
                    incoming.drop_front(body_len);
                    debug!(body_len, "dropped oversize frame");
                    continue;
                }
                body = vec![0u8; body_len];
                incoming.pop(&mut body);
            }
            match FrameKind::try_from(header[0]) {
                Ok(FrameKind::Handshake) => self.handle_handshake(st, &body),
                Ok(FrameKind::Cipher) => self.handle_sealed(st, &body, true),
                Ok(FrameKind::Plaintext) => self.handle_sealed(st, &body, false),
                Ok(FrameKind::Control) => self.handle_control(st, &body),
                Err(_) => debug!(kind = header[0], "dropped frame of unknown kind"),
            }
        }
    }

    fn handle_handshake(&self, st: &mut SessionState, payload: &[u8]) {
        if payload.len() < HANDSHAKE_PAYLOAD_LEN || payload[0] != HANDSHAKE_VERSION {
            debug!(len = payload.len(), "ignoring malformed handshake");
            return;
        }
        if st.phase != HandshakePhase::Ready {
            // Keys are derived once per session; peer resends carry the
            // same ephemeral and can be dropped without re-deriving, which
            // would rewind the nonce counters.
            debug!(phase = ?st.phase, "ignoring handshake resend");
            return;
        }
        let capabilities = payload[2];
        st.peer_eph.copy_from_slice(&payload[4..36]);
        st.peer_static.copy_from_slice(&payload[36..68]);
        st.peer_sends_encrypt = capabilities & CAP_SENDS_ENCRYPT != 0;
        st.peer_accepts_encrypt = capabilities & CAP_ACCEPTS_ENCRYPT != 0;
        st.outbound_encrypted = st.config.encrypt && st.peer_accepts_encrypt;
        st.inbound_encrypted = st.config.decrypt && st.peer_sends_encrypt;
        if let Some(expected) = st.expected_peer_static {
            if expected != st.peer_static {
                warn!("peer static key does not match pinned key, aborting handshake");
                return;
            }
        }
        match self.derive_keys(st) {
            Ok(()) => {
                st.phase = HandshakePhase::KeysDerived;
                // Answer right away so the peer can finish too.
                self.queue_handshake(st);
                debug!(role = ?st.role, "transport keys derived");
            }
            Err(err) => warn!(%err, "key derivation failed"),
        }
    }

    /// Triadic DH: material is `ee || eS || sE` in client order, so both
    /// sides feed HKDF the identical byte string.
    fn derive_keys(&self, st: &mut SessionState) -> Result<()> {
        let role = st.role.ok_or(NadeError::NoSession)?;
        let dh_ee = crypto::x25519(&st.eph_priv, &st.peer_eph)?;
        let dh_static_eph = self.identity.diffie_hellman(&st.peer_eph)?;
        let dh_eph_static = crypto::x25519(&st.eph_priv, &st.peer_static)?;
        let mut material = [0u8; 96];
        material[..32].copy_from_slice(&dh_ee);
        match role {
            // Client: eS = our ephemeral x peer static, sE = our static x peer ephemeral.
            Role::Client => {
                material[32..64].copy_from_slice(&dh_eph_static);
                material[64..].copy_from_slice(&dh_static_eph);
            }
            // Server sees the same two points from the other side.
            Role::Server => {
                material[32..64].copy_from_slice(&dh_static_eph);
                material[64..].copy_from_slice(&dh_eph_static);
            }
        }
        let mut derived = crypto::hkdf_sha256(&material, HKDF_SALT, HKDF_INFO, 96)?;
        material.zeroize();
        let (client_half, server_half) = {
            let mut client_key = [0u8; 32];
            let mut server_key = [0u8; 32];
            let mut client_nonce = [0u8; NONCE_LEN];
            let mut server_nonce = [0u8; NONCE_LEN];
            client_key.copy_from_slice(&derived[..32]);
            server_key.copy_from_slice(&derived[32..64]);
            client_nonce.copy_from_slice(&derived[64..76]);
            server_nonce.copy_from_slice(&derived[76..88]);
            ((client_key, client_nonce), (server_key, server_nonce))
        };
        derived.zeroize();
        let ((tx_key, tx_nonce), (rx_key, rx_nonce)) = match role {
            Role::Client => (client_half, server_half),
            Role::Server => (server_half, client_half),
        };
        st.tx_key = tx_key;
        st.rx_key = rx_key;
        st.tx_nonce_base = tx_nonce;
        st.rx_nonce_base = rx_nonce;
        st.tx_counter = 0;
        st.rx_counter = 0;
        st.audio_seq = 0;
        st.enc_state.reset();
        st.dec_state.reset();
        Ok(())
    }

    fn handle_sealed(&self, st: &mut SessionState, body: &[u8], encrypted: bool) {
        if !st.keys_derived() {
            return;
        }
        let opened;
        let plain: &[u8] = if encrypted {
            if body.len() <= TAG_LEN {
                debug!(len = body.len(), "cipher frame too short");
                return;
            }
            let nonce = crypto::compose_nonce(&st.rx_nonce_base, st.rx_counter);
            // The counter stays advanced even when authentication fails;
            // rolling it back would desynchronise us from the sender.
            st.rx_counter += 1;
            match crypto::aead_open(&st.rx_key, &nonce, &[], body) {
                Ok(decrypted) => {
                    if st.phase == HandshakePhase::KeysDerived {
                        st.phase = HandshakePhase::Acknowledged;
                        debug!(role = ?st.role, "handshake acknowledged by authenticated frame");
                    }
                    opened = decrypted;
                    &opened
                }
                Err(_) => {
                    warn!(counter = st.rx_counter - 1, "failed to authenticate frame");
                    return;
                }
            }
        } else {
            body
        };
        match frame::parse_plain(plain) {
            Ok(PlainPayload::Audio { header, adpcm }) => self.handle_audio(st, header.samples, adpcm),
            Ok(PlainPayload::Keepalive) => st.last_keepalive_ms = self.now_ms(),
            Ok(PlainPayload::Hangup) => self.note_remote_hangup(st),
            Err(_) => debug!("dropped payload of unknown subtype"),
        }
    }

    fn handle_audio(&self, st: &mut SessionState, samples: u16, adpcm: &[u8]) {
        // Frames claiming more than one audio frame of samples are truncated.
        let max = (samples as usize).min(AUDIO_FRAME_SAMPLES);
        let decoded = codec::decode_block(adpcm, max, &mut st.dec_state);
        if !decoded.is_empty() {
            self.spk.lock().push(&decoded);
        }
    }

    fn handle_control(&self, st: &mut SessionState, body: &[u8]) {
        match body.first() {
            Some(&KEEPALIVE_TYPE) => st.last_keepalive_ms = self.now_ms(),
            Some(&HANGUP_TYPE) => self.note_remote_hangup(st),
            _ => debug!("dropped control frame of unknown subtype"),
        }
    }

    fn note_remote_hangup(&self, st: &mut SessionState) {
        if !st.remote_hangup {
            info!("remote hangup received");
        }
        st.remote_hangup = true;
    }

    fn clear_transport_rings(&self) {
        self.mic.lock().clear();
        self.spk.lock().clear();
        self.outgoing.lock().clear();
        self.incoming.lock().clear();
    }

    // ---------------------------------------------------------------------
    // Optional 4-FSK audio transport

    fn reset_fsk(&self) {
        self.fsk.lock().reset();
        self.fsk_mod.lock().clear();
        self.fsk_demod.lock().clear();
    }

    fn fsk_enabled(&self) -> bool {
        self.state.lock().config.fsk_enabled
    }

    /// Modulate wire bytes into PCM tones, staged through the modulator
    /// ring. Bytes that do not fit `pcm_out` whole are left unmodulated.
    pub fn fsk_modulate(&self, data: &[u8], pcm_out: &mut [i16]) -> usize {
        if data.is_empty() || pcm_out.is_empty() || !self.fsk_enabled() {
            return 0;
        }
        let mut modem = self.fsk.lock();
        let samples_per_byte = modem.config().samples_for_bytes(1);
        let mut staged = Vec::with_capacity(samples_per_byte);
        let mut produced = 0usize;
        for &byte in data {
            if produced + samples_per_byte > pcm_out.len() {
                break;
            }
            staged.clear();
            modem.modulate_byte(byte, &mut staged);
            let mut ring = self.fsk_mod.lock();
            ring.push(&staged);
            produced += ring.pop(&mut pcm_out[produced..produced + samples_per_byte]);
        }
        produced
    }

    /// Feed received PCM into the demodulator; completed bytes land in the
    /// demodulated ring.
    pub fn fsk_feed_audio(&self, pcm: &[i16]) -> Result<()> {
        if pcm.is_empty() {
            return Err(NadeError::BadArgument("empty pcm buffer"));
        }
        if !self.fsk_enabled() {
            return Err(NadeError::BadArgument("fsk disabled"));
        }
        let bytes = self.fsk.lock().demodulate(pcm);
        if !bytes.is_empty() {
            self.fsk_demod.lock().push(&bytes);
        }
        Ok(())
    }

    /// Pop demodulated wire bytes.
    pub fn fsk_pull_demodulated(&self, out: &mut [u8]) -> usize {
        self.fsk_demod.lock().pop(out)
    }

    /// PCM samples `fsk_modulate` produces for `byte_count` bytes.
    pub fn fsk_samples_for_bytes(&self, byte_count: usize) -> usize {
        self.fsk.lock().config().samples_for_bytes(byte_count)
    }
}
