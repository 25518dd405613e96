//! Per-peer datapath: frame encryption and framing on the way out, datagram
//! authentication, replay filtering, and TAP delivery on the way in.

use std::fmt;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::{mac, mac_verify, FrameTransform, StreamTransform, KEY_SIZE, S20BS, TAG_SIZE};
use crate::error::TransportError;
use crate::nonce::{put_uvarint, uvarint, NonceCipher, NONCE_SIZE};
use crate::replay::ReplayWindow;
use crate::shaper::cpr_cycle;
use crate::udp::DatagramSink;

/// Size of the plaintext-length field inside the ciphertext.
pub const PKT_SIZE_SIZE: usize = 2;
/// Traffic carried under a single session key before the host must rekey.
pub const MAX_BYTES_PER_KEY: u64 = 1 << 32;
/// Heartbeats per nominal timeout period.
pub const TIMEOUT_HEARTBEAT: u32 = 4;

/// Largest Ethernet frame the tunnel can carry at the given MTU.
///
/// Bounded by the noise-mode payload region and by the two-byte varint
/// length field.
pub fn max_frame_len(mtu: usize) -> usize {
    (mtu - NONCE_SIZE - PKT_SIZE_SIZE).min((1 << 14) - 1)
}

/// Peer identifier bound during the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 16]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Peer configuration handed over by the handshake subsystem.
#[derive(Clone)]
pub struct PeerConf {
    /// Peer identifier
    pub id: PeerId,
    /// Liveness timeout; heartbeats run at a quarter of this
    pub timeout: Duration,
    /// Pad every datagram to full MTU
    pub noise_enable: bool,
    /// Constant packet rate in KiB/s; zero disables shaping
    pub cpr: usize,
    /// Tunnel MTU, fixed for the lifetime of the process
    pub mtu: usize,
}

/// Successful outcomes of [`Peer::pkt_process`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PktOutcome {
    /// Authenticated frame of the given length written to the TAP device
    Delivered(usize),
    /// Authenticated zero-length keep-alive; nothing written
    Heartbeat,
}

/// State for one authenticated remote endpoint.
///
/// A peer is driven by exactly one datapath task: [`Peer::pkt_process`] and
/// [`Peer::eth_process`] share the scratch buffers and nonce counters and
/// must never run concurrently. Counters and timers are public the way the
/// rest of the stack reports them.
pub struct Peer {
    /// Remote transport endpoint, display only
    pub addr: String,
    /// Identity bound during the handshake
    pub id: PeerId,
    conn: Box<dyn DatagramSink>,

    /// Pad every datagram to full MTU (forced on under CPR)
    pub noise_enable: bool,
    /// Configured shaping rate in KiB/s
    pub cpr: usize,
    /// Derived inter-datagram period; zero when shaping is off
    pub cpr_cycle: Duration,
    mtu: usize,

    /// Shared session key; immutable for the life of the peer
    pub key: [u8; KEY_SIZE],
    nonce_cipher: NonceCipher,
    transform: Box<dyn FrameTransform>,
    /// Outbound nonce counter, striding by two from the handshake parity
    pub nonce_our: u64,
    /// Most recently accepted inbound nonce
    pub nonce_recv: u64,
    replay: ReplayWindow,

    /// Heartbeat period (the configured timeout over [`TIMEOUT_HEARTBEAT`],
    /// or the CPR cycle when shaping)
    pub timeout: Duration,
    /// Construction instant
    pub established: Instant,
    /// Last authenticated inbound datagram
    pub last_ping: Instant,
    last_sent: Option<Instant>,

    // Scratch, allocated once per peer to keep the hot path allocation-free.
    buf: Vec<u8>,
    out: Vec<u8>,
    tag: [u8; TAG_SIZE],
    key_auth: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],

    /// Wire bytes received (authenticated datagrams)
    pub bytes_in: u64,
    /// Wire bytes sent
    pub bytes_out: u64,
    /// Plaintext payload bytes delivered to the TAP
    pub bytes_payload_in: u64,
    /// Plaintext payload bytes accepted from the TAP
    pub bytes_payload_out: u64,
    /// Authenticated datagrams received
    pub frames_in: u64,
    /// Datagrams sent
    pub frames_out: u64,
    /// Datagrams dropped on MAC failure
    pub frames_unauth: u64,
    /// Datagrams dropped as replays
    pub frames_dup: u64,
    /// Keep-alives received
    pub heartbeat_recv: u64,
    /// Keep-alives sent
    pub heartbeat_sent: u64,
}

impl Peer {
    /// Build a peer from handshake outputs: the remote address, a ciphertext
    /// sink, configuration, the initial nonce (1 for the initiating side,
    /// 0 for the responding side) and the shared session key.
    pub fn new(
        addr: impl Into<String>,
        conn: Box<dyn DatagramSink>,
        conf: &PeerConf,
        nonce: u64,
        key: &[u8; KEY_SIZE],
    ) -> Self {
        let now = Instant::now();
        let cycle = cpr_cycle(conf.cpr, conf.mtu);
        // Shaping implies indistinguishable datagrams and a heartbeat per
        // cycle; otherwise heartbeats run at a quarter of the timeout.
        let (noise_enable, timeout) = if conf.cpr > 0 {
            (true, cycle)
        } else {
            (conf.noise_enable, conf.timeout / TIMEOUT_HEARTBEAT)
        };
        Self {
            addr: addr.into(),
            id: conf.id,
            conn,
            noise_enable,
            cpr: conf.cpr,
            cpr_cycle: cycle,
            mtu: conf.mtu,
            key: *key,
            nonce_cipher: NonceCipher::new(key),
            transform: Box::new(StreamTransform),
            nonce_our: nonce,
            nonce_recv: 0,
            replay: ReplayWindow::new(),
            timeout,
            established: now,
            last_ping: now,
            last_sent: None,
            buf: vec![0u8; conf.mtu + S20BS],
            out: Vec::with_capacity(conf.mtu + TAG_SIZE),
            tag: [0u8; TAG_SIZE],
            key_auth: [0u8; KEY_SIZE],
            nonce: [0u8; NONCE_SIZE],
            bytes_in: 0,
            bytes_out: 0,
            bytes_payload_in: 0,
            bytes_payload_out: 0,
            frames_in: 0,
            frames_out: 0,
            frames_unauth: 0,
            frames_dup: 0,
            heartbeat_recv: 0,
            heartbeat_sent: 0,
        }
    }

    /// Replace the default stream-cipher transform; alternative
    /// confidentiality modes plug in here.
    pub fn with_transform(mut self, transform: Box<dyn FrameTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Encrypt, authenticate and transmit one Ethernet frame.
    ///
    /// An empty frame is a heartbeat request, honored only when nothing has
    /// been sent for a full timeout period. `ready` releases the shared TAP
    /// read buffer as soon as the frame has been copied out; it is signalled
    /// for non-empty frames only, since a heartbeat never occupied the
    /// buffer.
    pub fn eth_process(&mut self, frame: &[u8], ready: &Sender<()>) -> Result<(), TransportError> {
        let mut now = Instant::now();
        let size = frame.len();
        if size == 0 && !self.heartbeat_due(now) {
            return Ok(());
        }
        if size > max_frame_len(self.mtu) {
            warn!(peer = %self.id, size, mtu = self.mtu, "dropping oversized frame");
            ready.send(()).ok();
            return Ok(());
        }

        self.buf.fill(0);
        if size > 0 {
            self.buf[S20BS + PKT_SIZE_SIZE..S20BS + PKT_SIZE_SIZE + size].copy_from_slice(frame);
            ready.send(()).ok();
            put_uvarint(&mut self.buf[S20BS..S20BS + PKT_SIZE_SIZE], size as u64);
            self.bytes_payload_out += size as u64;
        } else {
            self.heartbeat_sent += 1;
        }

        self.nonce_our += 2;
        self.nonce.fill(0);
        put_uvarint(&mut self.nonce, self.nonce_our);
        self.nonce_cipher.encrypt(&mut self.nonce);

        // The leading S20BS bytes of buf hold pure keystream afterwards;
        // the first KEY_SIZE of them are this datagram's one-time MAC key.
        self.transform.seal(&mut self.buf, &self.nonce, &self.key);
        self.buf[S20BS - NONCE_SIZE..S20BS].copy_from_slice(&self.nonce);
        self.key_auth.copy_from_slice(&self.buf[..KEY_SIZE]);

        let frame_end = if self.noise_enable {
            S20BS - NONCE_SIZE + self.mtu
        } else {
            S20BS + PKT_SIZE_SIZE + size
        };
        let wire = &self.buf[S20BS - NONCE_SIZE..frame_end];
        self.tag = mac(wire, &self.key_auth);

        self.bytes_out += (wire.len() + TAG_SIZE) as u64;
        self.frames_out += 1;

        if self.cpr_cycle > Duration::ZERO {
            if let Some(last) = self.last_sent {
                let will_send = last + self.cpr_cycle;
                if will_send > now {
                    thread::sleep(will_send - now);
                    now = will_send;
                }
            }
        }
        self.last_sent = Some(now);

        self.out.clear();
        self.out.extend_from_slice(wire);
        self.out.extend_from_slice(&self.tag);
        self.conn.send_packet(&self.out)?;
        Ok(())
    }

    /// Authenticate and decrypt one received datagram, writing any carried
    /// frame to `tap`.
    ///
    /// `ready` releases the caller's read buffer and is signalled exactly
    /// once per call: immediately on rejection, otherwise as soon as the
    /// datagram bytes are no longer needed.
    pub fn pkt_process(
        &mut self,
        data: &[u8],
        tap: &mut impl Write,
        ready: &Sender<()>,
    ) -> Result<PktOutcome, TransportError> {
        let size = data.len();
        if size < NONCE_SIZE + TAG_SIZE + PKT_SIZE_SIZE || size > self.mtu + NONCE_SIZE + TAG_SIZE
        {
            ready.send(()).ok();
            self.frames_unauth += 1;
            return Err(TransportError::Malformed(size));
        }
        let ct_end = size - TAG_SIZE;

        self.buf.fill(0);
        self.tag.copy_from_slice(&data[ct_end..]);
        self.buf[S20BS..S20BS + ct_end - NONCE_SIZE].copy_from_slice(&data[NONCE_SIZE..ct_end]);
        let mut wire_nonce = [0u8; NONCE_SIZE];
        wire_nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.transform
            .open(&mut self.buf[..S20BS + ct_end - NONCE_SIZE], &wire_nonce, &self.key);
        self.key_auth.copy_from_slice(&self.buf[..KEY_SIZE]);
        if !mac_verify(&self.tag, &data[..ct_end], &self.key_auth) {
            ready.send(()).ok();
            self.frames_unauth += 1;
            debug!(peer = %self.id, "datagram failed authentication");
            return Err(TransportError::Unauth);
        }

        self.nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.nonce_cipher.decrypt(&mut self.nonce);
        ready.send(()).ok();
        let nonce = uvarint(&self.nonce);
        if !self.replay.check(nonce) {
            self.frames_dup += 1;
            debug!(peer = %self.id, nonce, "duplicate nonce");
            return Err(TransportError::Duplicate(nonce));
        }

        self.frames_in += 1;
        self.bytes_in += size as u64;
        self.last_ping = Instant::now();
        self.nonce_recv = nonce;

        let pkt_size = uvarint(&self.buf[S20BS..S20BS + PKT_SIZE_SIZE]) as usize;
        if pkt_size == 0 {
            self.heartbeat_recv += 1;
            return Ok(PktOutcome::Heartbeat);
        }
        if pkt_size > ct_end - NONCE_SIZE - PKT_SIZE_SIZE {
            // Authenticated yet inconsistent framing: a peer bug, not an attack.
            warn!(peer = %self.id, pkt_size, "length field exceeds ciphertext");
            return Err(TransportError::Malformed(size));
        }
        let frame = &self.buf[S20BS + PKT_SIZE_SIZE..S20BS + PKT_SIZE_SIZE + pkt_size];
        self.bytes_payload_in += pkt_size as u64;
        tap.write_all(frame)?;
        Ok(PktOutcome::Delivered(pkt_size))
    }

    /// True once the per-key traffic budget is spent; the host must zero
    /// this peer and re-run the handshake.
    pub fn rekey_required(&self) -> bool {
        self.bytes_in + self.bytes_out > MAX_BYTES_PER_KEY
    }

    /// Error form of the rekey predicate, for hosts that propagate errors.
    pub fn check_key_budget(&self) -> Result<(), TransportError> {
        if self.rekey_required() {
            Err(TransportError::KeyExhausted)
        } else {
            Ok(())
        }
    }

    /// Scrub key material and scratch buffers. Also runs on drop.
    pub fn zero(&mut self) {
        self.key.zeroize();
        self.key_auth.zeroize();
        self.tag.zeroize();
        self.nonce.zeroize();
        self.buf.zeroize();
        self.out.zeroize();
        self.replay.clear();
    }

    fn heartbeat_due(&self, now: Instant) -> bool {
        self.last_sent.map_or(true, |last| last + self.timeout < now)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.zero();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.addr)
    }
}
