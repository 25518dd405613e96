//! Datagram transport plumbing: the ciphertext sink abstraction and the
//! per-peer UDP reader task.

use std::io;
use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use crate::crypto::TAG_SIZE;
use crate::nonce::NONCE_SIZE;

/// Write sink for ciphertext datagrams; in practice a connected UDP socket.
pub trait DatagramSink: Send {
    /// Hand one datagram to the transport.
    fn send_packet(&mut self, datagram: &[u8]) -> io::Result<()>;
}

impl DatagramSink for UdpSocket {
    fn send_packet(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram).map(|_| ())
    }
}

/// Channel-backed sink, used by test harnesses and in-process pipelines.
impl DatagramSink for Sender<Vec<u8>> {
    fn send_packet(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram channel closed"))
    }
}

/// Spawn the per-peer UDP reader.
///
/// Delivers `Some(datagram)` for each received packet and `None` whenever the
/// one-second read deadline expires, so the host loop can tick its timeout
/// counter. Every delivery must be released with one `ready` signal before
/// the reader performs its next read; the initial read is armed here.
pub fn udp_listen(socket: UdpSocket, mtu: usize) -> io::Result<(Receiver<Option<Vec<u8>>>, Sender<()>)> {
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;
    let (sink_tx, sink_rx) = bounded(0);
    let (ready_tx, ready_rx) = bounded::<()>(0);
    let arm = ready_tx.clone();
    thread::spawn(move || {
        let mut buf = vec![0u8; mtu + NONCE_SIZE + TAG_SIZE];
        loop {
            if ready_rx.recv().is_err() {
                break;
            }
            let delivery = match socket.recv(&mut buf) {
                Ok(n) => Some(buf[..n].to_vec()),
                Err(e) => {
                    // Deadline expiry and transient faults alike surface as
                    // the sentinel; the host decides when enough is enough.
                    trace!(error = %e, "udp read");
                    None
                }
            };
            if sink_tx.send(delivery).is_err() {
                break;
            }
        }
    });
    arm.send(())
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "udp reader exited"))?;
    Ok((sink_rx, ready_tx))
}
