//! TAP interface sharing: one device reader per interface name, fanned out
//! to consumers through a rendezvous handshake, with periodic heartbeat
//! ticks injected into the frame stream.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::peer::TIMEOUT_HEARTBEAT;
use crate::shaper::cpr_cycle;

/// Handle to an open TAP device.
///
/// The device reader task behind it must obey the rendezvous contract: wait
/// for one `arm` signal, read the next frame into its (reused) MTU-sized
/// buffer, deliver it on `frames`, repeat. The buffer may only be
/// overwritten after the next `arm`.
pub struct Tap {
    frames: Receiver<Vec<u8>>,
    arm: Sender<()>,
    synced: AtomicBool,
}

impl Tap {
    /// Wrap a device reader's channel pair.
    pub fn new(frames: Receiver<Vec<u8>>, arm: Sender<()>) -> Self {
        Self {
            frames,
            arm,
            synced: AtomicBool::new(false),
        }
    }
}

/// Per-consumer channel bundle returned by [`TapRegistry::listen`].
pub struct TapListener {
    /// Frames from the device; an empty frame is a heartbeat tick.
    pub sink: Receiver<Vec<u8>>,
    /// Release of the shared read buffer, one signal per non-empty frame.
    pub ready: Sender<()>,
    /// Stops the multiplexer (sending or dropping both work).
    pub terminate: Sender<()>,
}

type TapOpener = dyn Fn(&str) -> io::Result<Tap> + Send + Sync;

/// Table of open TAP devices, at most one reader per interface name.
///
/// The opener is injected so the OS-specific device code stays outside the
/// core; construct one registry at startup and share it.
pub struct TapRegistry {
    taps: Mutex<HashMap<String, Arc<Tap>>>,
    open: Box<TapOpener>,
}

impl TapRegistry {
    /// Create a registry around a device opener.
    pub fn new(open: impl Fn(&str) -> io::Result<Tap> + Send + Sync + 'static) -> Self {
        Self {
            taps: Mutex::new(HashMap::new()),
            open: Box::new(open),
        }
    }

    /// Attach a consumer to `iface`, opening the device on first use.
    ///
    /// Spawns the multiplexer task and arms the device for its first read.
    /// When the device already exists and is parked awaiting a release, the
    /// initial signal takes the skip path instead, so the device is not
    /// armed twice.
    pub fn listen(
        &self,
        iface: &str,
        timeout: Duration,
        cpr: usize,
        mtu: usize,
    ) -> io::Result<TapListener> {
        let (tap, existed) = {
            let mut taps = self.taps.lock();
            match taps.get(iface) {
                Some(tap) => (tap.clone(), true),
                None => {
                    let tap = Arc::new((self.open)(iface)?);
                    taps.insert(iface.to_string(), tap.clone());
                    (tap, false)
                }
            }
        };

        let (sink_tx, sink_rx) = bounded(0);
        let (ready_tx, ready_rx) = bounded::<()>(0);
        let (terminate_tx, terminate_rx) = bounded::<()>(0);
        let (skip_tx, skip_rx) = bounded::<()>(1);

        let period = heartbeat_period(timeout, cpr, mtu);
        info!(iface, ?period, "tap listener attached");
        {
            let tap = tap.clone();
            // The multiplexer keeps a skip sender alive so the channel never
            // disconnects after the attach signal below.
            let keep_skip = skip_tx.clone();
            thread::spawn(move || {
                multiplex(tap, sink_tx, ready_rx, terminate_rx, skip_rx, period);
                drop(keep_skip);
            });
        }

        if existed && tap.synced.load(Ordering::SeqCst) {
            skip_tx.send(()).ok();
        } else {
            ready_tx.send(()).ok();
        }

        Ok(TapListener {
            sink: sink_rx,
            ready: ready_tx,
            terminate: terminate_tx,
        })
    }
}

/// Heartbeat period: the CPR cycle when shaping, otherwise a quarter of the
/// timeout.
fn heartbeat_period(timeout: Duration, cpr: usize, mtu: usize) -> Duration {
    let cycle = cpr_cycle(cpr, mtu);
    if cycle > Duration::ZERO {
        cycle
    } else {
        timeout / TIMEOUT_HEARTBEAT
    }
}

/// One consumer's multiplexer loop.
///
/// Alternates between awaiting the consumer's release (arming the device
/// once received) and forwarding the next device frame. Heartbeat ticks are
/// counted whenever they fire and delivered as empty frames as soon as the
/// consumer is receiving; the pending send runs inside the select so a tick
/// can never wedge the loop against a consumer that is mid-release.
fn multiplex(
    tap: Arc<Tap>,
    sink: Sender<Vec<u8>>,
    ready: Receiver<()>,
    terminate: Receiver<()>,
    skip: Receiver<()>,
    period: Duration,
) {
    let heartbeat = tick(period);
    let frames = &tap.frames;
    let mut pending: usize = 0;
    'listen: loop {
        // Wait for the consumer to release the previous frame.
        loop {
            if pending > 0 {
                select! {
                    recv(terminate) -> _ => break 'listen,
                    recv(heartbeat) -> _ => pending += 1,
                    send(sink, Vec::new()) -> res => {
                        if res.is_err() {
                            break 'listen;
                        }
                        pending -= 1;
                    }
                    recv(skip) -> msg => {
                        if msg.is_err() {
                            break 'listen;
                        }
                        break;
                    }
                    recv(ready) -> msg => {
                        if msg.is_err() || tap.arm.send(()).is_err() {
                            break 'listen;
                        }
                        tap.synced.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            } else {
                select! {
                    recv(terminate) -> _ => break 'listen,
                    recv(heartbeat) -> _ => pending += 1,
                    recv(skip) -> msg => {
                        if msg.is_err() {
                            break 'listen;
                        }
                        break;
                    }
                    recv(ready) -> msg => {
                        if msg.is_err() || tap.arm.send(()).is_err() {
                            break 'listen;
                        }
                        tap.synced.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        // Forward the next device frame, still serving heartbeat ticks.
        loop {
            if pending > 0 {
                select! {
                    recv(terminate) -> _ => break 'listen,
                    recv(heartbeat) -> _ => pending += 1,
                    send(sink, Vec::new()) -> res => {
                        if res.is_err() {
                            break 'listen;
                        }
                        pending -= 1;
                    }
                    recv(frames) -> frame => {
                        let Ok(frame) = frame else { break 'listen };
                        tap.synced.store(false, Ordering::SeqCst);
                        if sink.send(frame).is_err() {
                            break 'listen;
                        }
                        break;
                    }
                }
            } else {
                select! {
                    recv(terminate) -> _ => break 'listen,
                    recv(heartbeat) -> _ => pending += 1,
                    recv(frames) -> frame => {
                        let Ok(frame) = frame else { break 'listen };
                        tap.synced.store(false, Ordering::SeqCst);
                        if sink.send(frame).is_err() {
                            break 'listen;
                        }
                        break;
                    }
                }
            }
        }
    }
    debug!("tap multiplexer stopped");
}
