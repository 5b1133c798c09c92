//! Ring of simulated guests exchanging traffic through a [`Bridge`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use netback_engine::{ExecutionModel, InterfaceId, InterfaceParams, Netback, NetbackConfig};
use netback_frontend::{Frontend, FrontendError};
use netback_grant::{DomId, SimHypervisor, SimStats};
use netback_ring::TxFlags;

use crate::{ethernet_frame, guest_mac, Bridge, BridgeStats};

/// Frames a guest may have in flight towards its peer.
const WINDOW: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOptions {
    pub guests: usize,
    /// Unicast frames each guest sends to the next one.
    pub frames_per_guest: usize,
    pub timeout: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            guests: 3,
            frames_per_guest: 64,
            timeout: Duration::from_secs(30),
        }
    }
}

impl SimOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut opts = Self::default();
        if let Ok(raw) = std::env::var("NETBACK_SIM_GUESTS") {
            opts.guests = raw
                .trim()
                .parse()
                .with_context(|| format!("NETBACK_SIM_GUESTS={raw}"))?;
        }
        if let Ok(raw) = std::env::var("NETBACK_SIM_FRAMES") {
            opts.frames_per_guest = raw
                .trim()
                .parse()
                .with_context(|| format!("NETBACK_SIM_FRAMES={raw}"))?;
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
    pub sent: u64,
    pub received: u64,
    /// Unicast frames whose bytes differed from what the peer sent.
    pub corrupt: u64,
    /// Unicast copies that reached a guest they were not addressed to.
    pub strays: u64,
    pub tx_dropped: u64,
    pub rx_dropped: u64,
    pub bridge: BridgeStats,
    pub hypervisor: SimStats,
    pub elapsed: Duration,
}

struct SimGuest {
    fe: Frontend,
    id: InterfaceId,
    mac: [u8; 6],
    peer: [u8; 6],
    announced: bool,
    sent: usize,
    /// Unicast frames received from the previous guest.
    received: usize,
    broadcasts: usize,
    strays: u64,
    corrupt: u64,
}

/// Payload length of the `n`th frame, spanning one to a few pages.
fn frame_len(n: usize) -> usize {
    60 + (n * 997) % 5000
}

/// The `n`th frame `from` sends to `to`.
pub fn sim_frame(to: [u8; 6], from: [u8; 6], n: usize) -> Vec<u8> {
    ethernet_frame(to, from, frame_len(n), n as u8)
}

/// Connect `options.guests` guests in a ring, have each send `frames_per_guest` unicast frames
/// to its successor after announcing itself with one broadcast, and run until every frame has
/// arrived.
pub fn run(config: NetbackConfig, options: &SimOptions) -> anyhow::Result<SimReport> {
    if options.guests < 2 {
        bail!("need at least two guests, got {}", options.guests);
    }
    let guest_count =
        DomId::try_from(options.guests).context("too many guests for domain ids")?;

    let deferred = config.execution == ExecutionModel::Deferred;
    let hv = Arc::new(SimHypervisor::new());
    let bridge = Arc::new(Bridge::new());
    let netback = Netback::new(config, hv.clone(), hv.clone(), bridge.clone())?;

    let mut guests = Vec::with_capacity(options.guests);
    for domid in 1..=guest_count {
        let fe = Frontend::new(hv.clone(), domid);
        let params = InterfaceParams::new(domid, fe.tx_ring_ref(), fe.rx_ring_ref(), fe.port());
        let id = netback
            .connect(params)
            .with_context(|| format!("connecting domain {domid}"))?;
        let peer = domid % guest_count + 1;
        guests.push(SimGuest {
            fe,
            id,
            mac: guest_mac(domid),
            peer: guest_mac(peer),
            announced: false,
            sent: 0,
            received: 0,
            broadcasts: 0,
            strays: 0,
            corrupt: 0,
        });
    }
    tracing::info!(guests = guests.len(), frames = options.frames_per_guest, "simulation started");

    let started = Instant::now();
    let deadline = started + options.timeout;
    let expected = options.frames_per_guest;
    loop {
        for i in 0..guests.len() {
            let acked = guests[(i + 1) % guests.len()].received;
            let guest = &mut guests[i];
            let mut kicked = send_some(guest, acked, expected)?;
            guest.fe.collect_tx_responses()?;

            if guest.fe.post_rx_buffers(usize::MAX) > 0 {
                guest.fe.push_rx();
                kicked = true;
            }
            if kicked {
                netback.interrupt(guest.id)?;
            }
        }

        if deferred {
            netback.run_deferred();
        }
        bridge.forward(&netback);
        if deferred {
            netback.run_deferred();
        }

        for i in 0..guests.len() {
            let from = guests[(i + guests.len() - 1) % guests.len()].mac;
            receive(&mut guests[i], from)?;
        }

        let done = guests
            .iter()
            .all(|g| g.received == expected && g.broadcasts == guests.len() - 1);
        if done {
            break;
        }
        if Instant::now() >= deadline {
            let received: usize = guests.iter().map(|g| g.received).sum();
            bail!(
                "timed out with {received} of {} frames delivered",
                expected * guests.len()
            );
        }
        if !deferred && !bridge.wait(Duration::from_millis(1)) {
            std::thread::yield_now();
        }
    }

    let mut report = SimReport {
        sent: 0,
        received: 0,
        corrupt: 0,
        strays: 0,
        tx_dropped: 0,
        rx_dropped: 0,
        bridge: bridge.stats(),
        hypervisor: SimStats::default(),
        elapsed: started.elapsed(),
    };
    for guest in &guests {
        report.sent += guest.sent as u64;
        report.received += guest.received as u64;
        report.corrupt += guest.corrupt;
        report.strays += guest.strays;
        if let Some(stats) = netback.stats(guest.id) {
            report.tx_dropped += stats.tx_dropped;
            report.rx_dropped += stats.rx_dropped;
        }
    }

    for guest in &guests {
        netback.disconnect(guest.id)?;
        bridge.forget(guest.id);
    }
    netback.shutdown();
    report.hypervisor = hv.stats();
    Ok(report)
}

/// Queue what the window allows. Returns whether anything was published.
fn send_some(guest: &mut SimGuest, acked: usize, expected: usize) -> anyhow::Result<bool> {
    let mut queued = false;
    if !guest.announced {
        let hello = ethernet_frame([0xff; 6], guest.mac, 60, 0);
        match guest.fe.queue_frame(&hello, TxFlags::empty(), &[]) {
            Ok(_) => {
                guest.announced = true;
                queued = true;
            }
            Err(FrontendError::RingFull { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
    }
    while guest.sent < expected && guest.sent < acked + WINDOW {
        let frame = sim_frame(guest.peer, guest.mac, guest.sent);
        match guest.fe.queue_frame(&frame, TxFlags::empty(), &[]) {
            Ok(_) => {
                guest.sent += 1;
                queued = true;
            }
            Err(FrontendError::RingFull { .. }) => break,
            Err(err) => return Err(err.into()),
        }
    }
    if queued {
        guest.fe.push_tx();
    }
    Ok(queued)
}

fn receive(guest: &mut SimGuest, from: [u8; 6]) -> anyhow::Result<()> {
    for frame in guest.fe.collect_rx()? {
        if frame.error.is_some() {
            tracing::warn!(domain = ?guest.mac, "frame arrived with an error status");
            guest.corrupt += 1;
            continue;
        }
        if frame.data.len() < 14 {
            guest.corrupt += 1;
            continue;
        }
        if frame.data[0..6] == [0xff; 6] {
            guest.broadcasts += 1;
            continue;
        }
        if frame.data[0..6] != guest.mac {
            // Flooded before the bridge learned where the peer lives.
            guest.strays += 1;
            continue;
        }
        if frame.data != sim_frame(guest.mac, from, guest.received) {
            guest.corrupt += 1;
        }
        guest.received += 1;
    }
    Ok(())
}
