#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use netback_engine::{
    ExecutionModel, HostFrame, HostStack, InterfaceId, InterfaceParams, ManualClock, Netback,
    NetbackConfig,
};
use netback_frontend::Frontend;
use netback_grant::{DomId, SimHypervisor};
use netback_ring::{ExtraInfo, TxFlags, TxResponse};

/// Host stack that keeps every frame and can refuse partial checksums.
pub struct Collector {
    frames: Mutex<Vec<HostFrame>>,
    partial_ok: bool,
}

impl Collector {
    pub fn lock(&self) -> MutexGuard<'_, Vec<HostFrame>> {
        self.frames.lock().unwrap()
    }
}

impl HostStack for Collector {
    fn receive(&self, frame: HostFrame) {
        self.lock().push(frame);
    }

    fn accepts_partial_checksum(&self) -> bool {
        self.partial_ok
    }
}

pub struct Guest {
    pub fe: Frontend,
    pub id: InterfaceId,
}

pub struct Harness {
    pub hv: Arc<SimHypervisor>,
    pub stack: Arc<Collector>,
    pub clock: Arc<ManualClock>,
    pub netback: Netback,
}

pub fn deferred() -> NetbackConfig {
    NetbackConfig {
        execution: ExecutionModel::Deferred,
        ..NetbackConfig::default()
    }
}

impl Harness {
    pub fn new(config: NetbackConfig) -> Self {
        Self::build(config, true)
    }

    /// A host stack that needs every checksum finished before it sees the frame.
    pub fn without_partial_checksums(config: NetbackConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: NetbackConfig, partial_ok: bool) -> Self {
        let hv = Arc::new(SimHypervisor::new());
        let stack = Arc::new(Collector {
            frames: Mutex::new(Vec::new()),
            partial_ok,
        });
        let clock = Arc::new(ManualClock::new());
        let netback = Netback::with_clock(
            config,
            hv.clone(),
            hv.clone(),
            stack.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            hv,
            stack,
            clock,
            netback,
        }
    }

    pub fn connect(&self, domid: DomId) -> Guest {
        self.connect_with(Frontend::new(self.hv.clone(), domid), |_| {})
    }

    pub fn connect_with(&self, fe: Frontend, tweak: impl FnOnce(&mut InterfaceParams)) -> Guest {
        let mut params =
            InterfaceParams::new(fe.domid(), fe.tx_ring_ref(), fe.rx_ring_ref(), fe.port());
        tweak(&mut params);
        let id = self.netback.connect(params).unwrap();
        Guest { fe, id }
    }

    /// Queue one frame, kick the backend and run it to quiescence.
    pub fn send(&self, guest: &mut Guest, data: &[u8], flags: TxFlags, extras: &[ExtraInfo]) -> Vec<u16> {
        let ids = guest.fe.queue_frame(data, flags, extras).unwrap();
        self.kick(guest);
        ids
    }

    pub fn kick(&self, guest: &mut Guest) {
        guest.fe.push_tx();
        self.netback.interrupt(guest.id).unwrap();
        self.run();
    }

    pub fn run(&self) {
        self.netback.run_deferred();
    }

    /// Take every frame the stack holds. Dropping them lets their guest pages go.
    pub fn take_delivered(&self) -> Vec<HostFrame> {
        std::mem::take(&mut *self.stack.lock())
    }

    pub fn held(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn responses(&self, guest: &mut Guest) -> Vec<TxResponse> {
        guest.fe.collect_tx_responses().unwrap()
    }
}

/// An Ethernet/IPv4/TCP frame with `payload` bytes of patterned data and a blank checksum.
pub fn tcp_frame(payload: usize) -> Vec<u8> {
    let ip_len = 20 + 20 + payload;
    let mut f = vec![0u8; 14 + ip_len];
    f[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

    let ip = &mut f[14..34];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
    ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

    let tcp = &mut f[34..54];
    tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
    tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
    tcp[12] = 0x50;

    for (i, byte) in f[54..].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    f
}

/// `len` bytes addressed to `dest`.
pub fn frame_to(dest: [u8; 6], len: usize) -> Vec<u8> {
    let mut f: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    f[0..6].copy_from_slice(&dest);
    f
}
