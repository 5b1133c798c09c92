#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use netback_engine::{
    ExecutionModel, HostFrame, InterfaceId, InterfaceParams, ManualClock, Netback, NetbackConfig,
};
use netback_frontend::Frontend;
use netback_grant::{DomId, SimHypervisor};

pub type Delivered = Mutex<Vec<HostFrame>>;

pub struct Setup {
    pub hv: Arc<SimHypervisor>,
    pub delivered: Arc<Delivered>,
    pub clock: Arc<ManualClock>,
    pub netback: Netback,
}

/// Route engine logs through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn deferred() -> NetbackConfig {
    NetbackConfig {
        execution: ExecutionModel::Deferred,
        ..NetbackConfig::default()
    }
}

pub fn setup(config: NetbackConfig) -> Setup {
    let hv = Arc::new(SimHypervisor::new());
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(ManualClock::new());
    let netback = Netback::with_clock(
        config,
        hv.clone(),
        hv.clone(),
        delivered.clone(),
        clock.clone(),
    )
    .unwrap();
    Setup {
        hv,
        delivered,
        clock,
        netback,
    }
}

impl Setup {
    pub fn guest(&self, domid: DomId) -> (Frontend, InterfaceId) {
        let fe = Frontend::new(self.hv.clone(), domid);
        let params =
            InterfaceParams::new(domid, fe.tx_ring_ref(), fe.rx_ring_ref(), fe.port());
        let id = self.netback.connect(params).unwrap();
        (fe, id)
    }

    pub fn kick(&self, fe: &mut Frontend, id: InterfaceId) {
        fe.push_tx();
        self.netback.interrupt(id).unwrap();
        self.netback.run_deferred();
    }

    pub fn take_delivered(&self) -> Vec<HostFrame> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }

    pub fn held(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

/// `len` bytes of patterned data addressed to a unicast MAC.
pub fn frame(len: usize, seed: u8) -> Vec<u8> {
    let mut f: Vec<u8> = (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect();
    f[0..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x10]);
    f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x20]);
    f
}
