//! Shared state handed to every connection task.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::doh::DohResolver;
use crate::logsink::LogFanout;
use crate::mock::MockEngine;
use crate::store::RequestStore;

pub struct ProxyState {
    pub config: Config,
    pub ca: CertificateAuthority,
    pub mock: MockEngine,
    pub doh: Option<DohResolver>,
    pub logs: LogFanout,
    pub store: Option<RequestStore>,
    conn_counter: AtomicU64,
}

impl ProxyState {
    pub fn new(
        config: Config,
        ca: CertificateAuthority,
        mock: MockEngine,
        doh: Option<DohResolver>,
        logs: LogFanout,
        store: Option<RequestStore>,
    ) -> Self {
        Self {
            config,
            ca,
            mock,
            doh,
            logs,
            store,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst)
    }
}
