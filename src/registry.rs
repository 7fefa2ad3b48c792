//! The service bundle shared by every connection task, plus the small set
//! of process-wide gauges reported in AYT replies and logs.

use crate::admission::Admission;
use crate::auth::{AttemptLog, Authenticator};
use crate::config::Settings;
use crate::dispatcher::DispatchMsg;
use crate::screen;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct GateStats {
    opened_fd: AtomicUsize,
    ackq_size: AtomicUsize,
    ackq_reuse: AtomicUsize,
    retries: AtomicU32,
}

impl GateStats {
    pub fn inc_opened(&self) {
        self.opened_fd.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_opened(&self) {
        self.opened_fd.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn opened(&self) -> usize {
        self.opened_fd.load(Ordering::Relaxed)
    }

    pub fn set_ackq(&self, size: usize, reuse: usize) {
        self.ackq_size.store(size, Ordering::Relaxed);
        self.ackq_reuse.store(reuse, Ordering::Relaxed);
    }

    pub fn ackq_size(&self) -> usize {
        self.ackq_size.load(Ordering::Relaxed)
    }

    pub fn ackq_reuse(&self) -> usize {
        self.ackq_reuse.load(Ordering::Relaxed)
    }

    pub fn set_retries(&self, n: u32) {
        self.retries.store(n, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Everything a connection task needs, assembled once at startup.
pub struct Registry {
    pub settings: Arc<Settings>,
    pub admission: Arc<Admission>,
    pub auth: Authenticator,
    pub attempts: Arc<dyn AttemptLog>,
    pub dispatch: mpsc::Sender<DispatchMsg>,
    pub stats: Arc<GateStats>,
    /// Unbuffered banner written the moment a connection is accepted.
    pub inscreen: String,
    /// Precomposed userid prompt, sentinels included.
    pub userid_prompt: String,
}

impl Registry {
    pub fn new(
        settings: Arc<Settings>,
        admission: Arc<Admission>,
        auth: Authenticator,
        attempts: Arc<dyn AttemptLog>,
        dispatch: mpsc::Sender<DispatchMsg>,
        stats: Arc<GateStats>,
    ) -> Self {
        let inscreen = screen::inscreen(&settings);
        let userid_prompt = screen::userid_prompt_msg(&settings);
        Self {
            settings,
            admission,
            auth,
            attempts,
            dispatch,
            stats,
            inscreen,
            userid_prompt,
        }
    }
}
