use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

pub(crate) const TELEMETRY_ENV: &str = "RUDA_TELEMETRY";
pub(crate) const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

static DATAGRAMS_IN: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_OUT: AtomicU64 = AtomicU64::new(0);
static DATAGRAM_BYTES_IN: AtomicU64 = AtomicU64::new(0);
static DATAGRAM_BYTES_OUT: AtomicU64 = AtomicU64::new(0);
static SEGMENTS_IN: AtomicU64 = AtomicU64::new(0);
static SEGMENTS_OUT: AtomicU64 = AtomicU64::new(0);
static RETRANSMISSIONS: AtomicU64 = AtomicU64::new(0);
static FAST_RESENDS: AtomicU64 = AtomicU64::new(0);
static DUPLICATES: AtomicU64 = AtomicU64::new(0);
static MALFORMED: AtomicU64 = AtomicU64::new(0);
static CONV_REJECTS: AtomicU64 = AtomicU64::new(0);
static QUEUE_DROPS: AtomicU64 = AtomicU64::new(0);
static EVICTED: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Default, Debug, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub datagram_bytes_in: u64,
    pub datagram_bytes_out: u64,
    pub segments_in: u64,
    pub segments_out: u64,
    pub retransmissions: u64,
    pub fast_resends: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub conv_rejects: u64,
    pub queue_drops: u64,
    pub evicted: u64,
    pub active_sessions: u64,
}

impl Snapshot {
    pub(crate) fn delta(self, prev: Self) -> Self {
        Self {
            datagrams_in: self.datagrams_in.saturating_sub(prev.datagrams_in),
            datagrams_out: self.datagrams_out.saturating_sub(prev.datagrams_out),
            datagram_bytes_in: self
                .datagram_bytes_in
                .saturating_sub(prev.datagram_bytes_in),
            datagram_bytes_out: self
                .datagram_bytes_out
                .saturating_sub(prev.datagram_bytes_out),
            segments_in: self.segments_in.saturating_sub(prev.segments_in),
            segments_out: self.segments_out.saturating_sub(prev.segments_out),
            retransmissions: self.retransmissions.saturating_sub(prev.retransmissions),
            fast_resends: self.fast_resends.saturating_sub(prev.fast_resends),
            duplicates: self.duplicates.saturating_sub(prev.duplicates),
            malformed: self.malformed.saturating_sub(prev.malformed),
            conv_rejects: self.conv_rejects.saturating_sub(prev.conv_rejects),
            queue_drops: self.queue_drops.saturating_sub(prev.queue_drops),
            evicted: self.evicted.saturating_sub(prev.evicted),
            // gauge, not a counter
            active_sessions: self.active_sessions,
        }
    }
}

pub(crate) fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        let res = std::env::var(TELEMETRY_ENV)
            .ok()
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                _ => false,
            })
            .unwrap_or(true);
        tracing::info!(enabled = res, "Telemetry status initialized");
        res
    })
}

pub(crate) fn record_datagram_in(bytes: usize) {
    if !enabled() {
        return;
    }
    DATAGRAMS_IN.fetch_add(1, Ordering::Relaxed);
    DATAGRAM_BYTES_IN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_datagram_out(bytes: usize) {
    if !enabled() {
        return;
    }
    DATAGRAMS_OUT.fetch_add(1, Ordering::Relaxed);
    DATAGRAM_BYTES_OUT.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_segment_in() {
    if !enabled() {
        return;
    }
    SEGMENTS_IN.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_segment_out() {
    if !enabled() {
        return;
    }
    SEGMENTS_OUT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_retransmit() {
    if !enabled() {
        return;
    }
    RETRANSMISSIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_fast_resend() {
    if !enabled() {
        return;
    }
    FAST_RESENDS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_duplicate() {
    if !enabled() {
        return;
    }
    DUPLICATES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_malformed() {
    if !enabled() {
        return;
    }
    tracing::trace!("record_malformed");
    MALFORMED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conv_reject() {
    if !enabled() {
        return;
    }
    tracing::trace!("record_conv_reject");
    CONV_REJECTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_queue_drop() {
    if !enabled() {
        return;
    }
    tracing::trace!("record_queue_drop");
    QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_evicted() {
    if !enabled() {
        return;
    }
    EVICTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_open() {
    tracing::debug!("record_session_open");
    ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_close() {
    tracing::debug!("record_session_close");
    ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        datagrams_in: DATAGRAMS_IN.load(Ordering::Relaxed),
        datagrams_out: DATAGRAMS_OUT.load(Ordering::Relaxed),
        datagram_bytes_in: DATAGRAM_BYTES_IN.load(Ordering::Relaxed),
        datagram_bytes_out: DATAGRAM_BYTES_OUT.load(Ordering::Relaxed),
        segments_in: SEGMENTS_IN.load(Ordering::Relaxed),
        segments_out: SEGMENTS_OUT.load(Ordering::Relaxed),
        retransmissions: RETRANSMISSIONS.load(Ordering::Relaxed),
        fast_resends: FAST_RESENDS.load(Ordering::Relaxed),
        duplicates: DUPLICATES.load(Ordering::Relaxed),
        malformed: MALFORMED.load(Ordering::Relaxed),
        conv_rejects: CONV_REJECTS.load(Ordering::Relaxed),
        queue_drops: QUEUE_DROPS.load(Ordering::Relaxed),
        evicted: EVICTED.load(Ordering::Relaxed),
        active_sessions: ACTIVE_SESSIONS.load(Ordering::Relaxed),
    }
}

/// Spawn the once-per-process logger task that emits per-second deltas.
/// Subsequent calls are no-ops.
pub fn start_logger() {
    static STARTED: OnceLock<()> = OnceLock::new();
    STARTED.get_or_init(|| {
        if !enabled() {
            return;
        }
        tokio::spawn(async move {
            let mut prev = snapshot();
            let mut ticker = tokio::time::interval(TELEMETRY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let cur = snapshot();
                let d = cur.delta(prev);
                prev = cur;
                tracing::info!(
                    datagrams_in = d.datagrams_in,
                    datagrams_out = d.datagrams_out,
                    bytes_in = d.datagram_bytes_in,
                    bytes_out = d.datagram_bytes_out,
                    segments_in = d.segments_in,
                    segments_out = d.segments_out,
                    retransmissions = d.retransmissions,
                    fast_resends = d.fast_resends,
                    duplicates = d.duplicates,
                    malformed = d.malformed,
                    conv_rejects = d.conv_rejects,
                    queue_drops = d.queue_drops,
                    evicted = d.evicted,
                    active_sessions = d.active_sessions,
                    "ruda_telemetry"
                );
            }
        });
    });
}
