//! Per-connection ARQ state machine.
//!
//! A [`Connection`] owns one reliable, ordered byte stream between the local
//! endpoint and one peer conversation. It buffers application writes,
//! fragments them into segments, manages the sliding send/receive windows,
//! derives the retransmission timeout from observed round-trips, and reacts
//! to loss through the embedded congestion controller.
//!
//! The connection performs no I/O of its own: inbound datagrams are pushed
//! through [`Connection::input`], the periodic clock through
//! [`Connection::update`], and everything outbound leaves through the
//! injected [`OutputSink`].

pub mod congestion;
pub mod rtt;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::segment::{Cmd, DecodeError, Segment, HEADER_LEN};
use crate::sink::OutputSink;
use crate::telemetry;
use congestion::CongestionCtl;
use rtt::RttEstimator;

/// Initial wait before probing a zero remote window.
const PROBE_INIT_MS: u32 = 7_000;
/// Ceiling for the exponential probe backoff.
const PROBE_LIMIT_MS: u32 = 120_000;
/// Hard cap on fragments per message (`frg` is one byte); the effective
/// limit is the smaller of this and `rcv_wnd - 1`, since the receiver can
/// only hold a complete run narrower than its window.
const MAX_FRAGMENTS: usize = 255;

/// Wrapping difference for sequence numbers and millisecond timestamps,
/// both of which live modulo 2^32.
pub(crate) fn wrapping_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Error types for [`Connection::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Local backpressure; recoverable by retrying after acks drain the queue.
    #[error("send queue full: {queued} bytes queued, cap {cap}")]
    QueueFull { queued: usize, cap: usize },

    /// The fragment run would exceed what the receive window can deliver.
    #[error("message of {len} bytes spans {fragments} fragments, wider than the window")]
    Oversize { len: usize, fragments: usize },

    #[error("connection closed")]
    Closed,
}

/// Error types for [`Connection::input`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// Stale or foreign traffic; the datagram was discarded.
    #[error("wrong conversation id: expected {expected}, got {got}")]
    WrongConversationId { expected: u32, got: u32 },

    /// At least one segment failed to decode. Well-formed segments in the
    /// same datagram were still processed.
    #[error("malformed segment: {0}")]
    Malformed(#[from] DecodeError),

    #[error("connection closed")]
    Closed,
}

/// Connection lifecycle. `Closed` is terminal and irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, nothing valid received yet.
    Idle,
    /// Exchanging data.
    Established,
    /// Close requested; draining pending acks for a grace period.
    Closing,
    /// Terminal.
    Closed,
}

/// One segment sitting in the send window.
#[derive(Debug)]
struct FlightEntry {
    seg: Segment,
    /// Retransmit when `now` reaches this timestamp.
    resend_at: u32,
    /// Per-entry RTO, backed off on every timer-driven retransmit.
    rto: u32,
    /// How many later-sequenced segments were acked past this one.
    fastack: u32,
    /// Transmission count; 0 means not yet on the wire.
    xmit: u32,
}

impl FlightEntry {
    fn new(seg: Segment) -> Self {
        Self {
            seg,
            resend_at: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }
}

/// Point-in-time counters for telemetry and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub srtt: u32,
    pub rto: u32,
    pub cwnd: u32,
    pub inflight: u32,
    pub snd_queue: usize,
    pub rcv_queue: usize,
    pub retransmissions: u64,
}

/// One reliable, ordered stream to a single peer conversation.
pub struct Connection {
    conv: u32,
    peer: SocketAddr,
    cfg: ProtocolConfig,
    mss: usize,
    state: ConnState,

    snd_queue: VecDeque<Segment>,
    snd_queue_bytes: usize,
    snd_buf: VecDeque<FlightEntry>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    /// Peer's advertised receive window, in segments.
    rmt_wnd: u16,
    probe_ask: bool,
    probe_tell: bool,
    ts_probe: u32,
    probe_wait: u32,

    /// (sn, ts) pairs awaiting a standalone ack flush.
    acks: Vec<(u32, u32)>,
    rtt: RttEstimator,
    cong: CongestionCtl,

    last_active: u32,
    close_at: Option<u32>,
    dead: bool,
    retransmissions: u64,

    sink: Arc<dyn OutputSink>,
}

impl Connection {
    /// Create a connection in `Idle` state.
    ///
    /// The caller must have validated `cfg`; `now` seeds the idle clock.
    pub fn new(
        conv: u32,
        peer: SocketAddr,
        cfg: ProtocolConfig,
        sink: Arc<dyn OutputSink>,
        now: u32,
    ) -> Self {
        let mss = cfg.mss();
        let rtt = RttEstimator::new(cfg.rto_floor(), cfg.rto_max_ms, cfg.interval_ms);
        let cong = CongestionCtl::new(!cfg.nc, mss as u32, cfg.snd_wnd as u32);
        Self {
            conv,
            peer,
            cfg,
            mss,
            state: ConnState::Idle,
            snd_queue: VecDeque::new(),
            snd_queue_bytes: 0,
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rmt_wnd: 32,
            probe_ask: false,
            probe_tell: false,
            ts_probe: 0,
            probe_wait: 0,
            acks: Vec::new(),
            rtt,
            cong,
            last_active: now,
            close_at: None,
            dead: false,
            retransmissions: 0,
            sink,
        }
    }

    /// Locally initiate the conversation: `Idle` becomes `Established`
    /// without waiting for inbound traffic.
    pub fn open(&mut self) {
        if self.state == ConnState::Idle {
            self.state = ConnState::Established;
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// True once an in-flight segment exceeded the retransmit budget.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Milliseconds since the last inbound activity.
    pub fn idle_for(&self, now: u32) -> u32 {
        now.wrapping_sub(self.last_active)
    }

    /// Bytes buffered but not yet admitted to the send window.
    pub fn waiting_send_bytes(&self) -> usize {
        self.snd_queue_bytes
    }

    pub fn stats(&self) -> ConnStats {
        ConnStats {
            srtt: self.rtt.srtt(),
            rto: self.rtt.rto(),
            cwnd: self.cong.cwnd(),
            inflight: wrapping_diff(self.snd_nxt, self.snd_una) as u32,
            snd_queue: self.snd_queue.len(),
            rcv_queue: self.rcv_queue.len(),
            retransmissions: self.retransmissions,
        }
    }

    /// Queue `data` for transmission, fragmenting as needed.
    ///
    /// Buffers only; segments reach the wire on the next [`update`]
    /// (or sooner under `nodelay`). [`SendError::QueueFull`] is the
    /// backpressure signal; callers retry once acks drain the queue.
    ///
    /// A message is refused as [`SendError::Oversize`] when its fragment
    /// run would not fit the receive window: the receiver cannot deliver
    /// a run wider than `rcv_wnd` segments, so admitting one would wedge
    /// the stream.
    ///
    /// [`update`]: Connection::update
    pub fn send(&mut self, data: Bytes) -> Result<(), SendError> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Err(SendError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        let fragments = data.len().div_ceil(self.mss);
        if fragments > MAX_FRAGMENTS || fragments >= self.cfg.rcv_wnd as usize {
            return Err(SendError::Oversize {
                len: data.len(),
                fragments,
            });
        }
        if self.snd_queue_bytes + data.len() > self.cfg.send_queue_cap {
            return Err(SendError::QueueFull {
                queued: self.snd_queue_bytes,
                cap: self.cfg.send_queue_cap,
            });
        }
        self.snd_queue_bytes += data.len();
        for i in 0..fragments {
            let off = i * self.mss;
            let end = (off + self.mss).min(data.len());
            self.snd_queue.push_back(Segment {
                conv: self.conv,
                cmd: Cmd::Push,
                frg: (fragments - 1 - i) as u8,
                wnd: 0,
                ts: 0,
                sn: 0,
                una: 0,
                data: data.slice(off..end),
            });
        }
        Ok(())
    }

    /// Process one inbound datagram of packed segments.
    ///
    /// Malformed input never crashes or poisons the connection: bad
    /// segments are dropped (counted, reported in the result) and the
    /// rest of the datagram is still processed where framing allows.
    pub fn input(&mut self, datagram: Bytes, now: u32) -> Result<(), InputError> {
        if matches!(self.state, ConnState::Closing | ConnState::Closed) {
            return Err(InputError::Closed);
        }
        let mut buf = datagram;
        let prev_una = self.snd_una;
        let mut maxack: Option<u32> = None;
        let mut malformed: Option<DecodeError> = None;

        while buf.len() >= HEADER_LEN {
            let seg = match Segment::decode(&mut buf, self.mss) {
                Ok(seg) => seg,
                Err(e @ DecodeError::Truncated { .. }) => {
                    telemetry::record_malformed();
                    malformed.get_or_insert(e);
                    buf.clear();
                    break;
                }
                Err(e) => {
                    // segment consumed; keep going with the rest
                    telemetry::record_malformed();
                    malformed.get_or_insert(e);
                    continue;
                }
            };
            if seg.conv != self.conv {
                telemetry::record_conv_reject();
                return Err(InputError::WrongConversationId {
                    expected: self.conv,
                    got: seg.conv,
                });
            }
            if self.state == ConnState::Idle {
                self.state = ConnState::Established;
            }
            telemetry::record_segment_in();
            self.last_active = now;
            self.rmt_wnd = seg.wnd;
            self.retire_below(seg.una);
            self.refresh_snd_una();

            match seg.cmd {
                Cmd::Ack => {
                    if let Some(xmit) = self.ack_one(seg.sn) {
                        if xmit <= 1 && wrapping_diff(now, seg.ts) >= 0 {
                            self.rtt.sample(now.wrapping_sub(seg.ts));
                        }
                    }
                    self.refresh_snd_una();
                    maxack = Some(match maxack {
                        Some(m) if wrapping_diff(seg.sn, m) <= 0 => m,
                        _ => seg.sn,
                    });
                    trace!(
                        target: "ruda::conn",
                        conv = self.conv,
                        sn = seg.sn,
                        srtt = self.rtt.srtt(),
                        "ack"
                    );
                }
                Cmd::Push => {
                    let wnd_end = self.rcv_nxt.wrapping_add(self.cfg.rcv_wnd as u32);
                    if wrapping_diff(seg.sn, wnd_end) < 0 {
                        self.acks.push((seg.sn, seg.ts));
                        if wrapping_diff(seg.sn, self.rcv_nxt) >= 0 {
                            self.push_rcv(seg);
                        } else {
                            telemetry::record_duplicate();
                        }
                    }
                    // beyond the window: drop silently, the sender outran us
                }
                Cmd::WndAsk => {
                    self.probe_tell = true;
                }
                Cmd::WndTell => {
                    // window already taken from the header
                }
            }
        }

        if !buf.is_empty() {
            telemetry::record_malformed();
            malformed.get_or_insert(DecodeError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        if let Some(maxack) = maxack {
            self.bump_fastack(maxack);
        }
        if wrapping_diff(self.snd_una, prev_una) > 0 {
            self.cong.on_ack(self.rmt_wnd as u32);
        }
        match malformed {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Pop one fully reassembled message, if any. Non-blocking.
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.peek_size()?;
        let was_full = self.rcv_queue.len() >= self.cfg.rcv_wnd as usize;

        let mut out = BytesMut::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            let last = seg.frg == 0;
            out.extend_from_slice(&seg.data);
            if last {
                break;
            }
        }
        self.slide_rcv();
        if was_full && self.rcv_queue.len() < self.cfg.rcv_wnd as usize {
            // window reopened; let the peer know without waiting for a probe
            self.probe_tell = true;
        }
        Some(out.freeze())
    }

    /// Request close. Pending acks drain for one RTO, then the connection
    /// turns `Closed` and releases its buffers.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Closed | ConnState::Closing => {}
            _ => {
                debug!(target: "ruda::conn", conv = self.conv, peer = %self.peer, "closing");
                self.state = ConnState::Closing;
                self.snd_queue.clear();
                self.snd_queue_bytes = 0;
            }
        }
    }

    /// The periodic tick: flush acks, probe zero windows, move queued data
    /// into the send window, transmit and retransmit.
    pub fn update(&mut self, now: u32) {
        match self.state {
            ConnState::Closed => {}
            ConnState::Closing => {
                let close_at = *self.close_at.get_or_insert_with(|| {
                    let grace = self.rtt.rto().max(self.cfg.interval_ms);
                    now.wrapping_add(grace)
                });
                self.flush(now);
                if wrapping_diff(now, close_at) >= 0 {
                    self.finish_close();
                }
            }
            _ => self.flush(now),
        }
    }

    fn finish_close(&mut self) {
        self.state = ConnState::Closed;
        self.snd_queue.clear();
        self.snd_queue_bytes = 0;
        self.snd_buf.clear();
        self.rcv_buf.clear();
        self.rcv_queue.clear();
        self.acks.clear();
    }

    fn flush(&mut self, now: u32) {
        if self.state == ConnState::Idle {
            return;
        }
        let wnd = self.wnd_unused();
        let mut batch = BytesMut::with_capacity(self.cfg.mtu);

        // acks ride ahead of everything else in the datagram
        let mut ack = Segment::control(self.conv, Cmd::Ack, wnd, self.rcv_nxt);
        for (sn, ts) in std::mem::take(&mut self.acks) {
            ack.sn = sn;
            ack.ts = ts;
            Self::pack(&*self.sink, self.peer, &mut batch, &ack, self.cfg.mtu);
        }

        if self.state == ConnState::Closing {
            Self::emit(&*self.sink, self.peer, &mut batch);
            return;
        }

        // a zero remote window stalls the stream until a probe reopens it
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT_MS;
                self.ts_probe = now.wrapping_add(self.probe_wait);
            } else if wrapping_diff(now, self.ts_probe) >= 0 {
                self.probe_wait = self.probe_wait.max(PROBE_INIT_MS);
                self.probe_wait += self.probe_wait / 2;
                self.probe_wait = self.probe_wait.min(PROBE_LIMIT_MS);
                self.ts_probe = now.wrapping_add(self.probe_wait);
                self.probe_ask = true;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
        if self.probe_ask {
            let seg = Segment::control(self.conv, Cmd::WndAsk, wnd, self.rcv_nxt);
            Self::pack(&*self.sink, self.peer, &mut batch, &seg, self.cfg.mtu);
            self.probe_ask = false;
        }
        if self.probe_tell {
            let seg = Segment::control(self.conv, Cmd::WndTell, wnd, self.rcv_nxt);
            Self::pack(&*self.sink, self.peer, &mut batch, &seg, self.cfg.mtu);
            self.probe_tell = false;
        }

        // move queued fragments into the send window as budget allows
        let mut budget = (self.cfg.snd_wnd as u32).min(self.rmt_wnd as u32);
        if let Some(cwnd) = self.cong.window() {
            budget = budget.min(cwnd);
        }
        while wrapping_diff(self.snd_nxt, self.snd_una.wrapping_add(budget)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            self.snd_queue_bytes -= seg.data.len();
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(FlightEntry::new(seg));
        }

        // transmit fresh entries, retransmit timed-out or skipped ones
        let resend_thresh = self.cfg.resend;
        let rto_grace = if self.cfg.nodelay {
            0
        } else {
            self.rtt.rto() >> 3
        };
        let mut lost = false;
        let mut fast_change = false;
        for entry in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if entry.xmit == 0 {
                needsend = true;
                entry.rto = self.rtt.rto();
                entry.resend_at = now.wrapping_add(entry.rto + rto_grace);
            } else if wrapping_diff(now, entry.resend_at) >= 0 {
                needsend = true;
                let step = if self.cfg.nodelay {
                    entry.rto / 2
                } else {
                    entry.rto.max(self.rtt.rto())
                };
                entry.rto = (entry.rto + step).min(self.cfg.rto_max_ms);
                entry.resend_at = now.wrapping_add(entry.rto);
                lost = true;
                self.retransmissions += 1;
                telemetry::record_retransmit();
                trace!(
                    target: "ruda::conn",
                    conv = self.conv,
                    sn = entry.seg.sn,
                    xmit = entry.xmit,
                    rto = entry.rto,
                    "timeout resend"
                );
            } else if resend_thresh > 0 && entry.fastack >= resend_thresh {
                needsend = true;
                entry.fastack = 0;
                entry.resend_at = now.wrapping_add(entry.rto);
                fast_change = true;
                self.retransmissions += 1;
                telemetry::record_fast_resend();
                trace!(
                    target: "ruda::conn",
                    conv = self.conv,
                    sn = entry.seg.sn,
                    "fast resend"
                );
            }
            if needsend {
                entry.xmit += 1;
                entry.seg.ts = now;
                entry.seg.wnd = wnd;
                entry.seg.una = self.rcv_nxt;
                Self::pack(&*self.sink, self.peer, &mut batch, &entry.seg, self.cfg.mtu);
                if entry.xmit >= self.cfg.dead_link {
                    self.dead = true;
                }
            }
        }
        Self::emit(&*self.sink, self.peer, &mut batch);

        let inflight = wrapping_diff(self.snd_nxt, self.snd_una) as u32;
        if fast_change {
            self.cong.on_fast_resend(inflight, resend_thresh);
        }
        if lost {
            self.cong.on_timeout();
        }
    }

    /// Append `seg` to the outgoing batch, emitting a datagram first when
    /// the segment would not fit within the MTU.
    fn pack(
        sink: &dyn OutputSink,
        peer: SocketAddr,
        batch: &mut BytesMut,
        seg: &Segment,
        mtu: usize,
    ) {
        if !batch.is_empty() && batch.len() + seg.wire_len() > mtu {
            Self::emit(sink, peer, batch);
        }
        seg.encode(batch);
        telemetry::record_segment_out();
    }

    fn emit(sink: &dyn OutputSink, peer: SocketAddr, batch: &mut BytesMut) {
        if batch.is_empty() {
            return;
        }
        let datagram = batch.split().freeze();
        telemetry::record_datagram_out(datagram.len());
        trace!(
            target: "ruda::datagram_dump",
            direction = "tx",
            peer = %peer,
            len = datagram.len(),
            hex = %hex::encode(&datagram),
            "tx"
        );
        sink.send_datagram(datagram, peer);
    }

    /// Unused local receive window, in segments.
    fn wnd_unused(&self) -> u16 {
        self.cfg.rcv_wnd.saturating_sub(self.rcv_queue.len() as u16)
    }

    /// Retire send-window entries covered by the cumulative ack.
    fn retire_below(&mut self, una: u32) {
        while let Some(front) = self.snd_buf.front() {
            if wrapping_diff(front.seg.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn refresh_snd_una(&mut self) {
        self.snd_una = self
            .snd_buf
            .front()
            .map(|e| e.seg.sn)
            .unwrap_or(self.snd_nxt);
    }

    /// Remove the entry acked by `sn`; returns its transmission count.
    fn ack_one(&mut self, sn: u32) -> Option<u32> {
        if wrapping_diff(sn, self.snd_una) < 0 || wrapping_diff(sn, self.snd_nxt) >= 0 {
            return None;
        }
        let pos = self.snd_buf.iter().position(|e| e.seg.sn == sn)?;
        let entry = self.snd_buf.remove(pos)?;
        Some(entry.xmit)
    }

    /// Count ack skips for entries below the highest acked sequence number.
    fn bump_fastack(&mut self, maxack: u32) {
        for entry in self.snd_buf.iter_mut() {
            if wrapping_diff(entry.seg.sn, maxack) < 0 {
                entry.fastack += 1;
            } else {
                break;
            }
        }
    }

    /// Insert a data segment into the out-of-order receive window,
    /// dropping duplicates, then slide contiguous runs forward.
    fn push_rcv(&mut self, seg: Segment) {
        let sn = seg.sn;
        let mut idx = self.rcv_buf.len();
        let mut dup = false;
        while idx > 0 {
            let d = wrapping_diff(sn, self.rcv_buf[idx - 1].sn);
            if d == 0 {
                dup = true;
                break;
            }
            if d > 0 {
                break;
            }
            idx -= 1;
        }
        if dup {
            telemetry::record_duplicate();
            return;
        }
        self.rcv_buf.insert(idx, seg);
        self.slide_rcv();
    }

    /// Move contiguous segments from the receive window into the ordered
    /// delivery queue while queue capacity remains.
    fn slide_rcv(&mut self) {
        while let Some(front) = self.rcv_buf.front() {
            if front.sn != self.rcv_nxt || self.rcv_queue.len() >= self.cfg.rcv_wnd as usize {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    /// Byte size of the next complete message, or `None` while a fragment
    /// is still missing.
    fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.data.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }
}
