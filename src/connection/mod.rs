//! The per-connection state machine (C6): recv parsing, sliding-window
//! sequencing, timers, and ASDU dispatch. Grounded on `original_source`'s
//! `MasterConnection`/`handleMessage`/`handleTimeouts`; the lock-per-queue
//! plus lock-per-connection concurrency shape and the tick-driven dispatch
//! loop follow `maminrayej-handshake`'s `segment_loop` and
//! `tcp::tcb::TCB::on_tick`/`on_segment`.

pub mod kbuffer;

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace, warn};

use crate::apci::{self, Frame};
use crate::asdu::{self, cot, type_id, AsduView};
use crate::config::{ApciParameters, AppLayerParameters, ServerMode};
use crate::error::{Error, Result};
use crate::facade::ConnectionFacade;
use crate::handler::{AsduHandler, ConnectionEventHandler, HandlerResult};
use crate::redundancy::RedundancyGroup;
use crate::time::{elapsed_ms, now_ms};

use kbuffer::{KBuffer, KEntry};

fn wrapping_inc(seq: u16) -> u16 {
    ((seq as u32 + 1) % 32768) as u16
}

/// Read-select budget used when a connection has no outbound ASDUs
/// waiting: threaded mode's "100 ms" idle poll (SPEC_FULL.md §4.8).
pub(crate) const IDLE_POLL_MS: u64 = 100;
/// Read-select budget used by tick mode unconditionally, and by threaded
/// mode whenever this connection has ASDUs waiting to transmit
/// (SPEC_FULL.md §4.8).
pub(crate) const FAST_POLL_MS: u64 = 1;

struct ConnState {
    stream: TcpStream,
    recv_buf: Vec<u8>,
    is_active: bool,
    is_running: bool,
    send_count: u16,
    receive_count: u16,
    unconfirmed_recv: u16,
    last_confirmation_time_ms: u64,
    t2_triggered: bool,
    outstanding_testfr: u8,
    next_t3_deadline_ms: u64,
    kbuf: KBuffer,
}

/// Holds every connection currently accepted by the server, used to
/// implement the activation-exclusivity policy and `CONNECTION_IS_GROUP`
/// fan-out without `Connection` needing to know about `Server` internals
/// beyond this shared list.
pub type ConnectionRegistry = Arc<Mutex<Vec<Arc<Connection>>>>;

pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    apci: ApciParameters,
    app_layer: AppLayerParameters,
    mode: ServerMode,
    group_index: usize,
    pub(crate) group: Arc<RedundancyGroup>,
    registry: ConnectionRegistry,
    asdu_handler: Arc<dyn AsduHandler>,
    event_handler: Arc<dyn ConnectionEventHandler>,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        apci: ApciParameters,
        app_layer: AppLayerParameters,
        mode: ServerMode,
        group_index: usize,
        group: Arc<RedundancyGroup>,
        registry: ConnectionRegistry,
        asdu_handler: Arc<dyn AsduHandler>,
        event_handler: Arc<dyn ConnectionEventHandler>,
    ) -> Result<Arc<Self>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(std::time::Duration::from_millis(IDLE_POLL_MS)))?;

        let now = now_ms();
        let conn = Connection {
            id,
            peer_addr,
            apci,
            app_layer,
            mode,
            group_index,
            group,
            registry,
            asdu_handler,
            event_handler,
            state: Mutex::new(ConnState {
                stream,
                recv_buf: Vec::with_capacity(512),
                is_active: false,
                is_running: true,
                send_count: 0,
                receive_count: 0,
                unconfirmed_recv: 0,
                last_confirmation_time_ms: now,
                t2_triggered: false,
                outstanding_testfr: 0,
                next_t3_deadline_ms: now + apci.t3 as u64 * 1000,
                kbuf: KBuffer::new(apci.k),
            }),
        };
        Ok(Arc::new(conn))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn app_layer_parameters(&self) -> AppLayerParameters {
        self.app_layer
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().is_active
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_running
    }

    pub fn request_close(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_running = false;
    }

    fn facade(self: &Arc<Self>) -> ConnectionFacade {
        ConnectionFacade::new(self.clone())
    }

    /// Drives one scheduling quantum: reads whatever is available off the
    /// socket (bounded by `read_timeout_ms`), dispatches any complete
    /// frames, runs the t1/t2/t3 timers, and drains pending outbound
    /// ASDUs. Called repeatedly by the scheduler, once per connection per
    /// tick, in both threaded and tick modes; the caller picks the read
    /// budget per SPEC_FULL.md §4.8 (tick mode always passes
    /// `FAST_POLL_MS`, threaded mode passes `FAST_POLL_MS` only while
    /// `has_pending_outbound` is true).
    pub fn service(self: &Arc<Self>, read_timeout_ms: u64) -> Result<()> {
        self.read_available(read_timeout_ms)?;
        let frames = self.take_complete_frames();
        for frame in frames {
            self.handle_frame(&frame)?;
        }
        self.check_timers()?;
        self.drain_queues()?;
        Ok(())
    }

    /// Whether this connection has an ASDU waiting to be drained out to the
    /// peer right now, in either priority queue. The scheduler uses this to
    /// decide whether to shorten the next read-select budget instead of
    /// sitting out a full idle poll before the next send attempt.
    pub fn has_pending_outbound(&self) -> bool {
        !self.group.high_priority.lock().unwrap().is_empty() || self.group.low_priority.lock().unwrap().has_waiting()
    }

    fn read_available(&self, timeout_ms: u64) -> Result<()> {
        use std::io::Read;
        let mut buf = [0u8; 512];
        let mut state = self.state.lock().unwrap();
        state.stream.set_read_timeout(Some(std::time::Duration::from_millis(timeout_ms)))?;
        match state.stream.read(&mut buf) {
            Ok(0) => {
                info!("connection {}: peer closed", self.id);
                state.is_running = false;
                Ok(())
            }
            Ok(n) => {
                state.recv_buf.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn take_complete_frames(&self) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let mut frames = Vec::new();
        loop {
            if state.recv_buf.len() < 2 {
                break;
            }
            if state.recv_buf[0] != apci::START_BYTE {
                warn!("connection {}: bad start byte, closing", self.id);
                state.recv_buf.clear();
                state.is_running = false;
                break;
            }
            let total = state.recv_buf[1] as usize + 2;
            if state.recv_buf.len() < total {
                break;
            }
            let frame: Vec<u8> = state.recv_buf.drain(..total).collect();
            frames.push(frame);
        }
        frames
    }

    fn handle_frame(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        let facade = self.facade();
        self.event_handler.raw_message_received(&facade, raw);

        let frame = match apci::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                warn!("connection {}: framing error: {e}", self.id);
                self.request_close();
                return Err(e);
            }
        };

        match frame {
            Frame::Information {
                send_seq,
                recv_seq,
                asdu,
            } => self.handle_information(send_seq, recv_seq, asdu),
            Frame::Supervisory { recv_seq } => self.handle_supervisory(recv_seq),
            Frame::StartDtAct => self.handle_startdt_act(),
            Frame::StopDtAct => self.handle_stopdt_act(),
            Frame::TestFrAct => self.handle_testfr_act(),
            Frame::TestFrCon => {
                self.state.lock().unwrap().outstanding_testfr = 0;
                Ok(())
            }
            Frame::StartDtCon | Frame::StopDtCon => {
                trace!("connection {}: unexpected confirmation frame from peer", self.id);
                Ok(())
            }
        }
    }

    fn handle_information(self: &Arc<Self>, send_seq: u16, recv_seq: u16, asdu: &[u8]) -> Result<()> {
        let active_copy;
        {
            let mut state = self.state.lock().unwrap();
            if !state.t2_triggered {
                state.last_confirmation_time_ms = now_ms();
                state.t2_triggered = true;
            }
            if send_seq != state.receive_count {
                warn!(
                    "connection {}: send-seq {} != expected {}",
                    self.id, send_seq, state.receive_count
                );
                state.is_running = false;
                return Err(Error::Sequence("unexpected send sequence number"));
            }

            let confirmed = state.kbuf.check_and_confirm(recv_seq, state.send_count);
            let removed = match confirmed {
                Some(entries) => entries,
                None => {
                    warn!("connection {}: invalid receive sequence number", self.id);
                    state.is_running = false;
                    return Err(Error::Sequence("invalid receive sequence number"));
                }
            };
            drop(state);
            for entry in removed {
                if let Some(entry_ref) = entry.queue_entry_ref {
                    self.group.low_priority.lock().unwrap().mark_confirmed(entry_ref);
                }
            }

            let mut state = self.state.lock().unwrap();
            state.receive_count = wrapping_inc(state.receive_count);
            state.unconfirmed_recv += 1;
            state.next_t3_deadline_ms = now_ms() + self.apci.t3 as u64 * 1000;
            active_copy = state.is_active;

            if state.unconfirmed_recv as u32 >= self.apci.w as u32 {
                let recv_seq_to_ack = state.receive_count;
                drop(state);
                self.send_supervisory(recv_seq_to_ack)?;
                let mut state = self.state.lock().unwrap();
                state.unconfirmed_recv = 0;
                state.t2_triggered = false;
            }
        }

        if active_copy {
            self.handle_asdu(asdu)?;
        } else {
            trace!("connection {}: dropping I-frame, connection inactive", self.id);
        }
        Ok(())
    }

    fn handle_supervisory(self: &Arc<Self>, recv_seq: u16) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let result = state.kbuf.check_and_confirm(recv_seq, state.send_count);
            state.next_t3_deadline_ms = now_ms() + self.apci.t3 as u64 * 1000;
            match result {
                Some(entries) => entries,
                None => {
                    warn!("connection {}: invalid S-frame receive sequence number", self.id);
                    state.is_running = false;
                    return Err(Error::Sequence("invalid receive sequence number"));
                }
            }
        };
        for entry in removed {
            if let Some(entry_ref) = entry.queue_entry_ref {
                self.group.low_priority.lock().unwrap().mark_confirmed(entry_ref);
            }
        }
        Ok(())
    }

    fn handle_startdt_act(self: &Arc<Self>) -> Result<()> {
        self.coordinate_activation();
        self.set_active(true);
        self.group.high_priority.lock().unwrap().reset();
        let mut buf = [0u8; 6];
        apci::encode_startdt_con(&mut buf);
        self.write_raw(&buf)?;
        info!("connection {}: STARTDT_ACT -> active", self.id);
        Ok(())
    }

    fn handle_stopdt_act(self: &Arc<Self>) -> Result<()> {
        self.set_active(false);
        let mut buf = [0u8; 6];
        apci::encode_stopdt_con(&mut buf);
        self.write_raw(&buf)?;
        info!("connection {}: STOPDT_ACT -> inactive", self.id);
        Ok(())
    }

    pub fn opened(self: &Arc<Self>) {
        let facade = self.facade();
        self.event_handler.opened(&facade);
    }

    fn handle_testfr_act(self: &Arc<Self>) -> Result<()> {
        let mut buf = [0u8; 6];
        apci::encode_testfr_con(&mut buf);
        self.write_raw(&buf)?;
        self.state.lock().unwrap().next_t3_deadline_ms = now_ms() + self.apci.t3 as u64 * 1000;
        Ok(())
    }

    /// Enforces the activation-exclusivity policy (SPEC_FULL.md §4.7) before
    /// this connection activates: in `Single` mode every other connection
    /// deactivates; in `MultipleGroups`, only siblings in the same group do.
    /// `ConnectionIsGroup` has no cross-connection effect.
    fn coordinate_activation(&self) {
        if matches!(self.mode, ServerMode::ConnectionIsGroup) {
            return;
        }
        let others: Vec<Arc<Connection>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .filter(|c| c.id != self.id)
                .filter(|c| match self.mode {
                    ServerMode::Single => true,
                    ServerMode::MultipleGroups => c.group_index == self.group_index,
                    ServerMode::ConnectionIsGroup => false,
                })
                .cloned()
                .collect()
        };
        for other in others {
            other.set_active(false);
        }
    }

    fn set_active(self: &Arc<Self>, active: bool) {
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            let changed = state.is_active != active;
            state.is_active = active;
            if !active {
                self.group.low_priority.lock().unwrap().reset_sent_to_waiting();
            }
            changed
        };
        if transitioned {
            let facade = self.facade();
            if active {
                self.event_handler.activated(&facade);
            } else {
                self.event_handler.deactivated(&facade);
            }
        }
    }

    /// Parses the ASDU header and routes to the matching handler callback
    /// per SPEC_FULL.md §4.9, falling through to the engine's standard
    /// `UNKNOWN_TYPE_ID`/`UNKNOWN_COT` response when nothing claims it.
    fn handle_asdu(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        let view = match AsduView::parse(raw, self.app_layer) {
            Ok(v) => v,
            Err(e) => {
                warn!("connection {}: malformed ASDU: {e}", self.id);
                self.request_close();
                return Err(e);
            }
        };

        let facade = self.facade();
        let t = view.type_id();
        let c = view.cot();

        let result = match t {
            type_id::C_IC_NA_1 => {
                if c == cot::ACTIVATION || c == cot::DEACTIVATION {
                    self.asdu_handler.interrogation(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            type_id::C_CI_NA_1 => {
                if c == cot::ACTIVATION || c == cot::DEACTIVATION {
                    self.asdu_handler.counter_interrogation(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            type_id::C_RD_NA_1 => {
                if c == cot::REQUEST {
                    self.asdu_handler.read(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            type_id::C_CS_NA_1 => {
                if c == cot::ACTIVATION {
                    self.asdu_handler.clock_sync(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            type_id::C_RP_NA_1 => {
                if c == cot::ACTIVATION {
                    self.asdu_handler.reset_process(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            type_id::C_CD_NA_1 => {
                if c == cot::ACTIVATION || c == cot::SPONTANEOUS {
                    self.asdu_handler.delay_acquisition(&facade, &view)
                } else {
                    HandlerResult::NotHandled
                }
            }
            _ => HandlerResult::NotHandled,
        };

        let result = if result == HandlerResult::NotHandled {
            self.asdu_handler.generic_asdu(&facade, &view)
        } else {
            result
        };

        if result == HandlerResult::NotHandled {
            self.respond_unknown(raw, &view)?;
        }
        Ok(())
    }

    fn respond_unknown(self: &Arc<Self>, raw: &[u8], view: &AsduView) -> Result<()> {
        let mut response = raw.to_vec();
        let known_type = matches!(
            view.type_id(),
            type_id::C_IC_NA_1
                | type_id::C_CI_NA_1
                | type_id::C_RD_NA_1
                | type_id::C_CS_NA_1
                | type_id::C_RP_NA_1
                | type_id::C_CD_NA_1
        );
        let response_cot = if known_type { cot::UNKNOWN_COT } else { cot::UNKNOWN_TYPE_ID };
        asdu::set_cot(&mut response, response_cot, true)?;
        self.send_asdu_internal(&response)
    }

    pub fn send_act_con(self: &Arc<Self>, raw_asdu: &[u8], negative: bool) -> Result<()> {
        let mut response = raw_asdu.to_vec();
        asdu::set_cot(&mut response, cot::ACTIVATION_CON, negative)?;
        self.send_asdu_internal(&response)
    }

    pub fn send_act_term(self: &Arc<Self>, raw_asdu: &[u8]) -> Result<()> {
        let mut response = raw_asdu.to_vec();
        asdu::set_cot(&mut response, cot::ACTIVATION_TERMINATION, false)?;
        self.send_asdu_internal(&response)
    }

    /// Sends an ASDU right now if the sliding window has room, else falls
    /// back to the high-priority queue so it is not lost.
    pub fn send_asdu_internal(self: &Arc<Self>, asdu: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(Error::NotActive);
        }
        let can_send_now = {
            let state = self.state.lock().unwrap();
            !state.kbuf.is_full()
        };
        if can_send_now {
            self.send_i_frame(asdu, None)
        } else if self.group.high_priority.lock().unwrap().enqueue(asdu.to_vec()) {
            Ok(())
        } else {
            Err(Error::QueueFull)
        }
    }

    fn send_i_frame(self: &Arc<Self>, asdu: &[u8], entry_ref: Option<crate::queue::EntryRef>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let send_seq = state.send_count;
        let recv_seq = state.receive_count;
        let frame = apci::encode_information(send_seq, recv_seq, asdu)?;

        state.stream.set_write_timeout(Some(std::time::Duration::from_secs(5)))?;
        {
            use std::io::Write;
            state.stream.write_all(&frame)?;
        }

        let now = now_ms();
        state.kbuf.push(KEntry {
            seq_no: send_seq,
            sent_time_ms: now,
            queue_entry_ref: entry_ref,
            entry_time_ms: now,
        });
        state.send_count = wrapping_inc(state.send_count);
        state.unconfirmed_recv = 0;
        state.t2_triggered = false;
        drop(state);
        debug!("connection {}: sent I-frame seq={}", self.id, send_seq);
        let facade = self.facade();
        self.event_handler.raw_message_sent(&facade, &frame);
        Ok(())
    }

    fn send_supervisory(self: &Arc<Self>, recv_seq: u16) -> Result<()> {
        let mut buf = [0u8; 6];
        apci::encode_supervisory(&mut buf, recv_seq);
        self.write_raw(&buf)
    }

    fn write_raw(self: &Arc<Self>, frame: &[u8]) -> Result<()> {
        use std::io::Write;
        {
            let mut state = self.state.lock().unwrap();
            state.stream.set_write_timeout(Some(std::time::Duration::from_secs(5)))?;
            state.stream.write_all(frame)?;
        }
        let facade = self.facade();
        self.event_handler.raw_message_sent(&facade, frame);
        Ok(())
    }

    /// Drains outbound queues while the sliding window has room: one
    /// high-priority entry first, then at most one low-priority entry, so a
    /// single `service()` call interleaves sending with recv servicing
    /// rather than starving the recv path on a deep backlog.
    fn drain_queues(self: &Arc<Self>) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        loop {
            let full = self.state.lock().unwrap().kbuf.is_full();
            if full {
                break;
            }
            let next = self.group.high_priority.lock().unwrap().pop_next();
            match next {
                Some(asdu) => self.send_i_frame(&asdu, None)?,
                None => break,
            }
        }

        let full = self.state.lock().unwrap().kbuf.is_full();
        if !full {
            let popped = self.group.low_priority.lock().unwrap().next_waiting();
            if let Some((entry_ref, _entry_time, payload)) = popped {
                self.send_i_frame(&payload, Some(entry_ref))?;
            }
        }
        Ok(())
    }

    /// Runs the t1 (send-ack), t2 (ack-delay), and t3 (idle probe) timers,
    /// each guarded against the wall clock having moved backward.
    fn check_timers(self: &Arc<Self>) -> Result<()> {
        let now = now_ms();
        let mut must_close = false;
        let mut send_ack = false;
        let mut send_testfr = false;

        {
            let mut state = self.state.lock().unwrap();

            if let Some(oldest) = state.kbuf.oldest() {
                if elapsed_ms(oldest.sent_time_ms, now) >= self.apci.t1 as u64 * 1000 {
                    warn!("connection {}: t1 timeout, no ack received", self.id);
                    must_close = true;
                }
            }

            if state.unconfirmed_recv > 0 {
                if elapsed_ms(state.last_confirmation_time_ms, now) >= self.apci.t2 as u64 * 1000 {
                    send_ack = true;
                }
            }

            let t3_budget_ms = self.apci.t3 as u64 * 1000;
            if state.next_t3_deadline_ms > now + t3_budget_ms {
                // The wall clock moved backward since this deadline was set;
                // re-anchor it to the current time instead of waiting out a
                // stale, now-unreachable future deadline.
                state.next_t3_deadline_ms = now + t3_budget_ms;
            }
            if now >= state.next_t3_deadline_ms {
                if state.outstanding_testfr > 2 {
                    warn!("connection {}: t3 timeout, no TESTFR_CON received", self.id);
                    must_close = true;
                } else {
                    send_testfr = true;
                    state.outstanding_testfr += 1;
                    state.next_t3_deadline_ms = now + self.apci.t3 as u64 * 1000;
                }
            }
        }

        if must_close {
            self.request_close();
            return Err(Error::Sequence("timer expired"));
        }

        if send_ack {
            let recv_seq = self.state.lock().unwrap().receive_count;
            self.send_supervisory(recv_seq)?;
            let mut state = self.state.lock().unwrap();
            state.unconfirmed_recv = 0;
            state.t2_triggered = false;
        }

        if send_testfr {
            let mut buf = [0u8; 6];
            apci::encode_testfr_act(&mut buf);
            self.write_raw(&buf)?;
        }

        Ok(())
    }

    /// Called by the server when this connection's socket fails or the
    /// connection otherwise closes: reverts any in-flight sent-but-unconfirmed
    /// entries to waiting so a sibling connection can retransmit them.
    pub fn on_closed(self: &Arc<Self>) {
        let was_active = {
            let mut state = self.state.lock().unwrap();
            let was_active = state.is_active;
            state.is_active = false;
            state.is_running = false;
            was_active
        };
        if was_active {
            self.group.low_priority.lock().unwrap().reset_sent_to_waiting();
        }
        let facade = self.facade();
        self.event_handler.closed(&facade);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_inc_wraps_at_32768() {
        assert_eq!(wrapping_inc(32767), 0);
        assert_eq!(wrapping_inc(0), 1);
    }
}
