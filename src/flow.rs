use crate::{
    queue::PendingRequest,
    settings::{Settings, SettingsUpdate},
    types::*,
};
use log::trace;
use std::collections::{HashSet, VecDeque};

/// Connection-level flow-control record: send/receive windows, stream-id
/// allocation, the active-stream set, and requests admitted but not yet
/// started because the windows were shut.
pub(crate) struct FlowControl {
    settings: Settings,
    next_stream_id: StreamId,
    active_streams: HashSet<StreamId>,
    pending: VecDeque<PendingRequest>,
    connection_send_window: i32,
    connection_recv_window: i32,
}

impl FlowControl {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            next_stream_id: 1,
            active_streams: HashSet::new(),
            pending: VecDeque::new(),
            connection_send_window: DEFAULT_INITIAL_WINDOW_SIZE as i32,
            connection_recv_window: DEFAULT_INITIAL_WINDOW_SIZE as i32,
        }
    }

    /// Current effective peer settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replaces the effective peer settings, returning what changed so the
    /// caller can propagate the initial-window delta to every active stream.
    pub fn update_settings(
        &mut self,
        params: &[(SettingsParameter, u32)],
    ) -> Result<SettingsUpdate, Error> {
        self.settings.apply(params)
    }

    pub fn add(&mut self, pending: PendingRequest) {
        self.pending.push_back(pending);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pop_pending(&mut self) -> Option<PendingRequest> {
        self.pending.pop_front()
    }

    /// Allocates the next client-initiated stream id: odd, strictly
    /// increasing, never reused.
    pub fn allocate_stream_id(&mut self) -> Result<NonZeroStreamId, Error> {
        let id = self.next_stream_id;
        if id > U31_MAX {
            return Err(Error::Protocol("client stream ids exhausted"));
        }
        self.next_stream_id += 2;
        NonZeroStreamId::new(id).ok_or(Error::Protocol("client stream ids exhausted"))
    }

    pub fn add_active(&mut self, id: StreamId) {
        self.active_streams.insert(id);
    }

    pub fn remove_active(&mut self, id: StreamId) {
        self.active_streams.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active_streams.len()
    }

    /// How many more streams the peer allows right now; the unbounded sentinel
    /// when it declared no limit.
    pub fn available_slots(&self) -> u64 {
        match self.settings.max_concurrent_streams {
            Some(max) => u64::from(max).saturating_sub(self.active_count() as u64),
            None => UNBOUNDED_DEMAND,
        }
    }

    pub fn connection_send_window(&self) -> i32 {
        self.connection_send_window
    }

    /// Credits the connection send window from a WINDOW_UPDATE.
    pub fn increment_send_window(&mut self, increment: u32) -> Result<(), Error> {
        let updated = i64::from(self.connection_send_window) + i64::from(increment);
        if updated > i64::from(U31_MAX) {
            return Err(Error::FlowControl("connection send window overflow"));
        }
        trace!(
            "connection send window {} -> {}",
            self.connection_send_window,
            updated
        );
        self.connection_send_window = updated as i32;
        Ok(())
    }

    /// Debits the connection send window for an outbound DATA payload. The
    /// caller bounds the length by `send_budget`, keeping the window >= 0.
    pub fn charge_send(&mut self, length: u32) {
        self.connection_send_window -= length as i32;
    }

    /// Debits the connection receive window for an inbound DATA payload.
    pub fn charge_recv(&mut self, length: u32) -> Result<(), Error> {
        self.connection_recv_window -= length as i32;
        if self.connection_recv_window < 0 {
            return Err(Error::FlowControl("connection receive window exceeded"));
        }
        Ok(())
    }

    /// Credits the connection receive window back, mirroring the
    /// WINDOW_UPDATE the engine just sent.
    pub fn replenish_recv(&mut self, increment: u32) -> Result<(), Error> {
        let updated = i64::from(self.connection_recv_window) + i64::from(increment);
        if updated > i64::from(U31_MAX) {
            return Err(Error::FlowControl("connection receive window overflow"));
        }
        self.connection_recv_window = updated as i32;
        Ok(())
    }

    /// Largest DATA payload sendable on a stream right now: bounded by the
    /// peer's frame limit, the stream window, and the connection window.
    pub fn send_budget(&self, stream_send_window: i32) -> u32 {
        self.settings
            .max_frame_size
            .min(stream_send_window.max(0) as u32)
            .min(self.connection_send_window.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut flow = FlowControl::new();
        let ids: Vec<u32> = (0..4)
            .map(|_| flow.allocate_stream_id().unwrap().get())
            .collect();
        assert_eq!(ids, vec![1, 3, 5, 7]);
    }

    #[test]
    fn send_window_overflow_is_an_error() {
        let mut flow = FlowControl::new();
        flow.increment_send_window(U31_MAX - 65_535).unwrap();
        assert!(matches!(
            flow.increment_send_window(1),
            Err(Error::FlowControl(_))
        ));
    }

    #[test]
    fn available_slots_track_active_streams() {
        let mut flow = FlowControl::new();
        assert_eq!(flow.available_slots(), UNBOUNDED_DEMAND);
        flow.update_settings(&[(SettingsParameter::MaxConcurrentStreams, 2)])
            .unwrap();
        assert_eq!(flow.available_slots(), 2);
        flow.add_active(1);
        flow.add_active(3);
        assert_eq!(flow.available_slots(), 0);
        flow.remove_active(1);
        assert_eq!(flow.available_slots(), 1);
        assert_eq!(flow.active_count(), 1);
    }

    #[test]
    fn send_budget_takes_the_tightest_bound() {
        let mut flow = FlowControl::new();
        assert_eq!(flow.send_budget(10), 10);
        assert_eq!(flow.send_budget(1 << 30), 16_384);
        flow.charge_send(65_535);
        assert_eq!(flow.send_budget(10), 0);
        assert_eq!(flow.connection_send_window(), 0);
        flow.increment_send_window(15).unwrap();
        assert_eq!(flow.send_budget(100), 15);
    }

    #[test]
    fn recv_window_round_trips() {
        let mut flow = FlowControl::new();
        flow.charge_recv(5).unwrap();
        flow.replenish_recv(5).unwrap();
        assert!(flow.charge_recv(65_535).is_ok());
        assert!(matches!(flow.charge_recv(1), Err(Error::FlowControl(_))));
    }
}
