//! Viewer-side state for one tailed device.
//!
//! The daemon's ring buffer is shared by every viewer of a device; what a
//! single viewer has seen lives here. Clearing resets this state only.

use std::collections::VecDeque;

use devrelay_core::DeviceId;
use devrelay_protocol::ServerMessage;

/// Default number of lines a view retains.
pub const DEFAULT_VIEW_HISTORY: usize = 1000;

/// One line as this viewer saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewLine {
    /// Position since attach or the last clear, starting at 1
    pub seq: u64,
    pub text: String,
    /// Whether the line arrived in the catch-up snapshot
    pub backlog: bool,
}

/// Something the viewer should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Attached { device_id: DeviceId },
    Line(ViewLine),
    /// Batches skipped because this viewer fell behind
    Gap { batches: u64 },
    Cleared,
    Notice {
        message: String,
        code: Option<String>,
    },
    Stopped { device_id: DeviceId, reason: String },
}

/// State of a single viewer.
#[derive(Debug, Clone)]
pub struct View {
    /// Device currently shown
    device_id: Option<DeviceId>,

    /// Most recent lines, oldest first
    lines: VecDeque<ViewLine>,

    /// Maximum number of retained lines
    history: usize,

    /// Sequence number of the next line
    next_seq: u64,

    /// Batches dropped since the last clear
    dropped_batches: u64,

    /// Reason the session ended, once it has
    stopped: Option<String>,
}

impl Default for View {
    fn default() -> Self {
        Self::new(DEFAULT_VIEW_HISTORY)
    }
}

impl View {
    /// Creates an empty view retaining at most `history` lines.
    pub fn new(history: usize) -> Self {
        Self {
            device_id: None,
            lines: VecDeque::with_capacity(history.min(DEFAULT_VIEW_HISTORY)),
            history,
            next_seq: 1,
            dropped_batches: 0,
            stopped: None,
        }
    }

    /// Folds one daemon message into the view.
    ///
    /// Returns what should be shown, in order. Replies that carry no view
    /// content (`pong`, `device_list`, handshake) produce nothing.
    pub fn apply(&mut self, msg: ServerMessage) -> Vec<ViewEvent> {
        match msg {
            ServerMessage::Attached { device_id } => {
                self.reset();
                self.stopped = None;
                self.device_id = Some(device_id.clone());
                vec![ViewEvent::Attached { device_id }]
            }

            ServerMessage::Batch {
                device_id,
                lines,
                is_backlog,
            } => {
                // Leftovers from a device this view already switched away from
                if !self.follows(&device_id) {
                    return Vec::new();
                }
                lines
                    .into_iter()
                    .map(|text| ViewEvent::Line(self.push(text, is_backlog)))
                    .collect()
            }

            ServerMessage::Dropped { batches } => {
                self.dropped_batches = self.dropped_batches.saturating_add(batches);
                vec![ViewEvent::Gap { batches }]
            }

            ServerMessage::Cleared {} => {
                self.reset();
                vec![ViewEvent::Cleared]
            }

            ServerMessage::Error { message, code } => vec![ViewEvent::Notice { message, code }],

            ServerMessage::Stopped { device_id, reason } => {
                if !self.follows(&device_id) {
                    return Vec::new();
                }
                self.stopped = Some(reason.clone());
                vec![ViewEvent::Stopped { device_id, reason }]
            }

            ServerMessage::Connected { .. }
            | ServerMessage::Rejected { .. }
            | ServerMessage::DeviceList { .. }
            | ServerMessage::Pong { .. } => Vec::new(),
        }
    }

    /// True for the attached device, or any device before the first `attached`.
    fn follows(&self, device_id: &DeviceId) -> bool {
        self.device_id.is_none() || self.device_id.as_ref() == Some(device_id)
    }

    fn push(&mut self, text: String, backlog: bool) -> ViewLine {
        let line = ViewLine {
            seq: self.next_seq,
            text,
            backlog,
        };
        self.next_seq = self.next_seq.saturating_add(1);

        if self.history > 0 {
            if self.lines.len() >= self.history {
                self.lines.pop_front();
            }
            self.lines.push_back(line.clone());
        }
        line
    }

    /// Forgets every line and counter; the device stays attached.
    pub fn reset(&mut self) {
        self.lines.clear();
        self.next_seq = 1;
        self.dropped_batches = 0;
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &ViewLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Sequence number the next line will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches
    }

    /// Why the session ended, if it has.
    pub fn stopped(&self) -> Option<&str> {
        self.stopped.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId::new("dev-1")
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lines_are_numbered_in_arrival_order() {
        let mut view = View::default();
        view.apply(ServerMessage::attached(dev()));

        let events = view.apply(ServerMessage::backlog(dev(), lines(&["a", "b"])));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events.first(),
            Some(&ViewEvent::Line(ViewLine {
                seq: 1,
                text: "a".to_string(),
                backlog: true,
            }))
        );

        let events = view.apply(ServerMessage::batch(dev(), lines(&["c"])));
        assert_eq!(
            events,
            vec![ViewEvent::Line(ViewLine {
                seq: 3,
                text: "c".to_string(),
                backlog: false,
            })]
        );
        assert_eq!(view.len(), 3);
        assert_eq!(view.next_seq(), 4);
    }

    #[test]
    fn test_clear_resets_numbering_and_counters() {
        let mut view = View::default();
        view.apply(ServerMessage::attached(dev()));
        view.apply(ServerMessage::batch(dev(), lines(&["a", "b"])));
        view.apply(ServerMessage::dropped(3));
        assert_eq!(view.dropped_batches(), 3);

        assert_eq!(view.apply(ServerMessage::cleared()), vec![ViewEvent::Cleared]);
        assert!(view.is_empty());
        assert_eq!(view.dropped_batches(), 0);
        assert_eq!(view.device_id(), Some(&dev()));

        let events = view.apply(ServerMessage::batch(dev(), lines(&["z"])));
        match events.as_slice() {
            [ViewEvent::Line(line)] => assert_eq!(line.seq, 1),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut view = View::new(2);
        view.apply(ServerMessage::batch(dev(), lines(&["a", "b", "c"])));

        let kept: Vec<&str> = view.lines().map(|l| l.text.as_str()).collect();
        assert_eq!(kept, vec!["b", "c"]);
        assert_eq!(view.next_seq(), 4);
    }

    #[test]
    fn test_zero_history_still_numbers_lines() {
        let mut view = View::new(0);
        let events = view.apply(ServerMessage::batch(dev(), lines(&["a", "b"])));
        assert_eq!(events.len(), 2);
        assert!(view.is_empty());
        assert_eq!(view.next_seq(), 3);
    }

    #[test]
    fn test_stopped_and_notices() {
        let mut view = View::default();
        let events = view.apply(ServerMessage::error_with_code("adb: offline", "upstream_error"));
        assert_eq!(
            events,
            vec![ViewEvent::Notice {
                message: "adb: offline".to_string(),
                code: Some("upstream_error".to_string()),
            }]
        );

        view.apply(ServerMessage::stopped(dev(), "exited with code 1"));
        assert_eq!(view.stopped(), Some("exited with code 1"));

        // Re-attaching starts over
        view.apply(ServerMessage::attached(dev()));
        assert_eq!(view.stopped(), None);
    }

    #[test]
    fn test_messages_for_previous_device_are_ignored() {
        let mut view = View::default();
        view.apply(ServerMessage::attached(dev()));
        view.apply(ServerMessage::batch(dev(), lines(&["old"])));

        let other = DeviceId::new("dev-2");
        view.apply(ServerMessage::attached(other.clone()));

        assert!(view.apply(ServerMessage::batch(dev(), lines(&["late"]))).is_empty());
        assert!(view.apply(ServerMessage::stopped(dev(), "stopped")).is_empty());
        assert!(view.is_empty());
        assert_eq!(view.stopped(), None);

        let events = view.apply(ServerMessage::batch(other, lines(&["new"])));
        match events.as_slice() {
            [ViewEvent::Line(line)] => {
                assert_eq!(line.text, "new");
                assert_eq!(line.seq, 1);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_replies_produce_no_events() {
        let mut view = View::default();
        assert!(view.apply(ServerMessage::pong(1)).is_empty());
        assert!(view.apply(ServerMessage::device_list(Vec::new())).is_empty());
    }
}
