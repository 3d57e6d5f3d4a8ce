use std::sync::Mutex;

use futures::channel::mpsc::UnboundedSender;
use log::debug;

use crate::message::Message;

/// Direction of a monitored frame relative to the transport end it was
/// recorded on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One monitored frame
#[derive(Debug, Clone)]
pub struct MonitorMessage {
    pub direction: Direction,
    pub peer_name: String,
    pub message: Message,
}

/// Record a frame into the transport's monitor sink, if one is installed.
/// A dead sink detaches the monitor
pub(crate) fn observe(
    sink: &Mutex<Option<UnboundedSender<MonitorMessage>>>,
    direction: Direction,
    peer_name: &str,
    message: &Message,
) {
    let mut guard = sink.lock().unwrap();

    if let Some(monitor) = guard.as_ref() {
        let frame = MonitorMessage {
            direction,
            peer_name: peer_name.to_owned(),
            message: message.clone(),
        };

        if monitor.unbounded_send(frame).is_err() {
            debug!("Monitor disconnected");
            *guard = None;
        }
    }
}
