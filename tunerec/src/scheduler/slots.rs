//! Virtual tuner slot model, rebuilt on every scheduling pass.

use tunerec_protocol::{ChannelType, Program};

use super::Reservation;
use crate::tuner::TunerDevice;

/// One virtual slot per physical tuner device. Holds the reservations
/// admitted to that device so far during a pass; never persisted.
#[derive(Debug)]
pub(super) struct TunerSlot {
    types: Vec<ChannelType>,
    pub entries: Vec<Reservation>,
}

impl TunerSlot {
    pub fn new(device: &TunerDevice) -> Self {
        Self {
            types: device.types.clone(),
            entries: Vec::new(),
        }
    }

    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.types.contains(&channel_type)
    }

    /// Index of the first admitted entry conflicting with `program`.
    pub fn find_conflict(&self, program: &Program) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| conflicts(&e.program, program))
    }
}

/// Two programs conflict iff their time windows overlap and they cannot
/// share a tuned multiplex. Same physical channel with different service
/// ids travels on one carrier, so it is not a real conflict.
pub(super) fn conflicts(a: &Program, b: &Program) -> bool {
    let overlap = a.start_at < b.end_at && b.start_at < a.end_at;
    if !overlap {
        return false;
    }
    !(a.channel == b.channel && a.service_id != b.service_id)
}

/// Index of the last slot supporting a channel type. A conflict at this
/// slot means there is no spare capacity left for the type.
pub(super) fn tuner_max_position(slots: &[TunerSlot], channel_type: ChannelType) -> Option<usize> {
    slots.iter().rposition(|s| s.supports(channel_type))
}
