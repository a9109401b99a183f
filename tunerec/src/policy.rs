//! Priority constants shared across subsystems.
//!
//! The relative ordering here is a contract: recordings outrank viewing at
//! the tuner source, conflict winners outrank plain recordings, and encode
//! jobs submitted through the queue outrank nothing else in that subsystem.

/// Tuning-priority hints sent to the tuner source when opening a stream.
pub mod tuning {
    /// Priority for an ordinary admitted reservation.
    pub const RECORDING: u8 = 2;
    /// Priority for a reservation that won a conflict during scheduling.
    /// Higher so the tuner source does not starve it in favor of viewers.
    pub const RECORDING_CONFLICT_WINNER: u8 = 3;
}

/// Priorities inside the encode process pool.
pub mod encode {
    /// Priority of jobs submitted through the encode queue. The queue is
    /// the only submitter in this subsystem, so nothing contends with it.
    pub const QUEUE_JOB: i32 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_winner_outranks_recording() {
        assert!(tuning::RECORDING_CONFLICT_WINNER > tuning::RECORDING);
    }
}
