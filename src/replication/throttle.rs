/// Per-burst byte budget for a streaming response. The record that crosses
/// the budget is transmitted as a log-more marker and the stream yields
/// back to the caller; the requester resumes with a fresh request.
pub(crate) struct Throttle {
    budget: u64,
    sent: u64,
}

impl Throttle {
    /// A zero budget disables throttling.
    pub fn new(budget: u64) -> Self {
        Self { budget, sent: 0 }
    }

    /// Accounts for `len` bytes about to be sent. True when the burst
    /// budget is now exhausted and the caller must yield after this record.
    pub fn consume(&mut self, len: u64) -> bool {
        if self.budget == 0 {
            return false;
        }
        self.sent = self.sent.saturating_add(len);
        self.sent >= self.budget
    }
}
