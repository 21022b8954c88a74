use parley_ai::{Message, TurnError};
use tracing::debug;

use crate::types::{AbortController, AbortSignal, SessionEpoch};

/// Owns everything that must not outlive the active session: the streaming
/// draft, the ephemeral turn error and the in-flight abort handle.
#[derive(Default)]
pub struct SessionGuard {
    epoch: Option<SessionEpoch>,
    draft: Option<Message>,
    error: Option<TurnError>,
    in_flight: Option<AbortController>,
}

impl SessionGuard {
    pub fn new(epoch: Option<SessionEpoch>) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<&SessionEpoch> {
        self.epoch.as_ref()
    }

    /// Whether work stamped with `stamp` may still touch local state.
    pub fn accepts(&self, stamp: &SessionEpoch) -> bool {
        let accepted = self.epoch.as_ref() == Some(stamp);
        if !accepted {
            debug!(
                stamp = %stamp,
                current = self.epoch.as_ref().map(SessionEpoch::session_id).unwrap_or("<none>"),
                "discarded update from stale session"
            );
        }
        accepted
    }

    /// Moves to a new epoch. Returns false when the epoch is unchanged.
    pub fn switch_to(&mut self, epoch: Option<SessionEpoch>) -> bool {
        if self.epoch == epoch {
            return false;
        }
        self.abort_in_flight();
        self.draft = None;
        self.error = None;
        debug!(
            from = self.epoch.as_ref().map(SessionEpoch::session_id).unwrap_or("<none>"),
            to = epoch.as_ref().map(SessionEpoch::session_id).unwrap_or("<none>"),
            "session switched"
        );
        self.epoch = epoch;
        true
    }

    /// Installs a fresh abort handle for a new turn and returns its signal.
    pub fn begin_turn(&mut self) -> AbortSignal {
        let controller = AbortController::new();
        let signal = controller.signal();
        self.in_flight = Some(controller);
        signal
    }

    pub fn end_turn(&mut self) {
        self.in_flight = None;
        self.draft = None;
    }

    pub fn abort_in_flight(&mut self) -> bool {
        match self.in_flight.take() {
            Some(controller) => {
                controller.abort();
                true
            }
            None => false,
        }
    }

    pub fn accept_draft(&mut self, stamp: &SessionEpoch, draft: Message) -> bool {
        if !self.accepts(stamp) {
            return false;
        }
        self.draft = Some(draft);
        true
    }

    pub fn clear_draft(&mut self) {
        self.draft = None;
    }

    pub fn record_error(&mut self, stamp: &SessionEpoch, error: TurnError) -> bool {
        if !self.accepts(stamp) {
            return false;
        }
        self.error = Some(error);
        true
    }

    pub fn dismiss_error(&mut self) -> Option<TurnError> {
        self.error.take()
    }

    pub fn draft(&self) -> Option<&Message> {
        self.draft.as_ref()
    }

    pub fn error(&self) -> Option<&TurnError> {
        self.error.as_ref()
    }
}
