//! The PCM client stream state machine (spec.md §4.6: "`OPEN → HWPARAMS
//! → SWPARAMS → PREPARED → RUNNING ↔ PAUSED → DRAINING → PREPARED`, with
//! `XRUN` as a terminal-until-prepared state and `DISCONNECTED` as
//! fatal").

use dspd_common::Errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Open,
    HwParams,
    SwParams,
    Prepared,
    Running,
    Paused,
    Draining,
    Xrun,
    Disconnected,
}

impl ClientState {
    /// True once `set_hwparams` has completed at least once, which is
    /// the precondition spec.md §4.6.3 implies for `set_swparams`.
    pub fn has_hwparams(self) -> bool {
        !matches!(self, ClientState::Open)
    }

    fn transition_allowed(self, next: ClientState) -> bool {
        use ClientState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Open, HwParams) => true,
            (HwParams, HwParams) => true,
            (HwParams, SwParams) => true,
            (SwParams, SwParams) => true,
            (SwParams, Prepared) => true,
            (Prepared, Running) => true,
            (Prepared, Prepared) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Running, Draining) => true,
            (Running, Prepared) => true, // implicit prepare() while running (stop+prepare)
            (Paused, Prepared) => true,
            (Draining, Prepared) => true,
            (Xrun, Prepared) => true,
            (Running, Xrun) => true,
            (Paused, Xrun) => true,
            // Re-negotiating hw/sw params is allowed from any
            // non-terminal, non-running state.
            (Prepared, HwParams) => true,
            (Prepared, SwParams) => true,
            _ => false,
        }
    }

    /// Advances to `next`, or `-EBADFD`-equivalent if the transition is
    /// not one spec.md's state diagram allows.
    pub fn advance(&mut self, next: ClientState) -> Result<(), Errno> {
        if !self.transition_allowed(next) {
            return Err(Errno::BadFd);
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_open_to_running() {
        let mut s = ClientState::Open;
        s.advance(ClientState::HwParams).unwrap();
        s.advance(ClientState::SwParams).unwrap();
        s.advance(ClientState::Prepared).unwrap();
        s.advance(ClientState::Running).unwrap();
        assert_eq!(s, ClientState::Running);
    }

    #[test]
    fn pause_then_resume() {
        let mut s = ClientState::Running;
        s.advance(ClientState::Paused).unwrap();
        s.advance(ClientState::Running).unwrap();
        assert_eq!(s, ClientState::Running);
    }

    #[test]
    fn xrun_requires_prepare_to_recover() {
        let mut s = ClientState::Running;
        s.advance(ClientState::Xrun).unwrap();
        assert!(s.advance(ClientState::Running).is_err());
        s.advance(ClientState::Prepared).unwrap();
        assert_eq!(s, ClientState::Prepared);
    }

    #[test]
    fn disconnected_is_terminal() {
        let mut s = ClientState::Running;
        s.advance(ClientState::Disconnected).unwrap();
        assert!(s.advance(ClientState::Prepared).is_err());
    }

    #[test]
    fn cannot_skip_hwparams() {
        let mut s = ClientState::Open;
        assert!(s.advance(ClientState::Prepared).is_err());
    }
}
