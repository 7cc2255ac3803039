//! Simplified TCP state machine used to vet segments.
//!
//! The machine observes one connection from the outside. Handshake states
//! follow SYN / SYN-ACK / ACK; after that, closing states are named from
//! the responder's side. A FIN from the server first walks `FIN_WAIT_1`,
//! `FIN_WAIT_2` and `TIME_WAIT` (or `CLOSING` on a simultaneous close),
//! while a FIN from the client first walks `CLOSE_WAIT`, `LAST_ACK` and
//! `CLOSED`.

use std::fmt;

use super::Direction;
use crate::protocol::TcpFlags;

/// TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Closed,
}

impl TcpState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME_WAIT",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection state machine.
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state: TcpState,
    allow_missing_init: bool,
}

impl TcpFsm {
    pub fn new(allow_missing_init: bool) -> Self {
        Self {
            state: TcpState::Listen,
            allow_missing_init,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Advance on a segment travelling in `dir`. Returns false when the
    /// segment does not fit the current state; the state is then unchanged.
    pub fn check(&mut self, flags: TcpFlags, dir: Direction) -> bool {
        use Direction::{ToClient, ToServer};
        use TcpState::*;

        let pure_syn = flags.syn() && !flags.ack();
        let syn_ack = flags.syn() && flags.ack();

        if flags.rst() {
            if self.state == Listen && !self.allow_missing_init {
                return false;
            }
            self.state = Closed;
            return true;
        }

        let next = match (self.state, dir) {
            (Listen, _) if pure_syn => SynSent,
            (Listen, _) if !self.allow_missing_init => return false,
            (Listen, _) if syn_ack => SynRcvd,
            (Listen, _) => return self.established(flags, dir),

            (SynSent, ToServer) if pure_syn => SynSent,
            (SynSent, ToClient) if syn_ack => SynRcvd,
            (SynSent, _) => return false,

            (SynRcvd, ToClient) if syn_ack => SynRcvd,
            (SynRcvd, ToServer) if flags.ack() && !flags.syn() => {
                self.state = Established;
                return self.established(flags, dir);
            }
            (SynRcvd, _) => return false,

            (Established, _) => return self.established(flags, dir),

            (_, _) if flags.syn() && !matches!(self.state, Closed | TimeWait) => return false,

            (FinWait1, ToServer) if flags.fin() && flags.ack() => TimeWait,
            (FinWait1, ToServer) if flags.fin() => Closing,
            (FinWait1, ToServer) if flags.ack() => FinWait2,
            (FinWait1, _) => FinWait1,

            (FinWait2, ToServer) if flags.fin() => TimeWait,
            (FinWait2, _) => FinWait2,

            (Closing, ToServer) if flags.ack() => TimeWait,
            (Closing, _) => Closing,

            (CloseWait, ToClient) if flags.fin() => LastAck,
            (CloseWait, _) => CloseWait,

            (LastAck, ToServer) if flags.ack() => Closed,
            (LastAck, _) => LastAck,

            (TimeWait | Closed, ToServer) if pure_syn => SynSent,
            (TimeWait, _) if flags.ack() => TimeWait,
            (TimeWait | Closed, _) => return false,
        };
        self.state = next;
        true
    }

    fn established(&mut self, flags: TcpFlags, dir: Direction) -> bool {
        if flags.syn() {
            return false;
        }
        self.state = match (flags.fin(), dir) {
            (true, Direction::ToClient) => TcpState::FinWait1,
            (true, Direction::ToServer) => TcpState::CloseWait,
            (false, _) => TcpState::Established,
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Direction::{ToClient, ToServer};

    fn walk(fsm: &mut TcpFsm, steps: &[(TcpFlags, Direction)]) -> Vec<bool> {
        steps.iter().map(|(f, d)| fsm.check(*f, *d)).collect()
    }

    // Test 1: three-way handshake
    #[test]
    fn test_handshake() {
        let mut fsm = TcpFsm::new(false);
        assert!(fsm.check(TcpFlags::SYN, ToServer));
        assert_eq!(fsm.state(), TcpState::SynSent);
        assert!(fsm.check(TcpFlags::SYN_ACK, ToClient));
        assert_eq!(fsm.state(), TcpState::SynRcvd);
        assert!(fsm.check(TcpFlags::ACK, ToServer));
        assert_eq!(fsm.state(), TcpState::Established);
        assert!(fsm.check(TcpFlags::PSH_ACK, ToClient));
    }

    // Test 2: server closes first
    #[test]
    fn test_responder_close() {
        let mut fsm = TcpFsm::new(true);
        assert!(fsm.check(TcpFlags::ACK, ToServer));
        assert!(fsm.check(TcpFlags::FIN_ACK, ToClient));
        assert_eq!(fsm.state(), TcpState::FinWait1);
        assert!(fsm.check(TcpFlags::ACK, ToServer));
        assert_eq!(fsm.state(), TcpState::FinWait2);
        assert!(fsm.check(TcpFlags::FIN_ACK, ToServer));
        assert_eq!(fsm.state(), TcpState::TimeWait);
        assert!(fsm.check(TcpFlags::ACK, ToClient));
        assert!(fsm.check(TcpFlags::SYN, ToServer));
        assert_eq!(fsm.state(), TcpState::SynSent);
    }

    // Test 3: client closes first
    #[test]
    fn test_initiator_close() {
        let mut fsm = TcpFsm::new(true);
        let results = walk(
            &mut fsm,
            &[
                (TcpFlags::PSH_ACK, ToServer),
                (TcpFlags::FIN_ACK, ToServer),
                (TcpFlags::ACK, ToClient),
                (TcpFlags::FIN_ACK, ToClient),
                (TcpFlags::ACK, ToServer),
            ],
        );
        assert!(results.iter().all(|ok| *ok));
        assert_eq!(fsm.state(), TcpState::Closed);
        assert!(!fsm.check(TcpFlags::ACK, ToServer));
    }

    // Test 4: mid-stream segments need missing-init support
    #[test]
    fn test_missing_init() {
        let mut strict = TcpFsm::new(false);
        assert!(!strict.check(TcpFlags::PSH_ACK, ToServer));
        assert!(!strict.check(TcpFlags::PSH_ACK, ToServer));
        assert_eq!(strict.state(), TcpState::Listen);

        let mut relaxed = TcpFsm::new(true);
        assert!(relaxed.check(TcpFlags::PSH_ACK, ToServer));
        assert_eq!(relaxed.state(), TcpState::Established);

        let mut from_syn_ack = TcpFsm::new(true);
        assert!(from_syn_ack.check(TcpFlags::SYN_ACK, ToClient));
        assert_eq!(from_syn_ack.state(), TcpState::SynRcvd);
    }

    // Test 5: RST closes from anywhere, stray SYN is rejected
    #[test]
    fn test_rst_and_stray_syn() {
        let mut fsm = TcpFsm::new(true);
        assert!(fsm.check(TcpFlags::ACK, ToServer));
        assert!(!fsm.check(TcpFlags::SYN, ToServer));
        assert_eq!(fsm.state(), TcpState::Established);
        assert!(fsm.check(TcpFlags::RST, ToClient));
        assert_eq!(fsm.state(), TcpState::Closed);
    }
}
