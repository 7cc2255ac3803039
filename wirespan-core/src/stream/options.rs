//! TCP option consistency checks.

use etherparse::TcpOptionElement;
use thiserror::Error;

use super::Direction;
use crate::protocol::TcpSegment;

/// Largest window shift RFC 7323 allows.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Segments may exceed the announced MSS when the capturing host
/// coalesces them (GRO/LRO); allow up to this many MSS per segment.
pub const OFFLOAD_FACTOR: usize = 64;

/// Why a segment's options were refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionViolation {
    #[error("{option} option outside a SYN segment")]
    OutsideSyn { option: &'static str },

    #[error("MSS of zero announced")]
    ZeroMss,

    #[error("window scale {0} above 14")]
    ScaleTooLarge(u8),

    #[error("payload of {len} bytes exceeds announced MSS {mss}")]
    PayloadTooLarge { len: usize, mss: u16 },
}

/// What each side announced in its SYN.
#[derive(Debug, Clone, Default)]
pub struct TcpOptionCheck {
    mss: [Option<u16>; 2],
    scale: [Option<u8>; 2],
}

impl TcpOptionCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vet `segment` travelling in `dir`, recording SYN announcements.
    pub fn accept(&mut self, segment: &TcpSegment<'_>, dir: Direction) -> Result<(), OptionViolation> {
        let syn = segment.flags.syn();
        let mut mss = None;
        let mut scale = None;

        for option in segment.option_elements() {
            match option {
                TcpOptionElement::MaximumSegmentSize(value) => {
                    if !syn {
                        return Err(OptionViolation::OutsideSyn { option: "MSS" });
                    }
                    if value == 0 {
                        return Err(OptionViolation::ZeroMss);
                    }
                    mss = Some(value);
                }
                TcpOptionElement::WindowScale(shift) => {
                    if !syn {
                        return Err(OptionViolation::OutsideSyn {
                            option: "window scale",
                        });
                    }
                    if shift > MAX_WINDOW_SCALE {
                        return Err(OptionViolation::ScaleTooLarge(shift));
                    }
                    scale = Some(shift);
                }
                _ => {}
            }
        }

        if syn {
            let side = dir.index();
            self.mss[side] = mss;
            self.scale[side] = scale;
            return Ok(());
        }

        // The receiver's announcement bounds what the sender may put on the wire.
        if let Some(limit) = self.mss[dir.reverse().index()] {
            let len = segment.payload.len();
            if len > limit as usize * OFFLOAD_FACTOR {
                return Err(OptionViolation::PayloadTooLarge { len, mss: limit });
            }
        }
        Ok(())
    }

    /// Window scale announced by the sender of `dir`, if any.
    pub fn window_scale(&self, dir: Direction) -> Option<u8> {
        self.scale[dir.index()]
    }

    /// MSS announced by the sender of `dir`, if any.
    pub fn mss(&self, dir: Direction) -> Option<u16> {
        self.mss[dir.index()]
    }
}
