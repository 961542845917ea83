//! Port range to `(port, mask)` expansion for the u32 classifier.
//!
//! The u32 classifier matches ports by value and mask, so a range is covered
//! by aligned power-of-two blocks. Starting at the lower bound, each block is
//! widened while it stays aligned and ends at or below the upper bound.
//!
//! ```text
//! 1-65534 → 1/0xffff 2/0xfffe 4/0xfffc ... 32768/0xc000 49152/0xe000 ... 65534/0xffff
//! ```

use super::PortRange;
use serde::{Deserialize, Serialize};

/// A block of ports matched with `match ip dport <port> <mask>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMask {
    pub port: u16,
    pub mask: u16,
}

impl PortMask {
    pub fn matches(&self, port: u16) -> bool {
        port & self.mask == self.port & self.mask
    }

    /// Number of ports in the block.
    pub fn size(&self) -> u32 {
        u32::from(!self.mask) + 1
    }

    /// Last port of the block.
    pub fn last(&self) -> u16 {
        self.port | !self.mask
    }
}

/// Expands `range` into the minimal sequence of aligned port blocks.
pub fn port_masks(range: PortRange) -> Vec<PortMask> {
    let to = u32::from(range.to);
    let mut base = u32::from(range.from);
    let mut masks = Vec::new();

    while base <= to {
        let mut mask: u32 = 0xffff;
        loop {
            let wider = (mask << 1) & 0xffff;
            if wider == 0 {
                break;
            }
            let span = (!wider & 0xffff) + 1;
            if base & !wider & 0xffff != 0 || base + span - 1 > to {
                break;
            }
            mask = wider;
        }
        // Both values fit in 16 bits: `base <= to <= u16::MAX`.
        masks.push(PortMask {
            port: base as u16,
            mask: mask as u16,
        });
        base += (!mask & 0xffff) + 1;
    }
    masks
}
