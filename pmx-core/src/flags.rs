//! Frame header flags.

use bitflags::bitflags;

bitflags! {
    /// Per-frame flags carried in the header.
    ///
    /// Only `CommandResponse` frames set flags today; every other variant
    /// is written with `NONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolFlags: u16 {
        const NONE = 0;
        /// The frame ends its command stream.
        const FINAL = 1 << 0;
        /// The command ended because it was cancelled.
        const CANCELLED = 1 << 1;
        /// The command ended with a handler error.
        const FAULTED = 1 << 2;
    }
}

impl ProtocolFlags {
    /// Returns `true` if this frame ends a command stream.
    pub fn is_final(self) -> bool {
        self.contains(ProtocolFlags::FINAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_retained() {
        // Newer peers may set bits this build does not know about.
        let flags = ProtocolFlags::from_bits_retain(0x8001);
        assert!(flags.is_final());
        assert_eq!(flags.bits(), 0x8001);
    }

    #[test]
    fn final_cancelled_combination() {
        let flags = ProtocolFlags::FINAL | ProtocolFlags::CANCELLED;
        assert!(flags.is_final());
        assert!(!flags.contains(ProtocolFlags::FAULTED));
        assert!(!ProtocolFlags::NONE.is_final());
    }
}
