//! Parameter identifiers and request flags.

use bitflags::bitflags;

bitflags! {
    /// Flags carried by `ParamRequest`, `ParamValue` and `ParamUpdate`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ParamFlags: u32 {
        /// Address the process-wide value rather than the connection's own.
        const GLOBAL = 0x0001;
        /// Deliver change notifications caused by this connection to itself.
        const SELF = 0x0002;
        const GET = 0x0100;
        const SUBSCRIBE = 0x0200;
        const UNSUBSCRIBE = 0x0400;
    }
}

impl ParamFlags {
    pub fn is_global(self) -> bool {
        self.contains(Self::GLOBAL)
    }
}

/// Known parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ParamId {
    ServerVersion = 1,
    ClientPriority = 2,
    RetainDots = 3,
    DriverName = 4,
    DeviceModel = 5,
    /// Aggregate of [`ParamId::DisplayColumns`] and [`ParamId::DisplayRows`].
    DisplaySize = 6,
    DisplayColumns = 7,
    DisplayRows = 8,
    DeviceOnline = 9,
    CursorDots = 10,
    CursorBlinkPeriod = 11,
    ComputerBrailleCellSize = 12,
    LiteraryBraille = 13,
    ClipboardContent = 14,
    RenderedCells = 15,
}

impl ParamId {
    pub const ALL: [ParamId; 15] = [
        Self::ServerVersion,
        Self::ClientPriority,
        Self::RetainDots,
        Self::DriverName,
        Self::DeviceModel,
        Self::DisplaySize,
        Self::DisplayColumns,
        Self::DisplayRows,
        Self::DeviceOnline,
        Self::CursorDots,
        Self::CursorBlinkPeriod,
        Self::ComputerBrailleCellSize,
        Self::LiteraryBraille,
        Self::ClipboardContent,
        Self::RenderedCells,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.code() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip() {
        for id in ParamId::ALL {
            assert_eq!(ParamId::from_code(id.code()), Some(id));
        }
        assert_eq!(ParamId::from_code(0), None);
        assert_eq!(ParamId::from_code(999), None);
    }

    #[test]
    fn unknown_flag_bits_are_dropped() {
        let flags = ParamFlags::from_bits_truncate(0xFFFF_0000 | 0x0101);
        assert_eq!(flags, ParamFlags::GLOBAL | ParamFlags::GET);
    }
}
