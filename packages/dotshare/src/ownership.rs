//! Exclusive raw/suspend access to the device.

use dot_proto::ErrorCode;

use crate::tty::ConnId;

/// Who, if anyone, holds the device exclusively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ownership {
    #[default]
    Free,
    RawHeld(ConnId),
    SuspendHeld(ConnId),
}

impl Ownership {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    pub fn raw_holder(&self) -> Option<ConnId> {
        match self {
            Self::RawHeld(id) => Some(*id),
            _ => None,
        }
    }

    pub fn enter_raw(&mut self, conn: ConnId) -> Result<(), ErrorCode> {
        if !self.is_free() {
            return Err(ErrorCode::DeviceBusy);
        }
        *self = Self::RawHeld(conn);
        Ok(())
    }

    pub fn enter_suspend(&mut self, conn: ConnId) -> Result<(), ErrorCode> {
        if !self.is_free() {
            return Err(ErrorCode::DeviceBusy);
        }
        *self = Self::SuspendHeld(conn);
        Ok(())
    }

    /// Release raw mode if `conn` holds it.
    pub fn leave_raw(&mut self, conn: ConnId) -> bool {
        if *self == Self::RawHeld(conn) {
            *self = Self::Free;
            return true;
        }
        false
    }

    /// Release suspend mode if `conn` holds it.
    pub fn leave_suspend(&mut self, conn: ConnId) -> bool {
        if *self == Self::SuspendHeld(conn) {
            *self = Self::Free;
            return true;
        }
        false
    }

    /// Release whatever `conn` holds and report what it was.
    pub fn release(&mut self, conn: ConnId) -> Ownership {
        match *self {
            Self::RawHeld(id) | Self::SuspendHeld(id) if id == conn => std::mem::take(self),
            _ => Self::Free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused() {
        let mut own = Ownership::default();
        own.enter_raw(1).unwrap();
        assert_eq!(own.enter_raw(2), Err(ErrorCode::DeviceBusy));
        assert_eq!(own.enter_suspend(2), Err(ErrorCode::DeviceBusy));
        assert_eq!(own, Ownership::RawHeld(1));
    }

    #[test]
    fn only_the_holder_releases() {
        let mut own = Ownership::default();
        own.enter_suspend(1).unwrap();
        assert!(!own.leave_suspend(2));
        assert!(!own.leave_raw(1));
        assert_eq!(own.release(2), Ownership::Free);
        assert_eq!(own.release(1), Ownership::SuspendHeld(1));
        assert!(own.is_free());
        own.enter_raw(2).unwrap();
        assert_eq!(own.raw_holder(), Some(2));
    }
}
