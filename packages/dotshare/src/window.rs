//! A connection's braille window.

use dot_driver::Geometry;
use dot_proto::{ErrorCode, WriteRequest};

use crate::cells;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrailleWindow {
    text: Vec<char>,
    and_mask: Vec<u8>,
    or_mask: Vec<u8>,
    /// Zero-based cell, or none when the cursor is off.
    cursor: Option<usize>,
    /// Set once the client has written anything.
    filled: bool,
}

impl BrailleWindow {
    pub fn new(geometry: Geometry) -> Self {
        let size = geometry.cells();
        Self {
            text: vec![' '; size],
            and_mask: vec![0xFF; size],
            or_mask: vec![0x00; size],
            cursor: None,
            filled: false,
        }
    }

    pub fn size(&self) -> usize {
        self.text.len()
    }

    pub fn is_filled(&self) -> bool {
        self.filled
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Reallocate blank if the display changed size. Returns whether it did.
    pub fn fit(&mut self, geometry: Geometry) -> bool {
        if self.size() == geometry.cells() {
            return false;
        }
        let filled = self.filled;
        *self = Self::new(geometry);
        self.filled = filled;
        true
    }

    /// Apply a `Write`. Everything is validated before anything changes.
    pub fn apply(&mut self, write: &WriteRequest) -> Result<(), ErrorCode> {
        let size = self.size();
        let (begin, len) = match write.region {
            Some((begin, len)) if begin >= 1 => (begin as usize - 1, len as usize),
            Some(_) => return Err(ErrorCode::InvalidParameter),
            None => (0, size),
        };
        if begin.checked_add(len).is_none_or(|end| end > size) {
            return Err(ErrorCode::InvalidParameter);
        }

        let text: Option<Vec<char>> = write.text.as_ref().map(|t| t.chars().collect());
        if text.as_ref().is_some_and(|t| t.len() > len) {
            return Err(ErrorCode::InvalidParameter);
        }
        for mask in [&write.and_mask, &write.or_mask].into_iter().flatten() {
            if mask.len() != len {
                return Err(ErrorCode::InvalidParameter);
            }
        }
        let cursor = match write.cursor {
            None | Some(-1) => self.cursor,
            Some(0) => None,
            Some(n) if n > 0 && n as usize <= size => Some(n as usize - 1),
            Some(_) => return Err(ErrorCode::InvalidParameter),
        };

        let region = begin..begin + len;
        if let Some(chars) = text {
            let padded = chars.into_iter().chain(std::iter::repeat(' '));
            for (slot, ch) in self.text[region.clone()].iter_mut().zip(padded) {
                *slot = ch;
            }
        }
        if let Some(mask) = &write.and_mask {
            self.and_mask[region.clone()].copy_from_slice(mask);
        }
        if let Some(mask) = &write.or_mask {
            self.or_mask[region].copy_from_slice(mask);
        }
        self.cursor = cursor;
        self.filled = true;
        Ok(())
    }

    /// Cells to put on the display. `cursor_dots` is overlaid on the cursor
    /// cell when `show_cursor` is set.
    pub fn render(&self, cell_size: u8, cursor_dots: u8, show_cursor: bool) -> Vec<u8> {
        let mut out: Vec<u8> = self
            .text
            .iter()
            .zip(self.and_mask.iter().zip(&self.or_mask))
            .map(|(&ch, (&and, &or))| (cells::text_to_cell(ch, cell_size) & and) | or)
            .collect();
        if show_cursor {
            if let Some(cell) = self.cursor.and_then(|c| out.get_mut(c)) {
                *cell |= cursor_dots;
            }
        }
        out
    }
}
