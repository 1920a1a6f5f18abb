//! Text to braille cell lookup.
//!
//! Cells use the usual dot bit layout: dot 1 is bit 0 through dot 8 at bit 7.
//! ASCII goes through the North American computer braille table, with dot 7
//! marking capitals. Characters from the Unicode braille block map straight
//! to their dots. Anything else shows as a full cell.

pub const DOT7: u8 = 0x40;
pub const DOT8: u8 = 0x80;

/// Braille ASCII, indexed by six-dot pattern.
const BRAILLE_ASCII: &[u8; 64] =
    b" A1B'K2L@CIF/MSP\"E3H9O6R^DJG>NTQ,*5<-U8V.%[$+X!&;:4\\0Z7(_?W]#Y)=";

const UNICODE_BRAILLE: u32 = 0x2800;
const UNKNOWN_CELL: u8 = 0xFF;

/// Cell for one character.
pub fn text_to_cell(ch: char, cell_size: u8) -> u8 {
    let code = ch as u32;
    let cell = if (UNICODE_BRAILLE..UNICODE_BRAILLE + 0x100).contains(&code) {
        (code - UNICODE_BRAILLE) as u8
    } else if ch.is_ascii() {
        let upper = ch.to_ascii_uppercase();
        match BRAILLE_ASCII.iter().position(|&b| b == upper as u8) {
            Some(dots) if ch.is_ascii_uppercase() => dots as u8 | DOT7,
            Some(dots) => dots as u8,
            None => UNKNOWN_CELL,
        }
    } else {
        UNKNOWN_CELL
    };

    if cell_size == 6 {
        cell & !(DOT7 | DOT8)
    } else {
        cell
    }
}

/// Character a cell stands for, falling back to the Unicode braille block.
pub fn cell_to_char(cell: u8) -> char {
    if cell & DOT8 == 0 {
        let ascii = BRAILLE_ASCII[usize::from(cell & 0x3F)] as char;
        if cell & DOT7 == 0 {
            return ascii.to_ascii_lowercase();
        }
        if ascii.is_ascii_alphabetic() {
            return ascii;
        }
    }
    char::from_u32(UNICODE_BRAILLE + u32::from(cell)).unwrap_or(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_letters() {
        assert_eq!(text_to_cell(' ', 8), 0);
        assert_eq!(text_to_cell('a', 8), 0x01);
        assert_eq!(text_to_cell('A', 8), 0x41);
        assert_eq!(text_to_cell('A', 6), 0x01);
        assert_eq!(text_to_cell('l', 8), 0x07);
    }

    #[test]
    fn unicode_braille_passes_through() {
        assert_eq!(text_to_cell('\u{28FF}', 8), 0xFF);
        assert_eq!(text_to_cell('\u{2809}', 8), 0x09);
        assert_eq!(text_to_cell('é', 8), 0xFF);
    }

    #[test]
    fn cells_back_to_chars() {
        assert_eq!(cell_to_char(0x01), 'a');
        assert_eq!(cell_to_char(0x41), 'A');
        assert_eq!(cell_to_char(0x02), '1');
        assert_eq!(cell_to_char(0x00), ' ');
        assert_eq!(cell_to_char(0x81), '\u{2881}');
        assert_eq!(cell_to_char(0x42), '\u{2842}');
    }
}
