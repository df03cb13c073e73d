use super::render::{CHAR_CELL_WIDTH, Endian, HEX_CELL_WIDTH, ROW_BYTES, is_escape};

/// Characters selected in the hex column: `0xNN` without the separator.
pub const HEX_SPAN_LEN: usize = 4;

/// Where an address lands in the rendered window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightSpan {
    pub address: u64,
    /// Row index counted from the window base.
    pub row: usize,
    pub hex_offset: usize,
    pub hex_len: usize,
    pub char_offset: usize,
    pub char_len: usize,
}

/// The highlight a window is tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightState {
    pub target: u64,
    pub active: bool,
    /// Waiting for a fetch that will bring `target` into the window.
    pub pending: bool,
}

/// Locate `address` in a window starting at `base`. `byte` is the value stored there,
/// when known, and only decides whether the character span covers an escape.
pub fn locate(base: u64, address: u64, byte: Option<u8>, endian: Endian) -> HighlightSpan {
    let delta = address.saturating_sub(base);
    let row = (delta / ROW_BYTES as u64) as usize;
    let index = (delta % ROW_BYTES as u64) as usize;
    let cell = match endian {
        Endian::Big => index,
        Endian::Little => ROW_BYTES - 1 - index,
    };
    HighlightSpan {
        address,
        row,
        hex_offset: cell * HEX_CELL_WIDTH,
        hex_len: HEX_SPAN_LEN,
        char_offset: cell * CHAR_CELL_WIDTH,
        char_len: if byte.is_some_and(is_escape) { 2 } else { 1 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::render::render_row;

    #[test]
    fn offsets_follow_endianness() {
        let little = locate(0x1000, 0x1007, Some(b'A'), Endian::Little);
        assert_eq!(little.row, 0);
        assert_eq!(little.hex_offset, 40);
        assert_eq!(little.char_offset, 24);

        let big = locate(0x1000, 0x1007, Some(b'A'), Endian::Big);
        assert_eq!(big.hex_offset, 35);
        assert_eq!(big.char_offset, 21);
        assert_eq!(big.char_len, 1);
    }

    #[test]
    fn rows_count_from_the_base() {
        let span = locate(0x1000, 0x1035, None, Endian::Big);
        assert_eq!(span.row, 3);
        assert_eq!(span.hex_offset, 5 * HEX_CELL_WIDTH);
    }

    #[test]
    fn escapes_select_two_characters() {
        for byte in [0u8, 9, 10] {
            assert_eq!(locate(0, 3, Some(byte), Endian::Little).char_len, 2);
        }
        assert_eq!(locate(0, 3, Some(b'.'), Endian::Little).char_len, 1);
    }

    #[test]
    fn span_points_at_the_rendered_cell() {
        let bytes: Vec<u8> = (0x40..0x50).collect();
        for endian in [Endian::Little, Endian::Big] {
            let row = render_row(0x2000, &bytes, endian);
            let span = locate(0x2000, 0x2009, Some(bytes[9]), endian);
            assert_eq!(
                &row.hex[span.hex_offset..span.hex_offset + span.hex_len],
                "0x49"
            );
            assert_eq!(
                &row.chars[span.char_offset..span.char_offset + span.char_len],
                "I"
            );
        }
    }
}
