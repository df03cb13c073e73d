use clap::ValueEnum;
use std::borrow::Cow;
use std::fmt::Write as _;

pub const ROW_BYTES: usize = 16;
/// Columns taken by one hex cell: `0xNN` plus a separator.
pub const HEX_CELL_WIDTH: usize = 5;
/// Columns taken by one character cell, padded.
pub const CHAR_CELL_WIDTH: usize = 3;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// Printable form of one byte. Escapes take two columns, everything else one.
pub fn char_convert(byte: u8) -> Cow<'static, str> {
    match byte {
        0 => Cow::Borrowed("\\0"),
        9 => Cow::Borrowed("\\t"),
        10 => Cow::Borrowed("\\n"),
        32..=126 => Cow::Owned(char::from(byte).to_string()),
        _ => Cow::Borrowed("."),
    }
}

pub fn is_escape(byte: u8) -> bool {
    matches!(byte, 0 | 9 | 10)
}

pub fn format_address(address: u64) -> String {
    format!("0x{address:08x}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRow {
    pub address: u64,
    pub hex: String,
    pub chars: String,
}

/// Render up to 16 bytes starting at `address`.
///
/// Little-endian rows are mirrored: byte 0 lands in the last cell. A short row is
/// padded on the side where its missing bytes would be, so cell positions stay
/// where a full row would put them.
pub fn render_row(address: u64, bytes: &[u8], endian: Endian) -> RenderedRow {
    let bytes = &bytes[..bytes.len().min(ROW_BYTES)];
    let mut hex = String::with_capacity(ROW_BYTES * HEX_CELL_WIDTH);
    let mut chars = String::with_capacity(ROW_BYTES * CHAR_CELL_WIDTH);

    if endian == Endian::Little {
        let missing = ROW_BYTES - bytes.len();
        hex.push_str(&" ".repeat(missing * HEX_CELL_WIDTH));
        chars.push_str(&" ".repeat(missing * CHAR_CELL_WIDTH));
    }

    let mut push_cell = |byte: u8| {
        let _ = write!(hex, "0x{byte:02x} ");
        let _ = write!(chars, "{:<width$}", char_convert(byte), width = CHAR_CELL_WIDTH);
    };
    match endian {
        Endian::Big => bytes.iter().copied().for_each(&mut push_cell),
        Endian::Little => bytes.iter().rev().copied().for_each(&mut push_cell),
    }

    RenderedRow {
        address,
        hex,
        chars,
    }
}

/// Render `data` as consecutive rows starting at the row-aligned `base`.
pub fn render_rows(base: u64, data: &[u8], endian: Endian) -> Vec<RenderedRow> {
    data.chunks(ROW_BYTES)
        .enumerate()
        .map(|(index, chunk)| render_row(base + (index * ROW_BYTES) as u64, chunk, endian))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_cells(row: &RenderedRow) -> Vec<u8> {
        row.hex
            .split_whitespace()
            .map(|cell| u8::from_str_radix(cell.trim_start_matches("0x"), 16).unwrap())
            .collect()
    }

    #[test]
    fn char_mapping_is_total() {
        for byte in 0..=u8::MAX {
            let shown = char_convert(byte);
            let expected: String = match byte {
                0 => "\\0".into(),
                9 => "\\t".into(),
                10 => "\\n".into(),
                32..=126 => char::from(byte).to_string(),
                _ => ".".into(),
            };
            assert_eq!(shown, expected, "byte {byte}");
        }
        assert_eq!(char_convert(127), ".");
        assert_eq!(char_convert(b' '), " ");
    }

    #[test]
    fn big_endian_keeps_natural_order() {
        let data: Vec<u8> = (0..32).collect();
        let rows = render_rows(0x2000, &data, Endian::Big);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].address, 0x2010);
        let rendered: Vec<u8> = rows.iter().flat_map(hex_cells).collect();
        assert_eq!(rendered, data);
        assert!(rows[0].hex.starts_with("0x00 0x01 "));
    }

    #[test]
    fn little_endian_reverses_each_row() {
        let data: Vec<u8> = (100..140).collect();
        let rows = render_rows(0, &data, Endian::Little);
        let recovered: Vec<u8> = rows
            .iter()
            .flat_map(|row| {
                let mut cells = hex_cells(row);
                cells.reverse();
                cells
            })
            .collect();
        assert_eq!(recovered, data);
        assert!(rows[0].hex.starts_with("0x73 "));
    }

    #[test]
    fn short_little_endian_row_is_right_aligned() {
        let row = render_row(0x30, &[b'a', 0, b'b'], Endian::Little);
        assert_eq!(row.hex.len(), ROW_BYTES * HEX_CELL_WIDTH);
        assert_eq!(row.chars.len(), ROW_BYTES * CHAR_CELL_WIDTH);
        assert!(row.hex.ends_with("0x62 0x00 0x61 "));
        assert!(row.chars.ends_with("b  \\0 a  "));

        let big = render_row(0x30, &[b'a', 0, b'b'], Endian::Big);
        assert_eq!(big.hex, "0x61 0x00 0x62 ");
        assert_eq!(big.chars, "a  \\0 b  ");
    }

    #[test]
    fn addresses_are_zero_padded() {
        assert_eq!(format_address(0x1000), "0x00001000");
        assert_eq!(format_address(0x1_0000_0000), "0x100000000");
    }
}
