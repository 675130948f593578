//! Screen geometry of the display device

/// Most text lines a page can hold
pub const MAX_LINES: usize = 5;

/// Vertical start of each line, indexed by `[line_count - 1][line_index]`
pub const Y_STARTS: [[u8; MAX_LINES]; MAX_LINES] = [
    [38, 0, 0, 0, 0],
    [18, 56, 0, 0, 0],
    [4, 34, 64, 0, 0],
    [4, 26, 48, 70, 0],
    [0, 20, 40, 60, 80],
];

pub const FONT_REGULAR: u8 = 2;
pub const FONT_BOLD: u8 = 3;

/// Selector of the name page
pub const NAME_PAGE: u8 = 22;
pub const NAME_LABEL: &str = "Spur button";
pub const NAME_INSTRUCTION: &str = "Double-push to start";
pub const NAME_LABEL_Y: u8 = 10;
pub const NAME_Y: u8 = 40;
pub const NAME_INSTRUCTION_Y: u8 = 70;

/// Vertical start of the line at `index` on a page of `line_count` lines
pub fn line_y(line_count: usize, index: usize) -> u8 {
    if line_count == 0 || line_count > MAX_LINES || index >= line_count {
        return 0;
    }
    Y_STARTS[line_count - 1][index]
}

/// One rectangle: position, width and height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderBox {
    pub x: u8,
    pub y: u8,
    pub width: u8,
    pub height: u8,
}

/// Outer and inner border of the left and right boxes drawn around a split
/// line area, or `None` when the layout has no boxes.
///
/// Keyed by the first line containing a split and the page's line count.
pub fn split_boxes(first_split: usize, line_count: usize) -> Option<[BorderBox; 4]> {
    let (top, height) = match (first_split, line_count) {
        (0, _) => (0x01, 0x5C),
        (1, 4) => (0x18, 0x48),
        (2, 4) => (0x2E, 0x30),
        (3, 4) => (0x44, 0x18),
        (1, 3) => (0x1E, 0x40),
        (2, 3) => (0x44, 0x18),
        (1, 2) => (0x30, 0x2F),
        _ => return None,
    };
    Some([
        BorderBox { x: 0x01, y: top, width: 0x62, height },
        BorderBox { x: 0x02, y: top + 1, width: 0x60, height: height - 2 },
        BorderBox { x: 0x65, y: top, width: 0x62, height },
        BorderBox { x: 0x66, y: top + 1, width: 0x60, height: height - 2 },
    ])
}
