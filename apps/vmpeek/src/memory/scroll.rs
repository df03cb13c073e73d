/// Rows of slack at either end of the scrollbar before a fetch is triggered.
pub const SCROLL_MARGIN: i64 = 4;

/// Scrollbar state as reported by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScrollPosition {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

impl ScrollPosition {
    pub fn new(value: i64, min: i64, max: i64) -> Self {
        Self { value, min, max }
    }

    pub fn near_top(&self) -> bool {
        self.value < self.min.saturating_add(SCROLL_MARGIN)
    }

    pub fn near_bottom(&self) -> bool {
        self.value > self.max.saturating_sub(SCROLL_MARGIN)
    }
}

/// How an arriving page joins the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Replace,
    Append,
    Prepend,
}

/// Decide placement from the scroll position captured when the read was issued,
/// then check it against the addresses. A page that does not touch the window at
/// the chosen end replaces it instead.
pub fn plan_placement(
    scroll: ScrollPosition,
    reset: bool,
    window: (u64, u64),
    page_addr: u64,
    page_len: u64,
) -> Placement {
    let (base, max) = window;
    if reset || base == max {
        return Placement::Replace;
    }
    let wanted = if scroll.near_bottom() {
        Placement::Append
    } else if scroll.near_top() {
        Placement::Prepend
    } else {
        Placement::Replace
    };
    match wanted {
        Placement::Append if page_addr == max => Placement::Append,
        Placement::Prepend if page_addr.checked_add(page_len) == Some(base) => Placement::Prepend,
        _ => Placement::Replace,
    }
}
