//! Paging cache over guest physical memory.
//!
//! The window holds one contiguous, row-aligned byte range `[base, max)`. Reads go
//! out through a [`PageSource`] which tags each one; only the page echoing the
//! newest tag is applied, so a superseded read can never scribble over the window.
//! Rendered rows are pushed to the presentation layer as [`WindowUpdate`]s.

mod highlight;
mod refresh;
mod render;
mod scroll;

pub use highlight::{HEX_SPAN_LEN, HighlightSpan, HighlightState, locate};
pub use refresh::{AUTO_REFRESH_INTERVAL, AutoRefresh};
pub use render::{
    CHAR_CELL_WIDTH, Endian, HEX_CELL_WIDTH, ROW_BYTES, RenderedRow, char_convert, format_address,
    render_row, render_rows,
};
pub use scroll::{Placement, SCROLL_MARGIN, ScrollPosition, plan_placement};

use crate::session::{PageArrival, SessionEvent};
use crate::telemetry::{self, PerfGuard};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use qmp_proto::CorrelationTag;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Exclusive upper bound of the address space.
pub const MAX_ADDR: u64 = 1 << 60;
pub const BLOCK_SIZE: u64 = 1024;
pub const MAX_WINDOW_ROWS: usize = 4096;
pub const SCROLL_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
    User,
    ScrollUp,
    ScrollDown,
    Refresh,
    Find,
}

/// What the window wanted when it issued a read, carried back with the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadIntent {
    /// The window was cleared for this read; the page replaces it.
    pub reset: bool,
    pub scroll: ScrollPosition,
    pub origin: ReadOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub addr: u64,
    pub size: u64,
    pub intent: ReadIntent,
}

/// Issues tagged memory reads. The session implements this; tests use fakes.
///
/// A read is two steps. `reserve_tag` runs inside the window's critical section and
/// makes the tag the only one the source will deliver from then on; `issue_read`
/// puts the read on the wire afterwards.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn reserve_tag(&self, request: ReadRequest) -> CorrelationTag;
    /// Returns false if nothing was sent.
    async fn issue_read(&self, tag: CorrelationTag, request: ReadRequest) -> bool;
}

#[derive(Debug, Clone)]
pub enum WindowUpdate {
    Rows {
        placement: Placement,
        first_address: u64,
        rows: Vec<RenderedRow>,
        /// Rows dropped from the opposite end to stay within the window limit.
        trimmed_rows: usize,
    },
    Cleared,
    Highlight(Option<HighlightSpan>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub base: u64,
    pub max: u64,
    pub scroll: ScrollPosition,
}

/// A normalized read: row-aligned, a whole number of rows, inside the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fetch {
    pub addr: u64,
    pub size: u64,
}

/// Parse an integer literal: decimal, or `0x`, `0o`, `0b` prefixed, optionally negative.
pub fn parse_int(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let lower = text.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    let value = i128::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}

/// Missing or negative addresses start at 0; missing or non-positive sizes read one
/// block. The address is rounded down and the size up to whole rows, then the size
/// is cut so the read ends at `MAX_ADDR` at the latest.
pub fn normalize(addr: Option<i128>, size: Option<i128>) -> Fetch {
    let row = ROW_BYTES as u64;
    let addr = addr.unwrap_or(0).clamp(0, i128::from(MAX_ADDR - 1)) as u64;
    let addr = addr - addr % row;
    let size = match size {
        Some(size) if size > 0 => size.min(i128::from(MAX_ADDR)) as u64,
        _ => BLOCK_SIZE,
    };
    let size = size.div_ceil(row) * row;
    Fetch {
        addr,
        size: size.min(MAX_ADDR - addr),
    }
}

#[derive(Debug, Default)]
struct WindowState {
    base: u64,
    max: u64,
    data: Vec<u8>,
    scroll: ScrollPosition,
    highlight: Option<HighlightState>,
    scroll_inflight: Option<Instant>,
    // A reset read whose page has not landed yet.
    outstanding_reset: Option<Fetch>,
    // The newest read; only its page is applied.
    awaiting: Option<(CorrelationTag, ReadRequest)>,
}

impl WindowState {
    fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.max
    }

    fn byte_at(&self, addr: u64) -> Option<u8> {
        let offset = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        self.data.get(offset).copied()
    }

    fn span_for(&self, addr: u64, endian: Endian) -> HighlightSpan {
        locate(self.base, addr, self.byte_at(addr), endian)
    }

    fn clear(&mut self, at: u64) {
        self.base = at;
        self.max = at;
        self.data.clear();
    }

    /// Keep at most `MAX_WINDOW_ROWS` rows, dropping whole rows from the end the
    /// page did not extend. Returns how many rows went.
    fn trim(&mut self, placement: Placement) -> usize {
        let limit = MAX_WINDOW_ROWS * ROW_BYTES;
        if self.data.len() <= limit {
            return 0;
        }
        let excess = self.data.len() - limit;
        let rows = excess.div_ceil(ROW_BYTES);
        match placement {
            Placement::Append => {
                let cut = (rows * ROW_BYTES).min(self.data.len());
                self.data.drain(..cut);
                self.base += cut as u64;
            }
            Placement::Prepend | Placement::Replace => self.data.truncate(limit),
        }
        self.max = self.base + self.data.len() as u64;
        rows
    }
}

pub struct MemoryWindow<S> {
    source: S,
    state: Mutex<WindowState>,
    endian: RwLock<Endian>,
    updates: mpsc::UnboundedSender<WindowUpdate>,
}

impl<S: PageSource> MemoryWindow<S> {
    pub fn new(source: S) -> (Self, mpsc::UnboundedReceiver<WindowUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let window = Self {
            source,
            state: Mutex::new(WindowState::default()),
            endian: RwLock::new(Endian::default()),
            updates,
        };
        (window, rx)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn endian(&self) -> Endian {
        *self.endian.read()
    }

    pub fn viewport(&self) -> Viewport {
        let state = self.state.lock();
        Viewport {
            base: state.base,
            max: state.max,
            scroll: state.scroll,
        }
    }

    /// Bytes currently materialized, starting at the viewport base.
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn rows(&self) -> Vec<RenderedRow> {
        let endian = self.endian();
        let state = self.state.lock();
        render_rows(state.base, &state.data, endian)
    }

    pub fn highlight(&self) -> Option<HighlightState> {
        self.state.lock().highlight
    }

    pub fn highlight_span(&self) -> Option<HighlightSpan> {
        let endian = self.endian();
        let state = self.state.lock();
        state
            .highlight
            .filter(|highlight| highlight.active && state.contains(highlight.target))
            .map(|highlight| state.span_for(highlight.target, endian))
    }

    fn emit(&self, update: WindowUpdate) {
        // A closed receiver means nobody renders; the window still tracks state.
        let _ = self.updates.send(update);
    }

    /// Fetch `size` bytes at `addr`. With `refresh`, or when the read starts before
    /// the window without touching it, the window is cleared and restarts at `addr`.
    pub async fn request(
        &self,
        addr: Option<i128>,
        size: Option<i128>,
        refresh: bool,
    ) -> Option<CorrelationTag> {
        self.fetch(normalize(addr, size), refresh, ReadOrigin::User)
            .await
    }

    /// Same as [`MemoryWindow::request`] with user-typed values; unparsable input
    /// falls back to the defaults.
    pub async fn request_text(
        &self,
        addr: &str,
        size: &str,
        refresh: bool,
    ) -> Option<CorrelationTag> {
        self.request(parse_int(addr), parse_int(size), refresh).await
    }

    /// Re-read everything currently materialized, or repeat a reset read that has
    /// not been answered yet.
    pub async fn refresh(&self) -> Option<CorrelationTag> {
        let fetch = {
            let state = self.state.lock();
            if state.max > state.base {
                normalize(
                    Some(i128::from(state.base)),
                    Some(i128::from(state.max - state.base)),
                )
            } else {
                state.outstanding_reset?
            }
        };
        self.fetch(fetch, true, ReadOrigin::Refresh).await
    }

    async fn fetch(&self, fetch: Fetch, refresh: bool, origin: ReadOrigin) -> Option<CorrelationTag> {
        let (tag, request) = {
            let mut state = self.state.lock();
            let touches_base = fetch.addr + fetch.size == state.base;
            let reset = refresh || (fetch.addr < state.base && !touches_base);
            if reset {
                state.clear(fetch.addr);
                state.outstanding_reset = Some(fetch);
                self.emit(WindowUpdate::Cleared);
                let range = fetch.addr..fetch.addr + fetch.size;
                if state
                    .highlight
                    .is_some_and(|highlight| !range.contains(&highlight.target))
                {
                    state.highlight = None;
                    self.emit(WindowUpdate::Highlight(None));
                }
            }
            let request = ReadRequest {
                addr: fetch.addr,
                size: fetch.size,
                intent: ReadIntent {
                    reset,
                    scroll: state.scroll,
                    origin,
                },
            };
            let tag = self.source.reserve_tag(request);
            state.awaiting = Some((tag, request));
            (tag, request)
        };

        if self.source.issue_read(tag, request).await {
            debug!(
                target: "vmpeek::window",
                addr = request.addr,
                size = request.size,
                reset = request.intent.reset,
                origin = ?origin,
                tag = %tag,
                "window fetch issued"
            );
            return Some(tag);
        }
        debug!(target: "vmpeek::window", addr = request.addr, "window fetch not sent");
        let mut state = self.state.lock();
        state.scroll_inflight = None;
        if state.awaiting.is_some_and(|(awaiting, _)| awaiting == tag) {
            state.awaiting = None;
        }
        None
    }

    /// Report a new scroll position. Near the top a preceding block is fetched (never
    /// below address 0); near the bottom the block at `max` is fetched. Further
    /// triggers are ignored while such a fetch is outstanding.
    pub async fn scroll_trigger(&self, position: ScrollPosition) -> Option<CorrelationTag> {
        let (fetch, origin) = {
            let mut state = self.state.lock();
            state.scroll = position;
            if state
                .scroll_inflight
                .is_some_and(|started| started.elapsed() < SCROLL_FETCH_TIMEOUT)
            {
                return None;
            }
            let plan = if position.near_top() && state.base > 0 {
                let size = BLOCK_SIZE.min(state.base);
                Some((
                    normalize(Some(i128::from(state.base - size)), Some(i128::from(size))),
                    ReadOrigin::ScrollUp,
                ))
            } else if position.near_bottom() && state.max < MAX_ADDR {
                Some((
                    normalize(Some(i128::from(state.max)), Some(i128::from(BLOCK_SIZE))),
                    ReadOrigin::ScrollDown,
                ))
            } else {
                None
            };
            if plan.is_some() {
                state.scroll_inflight = Some(Instant::now());
            }
            plan?
        };
        self.fetch(fetch, false, origin).await
    }

    /// Highlight `addr`. Inside the window the span is returned at once; otherwise a
    /// refreshing fetch of `size` bytes centered on `addr` is issued and the highlight
    /// is applied when that page lands.
    pub async fn find(&self, addr: u64, size: Option<u64>) -> Option<HighlightSpan> {
        let addr = addr.min(MAX_ADDR - 1);
        let endian = self.endian();
        {
            let mut state = self.state.lock();
            let was_active = state.highlight.is_some_and(|highlight| highlight.active);
            if state.contains(addr) {
                let span = state.span_for(addr, endian);
                state.highlight = Some(HighlightState {
                    target: addr,
                    active: true,
                    pending: false,
                });
                self.emit(WindowUpdate::Highlight(Some(span)));
                return Some(span);
            }
            state.highlight = Some(HighlightState {
                target: addr,
                active: false,
                pending: true,
            });
            if was_active {
                self.emit(WindowUpdate::Highlight(None));
            }
        }

        let size = size.filter(|size| *size > 0).unwrap_or(BLOCK_SIZE);
        let start = addr.saturating_sub(size / 2);
        let fetch = normalize(Some(i128::from(start)), Some(i128::from(size)));
        self.fetch(fetch, true, ReadOrigin::Find).await;
        None
    }

    pub async fn find_text(&self, addr: &str, size: Option<&str>) -> Option<HighlightSpan> {
        let Some(addr) = parse_int(addr) else {
            debug!(target: "vmpeek::window", input = addr, "ignoring unparsable find address");
            return None;
        };
        let addr = addr.clamp(0, i128::from(MAX_ADDR - 1)) as u64;
        let size = size
            .and_then(parse_int)
            .and_then(|size| u64::try_from(size).ok());
        self.find(addr, size).await
    }

    pub fn clear_highlight(&self) {
        if self.state.lock().highlight.take().is_some() {
            self.emit(WindowUpdate::Highlight(None));
        }
    }

    /// Switch byte order and re-render the materialized window.
    pub fn change_endianness(&self, endian: Endian) {
        {
            let mut current = self.endian.write();
            if *current == endian {
                return;
            }
            *current = endian;
        }
        let state = self.state.lock();
        if state.data.is_empty() {
            return;
        }
        self.emit(WindowUpdate::Rows {
            placement: Placement::Replace,
            first_address: state.base,
            rows: render_rows(state.base, &state.data, endian),
            trimmed_rows: 0,
        });
        if let Some(highlight) = state.highlight.filter(|highlight| highlight.active) {
            self.emit(WindowUpdate::Highlight(Some(
                state.span_for(highlight.target, endian),
            )));
        }
    }

    /// Apply a page if it answers the newest read. Stale or repeated pages leave the
    /// window untouched. Returns whether the page was applied.
    pub fn on_page_arrived(&self, arrival: &PageArrival) -> bool {
        let _perf = PerfGuard::new("window.apply_page");
        let endian = self.endian();
        let mut state = self.state.lock();
        let request = match state.awaiting {
            Some((tag, request)) if tag == arrival.tag => request,
            awaiting => {
                trace!(
                    target: "vmpeek::window",
                    tag = %arrival.tag,
                    awaiting = ?awaiting.map(|(tag, _)| tag),
                    "stale page ignored"
                );
                return false;
            }
        };
        state.awaiting = None;

        let take = arrival
            .bytes
            .len()
            .min(usize::try_from(request.size).unwrap_or(usize::MAX));
        let mut bytes = &arrival.bytes[..take];
        let placement = plan_placement(
            request.intent.scroll,
            request.intent.reset,
            (state.base, state.max),
            request.addr,
            bytes.len() as u64,
        );
        // A short page must not leave the bottom edge off a row boundary.
        if placement == Placement::Append {
            bytes = &bytes[..bytes.len() - bytes.len() % ROW_BYTES];
        }
        match placement {
            Placement::Replace => {
                state.base = request.addr;
                state.data = bytes.to_vec();
            }
            Placement::Append => state.data.extend_from_slice(bytes),
            Placement::Prepend => {
                let mut data = bytes.to_vec();
                data.extend_from_slice(&state.data);
                state.data = data;
                state.base = request.addr;
            }
        }
        state.max = state.base + state.data.len() as u64;
        let trimmed_rows = state.trim(placement);
        state.scroll_inflight = None;
        state.outstanding_reset = None;

        // Render only the part of the page that survived trimming.
        let (first_address, rows) = if placement == Placement::Replace {
            (state.base, render_rows(state.base, &state.data, endian))
        } else {
            let start = request.addr.max(state.base);
            let end = (request.addr + bytes.len() as u64).min(state.max);
            let from = (start - state.base) as usize;
            let to = (end.max(start) - state.base) as usize;
            (start, render_rows(start, &state.data[from..to], endian))
        };
        debug!(
            target: "vmpeek::window",
            tag = %arrival.tag,
            placement = ?placement,
            base = state.base,
            max = state.max,
            rows = rows.len(),
            trimmed_rows,
            "page applied"
        );
        telemetry::record_level("window.rows", (state.data.len() / ROW_BYTES) as u64);
        self.emit(WindowUpdate::Rows {
            placement,
            first_address,
            rows,
            trimmed_rows,
        });

        if let Some(mut highlight) = state.highlight {
            if state.contains(highlight.target) {
                highlight.active = true;
                highlight.pending = false;
                state.highlight = Some(highlight);
                let span = state.span_for(highlight.target, endian);
                self.emit(WindowUpdate::Highlight(Some(span)));
            } else if highlight.pending || highlight.active {
                state.highlight = None;
                self.emit(WindowUpdate::Highlight(None));
            }
        }
        true
    }

    /// Feed pages from a session subscription into the window until the task is
    /// aborted or the subscription closes.
    pub fn spawn_page_pump(
        self: &Arc<Self>,
        mut pages: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()>
    where
        S: 'static,
    {
        let window = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match pages.recv().await {
                    Ok(SessionEvent::MemoryPage(arrival)) => {
                        window.on_page_arrived(&arrival);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "vmpeek::window", skipped, "page subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
