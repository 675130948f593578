use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::{GatewayConfig, HalfSeconds};
use crate::protocol::MAX_PAYLOAD_LEN;
use crate::util::hex;
use super::charset::to_device_bytes;
use super::layout::{self, MAX_LINES};
use super::request::{ConfigRequest, ConfigSegment, ModeRecord};

/// Field value meaning "not set" in a mode record
pub const UNSET: u8 = 0xFF;

/// Longest string a text segment can carry (its length byte counts the NUL)
const MAX_TEXT_LEN: usize = u8::MAX as usize - 1;

/// Marker line that is not part of the page text
const SPECIAL_LINE_MARKER: &str = "{{";

/// Payload of one config frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFrame {
    /// Field the frame was built from
    pub key: String,
    /// Segment bytes, terminator included
    pub payload: Bytes,
    /// Wake value to send with the frame
    pub wakeup: HalfSeconds,
}

/// Everything produced from one config request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedConfig {
    /// Frames in transmission order; an app_value frame is always last
    pub frames: Vec<ConfigFrame>,
    /// Wakeup lists per alert state carried by mode records
    pub wakeup_tables: Vec<(u8, Vec<HalfSeconds>)>,
    /// Reassign delay, if the request moves the node between gateways
    pub reassign: Option<u32>,
}

impl EncodedConfig {
    /// Whether the request carried mode records
    pub fn has_modes(&self) -> bool {
        !self.wakeup_tables.is_empty()
    }
}

/// Turns config requests into display segments
#[derive(Debug, Clone)]
pub struct DisplayConfigEncoder {
    app_value_wakeup: HalfSeconds,
    default_wakeup_interval: HalfSeconds,
}

impl DisplayConfigEncoder {
    /// Creates an encoder using the gateway's wake values
    pub fn new(config: &GatewayConfig) -> Self {
        DisplayConfigEncoder {
            app_value_wakeup: config.app_value_wakeup,
            default_wakeup_interval: config.default_wakeup_interval,
        }
    }

    /// Encodes every field of `request`; fields that do not fit a frame are
    /// logged and skipped
    pub fn encode(&self, request: &ConfigRequest) -> EncodedConfig {
        let fields = request.fields();
        let mut encoded = EncodedConfig {
            reassign: fields.reassign(),
            ..EncodedConfig::default()
        };
        let mut app_value = None;

        for (key, segment) in fields.iter() {
            let mut buf = BytesMut::new();
            match segment {
                ConfigSegment::Screen { selector, text } => encode_screen(&mut buf, *selector, text),
                ConfigSegment::Name(name) => encode_name(&mut buf, name),
                ConfigSegment::Mode(record) => {
                    encode_mode(&mut buf, record);
                    let wakeups = match &record.wakeup {
                        Some(list) if !list.is_empty() => list.clone(),
                        _ => vec![self.default_wakeup_interval],
                    };
                    encoded.wakeup_tables.push((record.alert, wakeups));
                }
                ConfigSegment::AppValue(value) => {
                    app_value = Some((key.to_string(), *value));
                    continue;
                }
                ConfigSegment::Reassign(_) | ConfigSegment::Update => continue,
                ConfigSegment::Other(_) => {
                    debug!(key, "config field not encoded");
                    continue;
                }
            }
            end_screen(&mut buf);
            self.push_frame(&mut encoded, key, buf, HalfSeconds::ZERO);
        }

        // Sent last so the device does not switch context mid-update
        if let Some((key, value)) = app_value {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u8(b'A');
            buf.put_u8(value);
            end_screen(&mut buf);
            self.push_frame(&mut encoded, &key, buf, self.app_value_wakeup);
        }

        encoded
    }

    fn push_frame(&self, encoded: &mut EncodedConfig, key: &str, buf: BytesMut, wakeup: HalfSeconds) {
        if buf.len() > MAX_PAYLOAD_LEN {
            warn!(key, len = buf.len(), max = MAX_PAYLOAD_LEN, "config segment does not fit a frame, skipped");
            return;
        }
        debug!(key, payload = %hex(&buf), "encoded config segment");
        encoded.frames.push(ConfigFrame {
            key: key.to_string(),
            payload: buf.freeze(),
            wakeup,
        });
    }
}

fn put_text(buf: &mut BytesMut, tag: u8, text: &[u8]) {
    let text = &text[..text.len().min(MAX_TEXT_LEN)];
    buf.put_u8(tag);
    buf.put_u8(text.len() as u8 + 1);
    buf.put_slice(text);
    buf.put_u8(0);
}

fn select_page(buf: &mut BytesMut, page: u8) {
    buf.put_slice(&[b'S', page, b'R', 0]);
}

fn end_screen(buf: &mut BytesMut) {
    buf.put_slice(b"ES");
}

fn encode_name(buf: &mut BytesMut, name: &str) {
    select_page(buf, layout::NAME_PAGE);
    buf.put_slice(&[b'F', layout::FONT_REGULAR]);
    buf.put_slice(&[b'Y', layout::NAME_LABEL_Y]);
    put_text(buf, b'C', layout::NAME_LABEL.as_bytes());
    buf.put_slice(&[b'Y', layout::NAME_Y]);
    put_text(buf, b'C', &to_device_bytes(name));
    buf.put_slice(&[b'Y', layout::NAME_INSTRUCTION_Y]);
    put_text(buf, b'C', layout::NAME_INSTRUCTION.as_bytes());
}

/// Delay byte pair of a mode record: (low byte, high byte or `UNSET`).
///
/// The value is halved after clamping to at least 4, and the low byte never
/// takes the reserved value 255.
pub fn encode_delay(delay: u32) -> (u8, u8) {
    let halved = delay.max(4) >> 1;
    let (low, high) = if halved < 256 {
        (halved as u8, UNSET)
    } else {
        ((halved & 0xFF) as u8, ((halved >> 8) & 0xFF) as u8)
    };
    let low = if low == 255 { 254 } else { low };
    (low, high)
}

fn encode_mode(buf: &mut BytesMut, record: &ModeRecord) {
    let field = |value: Option<u8>| value.unwrap_or(UNSET);
    let (delay_value, delay_ms) = match record.delay_value {
        Some(delay) => encode_delay(delay),
        None => (UNSET, UNSET),
    };
    buf.put_u8(b'M');
    buf.put_slice(&[
        record.state,
        record.state,
        record.alert,
        field(record.double_left),
        field(record.single_left),
        UNSET,
        UNSET,
        field(record.single_right),
        field(record.double_right),
        field(record.app_value),
        field(record.app_state),
        delay_value,
        field(record.delay_state),
        delay_ms,
        UNSET,
        UNSET,
    ]);
}

fn encode_screen(buf: &mut BytesMut, selector: u8, text: &str) {
    select_page(buf, selector);

    let mut lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    if lines.first().map_or(false, |first| first.contains(SPECIAL_LINE_MARKER)) {
        lines.remove(0);
    }
    if lines.len() > MAX_LINES {
        warn!(selector, lines = lines.len(), "display text has too many lines, truncated");
        lines.truncate(MAX_LINES);
    }

    let line_count = lines.len();
    let mut first_split = None;
    for (index, line) in lines.iter().enumerate() {
        let y = layout::line_y(line_count, index);
        if line.contains('|') {
            first_split.get_or_insert(index);
            let mut halves = line.split('|');
            for side in [b'l', b'r'] {
                let (font, half) = font_and_text(halves.next().unwrap_or("").trim());
                buf.put_slice(&[b'F', font, b'Y', y]);
                put_text(buf, side, &to_device_bytes(half));
            }
        } else {
            let (font, line) = font_and_text(line);
            buf.put_slice(&[b'F', font, b'Y', y]);
            put_text(buf, b'C', &to_device_bytes(line));
        }
    }

    if let Some(boxes) = first_split.and_then(|split| layout::split_boxes(split, line_count)) {
        for b in boxes {
            buf.put_slice(&[b'X', b.x, b'Y', b.y, b'B', b.width, b.height]);
        }
    }
}

/// A leading `*` selects the bold font and is not displayed
fn font_and_text(text: &str) -> (u8, &str) {
    match text.strip_prefix('*') {
        Some(rest) => (layout::FONT_BOLD, rest),
        None => (layout::FONT_REGULAR, text),
    }
}
