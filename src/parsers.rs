//! Line reassembly and the fixed family of glider-dialogue regex parsers.
//!
//! Ported from `dockserver_utils/bufferhandler.py`'s `BaseParser` family.
//! Every parser is line-anchored (matches from the start of the line) and
//! emits at most one event per line; non-matching lines emit nothing.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use time::{Date, Month, OffsetDateTime, Time};

/// One (key, value) emission from the parser list, keyed the way
/// `DialogueState::memory` keys its entries.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    VehicleName(String),
    GliderLabDos(String),
    GpsTime(i64),
    GpsLatLon(f64, f64),
    Menu,
    DisconnectEvent,
}

impl ParserEvent {
    /// The `memory` key this event is stored under, matching the original's
    /// `self.name` (the parser class name).
    pub fn key(&self) -> &'static str {
        match self {
            ParserEvent::VehicleName(_) => "VehicleNameParser",
            ParserEvent::GliderLabDos(_) => "GliderLABDOSParser",
            ParserEvent::GpsTime(_) => "GPSTimeParser",
            ParserEvent::GpsLatLon(..) => "GPSLatLonParser",
            ParserEvent::Menu => "MenuParser",
            ParserEvent::DisconnectEvent => "DisconnectEventParser",
        }
    }
}

fn vehicle_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Vehicle Name: (\w+)").unwrap())
}

fn glider_labdos_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Glider(LAB|DOS)").unwrap())
}

fn gps_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Curr Time: (\w+) (\w+) +(\d+) +(\d+):(\d+):(\d+) (\d+) MT: +(\d+)").unwrap()
    })
}

fn gps_latlon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^GPS Location: +(\d+\.\d+) N ([-]?\d+\.\d+) E measured +(\d+\.\d+) secs ago")
            .unwrap()
    })
}

fn menu_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Hit Control-R to RESUME the mission").unwrap())
}

fn disconnect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(surface_\d+: Waiting for final GPS fix\.|Megabytes available n CF file system)")
            .unwrap()
    })
}

fn month_from_abbrev(s: &str) -> Option<Month> {
    Some(match s {
        "Jan" => Month::January,
        "Feb" => Month::February,
        "Mar" => Month::March,
        "Apr" => Month::April,
        "May" => Month::May,
        "Jun" => Month::June,
        "Jul" => Month::July,
        "Aug" => Month::August,
        "Sep" => Month::September,
        "Oct" => Month::October,
        "Nov" => Month::November,
        "Dec" => Month::December,
        _ => return None,
    })
}

/// Run every line-anchored parser against `line` and return the first
/// match, in the fixed parser-list order specified in spec.md §4.3.
///
/// At most one parser ever matches a given line (the patterns are
/// mutually exclusive prefixes), so returning on first match is
/// observationally identical to running the whole list every time.
pub fn parse_line(line: &str) -> Option<ParserEvent> {
    if let Some(c) = vehicle_name_re().captures(line) {
        return Some(ParserEvent::VehicleName(c[1].to_string()));
    }
    if let Some(c) = glider_labdos_re().captures(line) {
        return Some(ParserEvent::GliderLabDos(c[1].to_string()));
    }
    if let Some(c) = gps_time_re().captures(line) {
        let _dow = &c[1];
        let month = month_from_abbrev(&c[2])?;
        let day: u8 = c[3].parse().ok()?;
        let hh: u8 = c[4].parse().ok()?;
        let mm: u8 = c[5].parse().ok()?;
        let ss: u8 = c[6].parse().ok()?;
        let year: i32 = c[7].parse().ok()?;
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms(hh, mm, ss).ok()?;
        let dt = OffsetDateTime::new_utc(date, time);
        return Some(ParserEvent::GpsTime(dt.unix_timestamp()));
    }
    if let Some(c) = gps_latlon_re().captures(line) {
        let lat: f64 = c[1].parse().ok()?;
        let lon: f64 = c[2].parse().ok()?;
        return Some(ParserEvent::GpsLatLon(lat, lon));
    }
    if menu_re().is_match(line) {
        return Some(ParserEvent::Menu);
    }
    if disconnect_re().is_match(line) {
        return Some(ParserEvent::DisconnectEvent);
    }
    None
}

/// Splits an incoming byte stream on `\n`, keeping a partial trailing line
/// buffered across calls. Mirrors `BufferHandler.clear_buffer()`.
#[derive(Default)]
pub struct LineAssembler {
    buffer: String,
    recent_lines: VecDeque<String>,
}

const RECENT_LINES_CAPACITY: usize = 5;

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            recent_lines: VecDeque::with_capacity(RECENT_LINES_CAPACITY),
        }
    }

    /// Append decoded text and drain every complete (`\n`-terminated) line.
    /// The terminator is discarded; a trailing partial line is retained for
    /// the next call.
    pub fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line = self.buffer[..idx].to_string();
            self.buffer.drain(..=idx);
            if self.recent_lines.len() == RECENT_LINES_CAPACITY {
                self.recent_lines.pop_front();
            }
            self.recent_lines.push_back(line.clone());
            lines.push(line);
        }
        lines
    }

    pub fn recent_lines(&self) -> impl Iterator<Item = &String> {
        self.recent_lines.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_name_banner() {
        let ev = parse_line("Vehicle Name: sebastian").unwrap();
        assert_eq!(ev, ParserEvent::VehicleName("sebastian".into()));
        assert_eq!(ev.key(), "VehicleNameParser");
    }

    #[test]
    fn glider_labdos() {
        assert_eq!(
            parse_line("GliderDOS:98").unwrap(),
            ParserEvent::GliderLabDos("DOS".into())
        );
        assert_eq!(
            parse_line("GliderLAB ready").unwrap(),
            ParserEvent::GliderLabDos("LAB".into())
        );
    }

    #[test]
    fn gps_time_parses_to_unix_epoch() {
        let ev = parse_line("Curr Time: Mon Jul  7 16:40:19 2025 MT:  176064").unwrap();
        assert_eq!(ev, ParserEvent::GpsTime(1751906419));
    }

    #[test]
    fn gps_latlon_raw_ddmm() {
        let ev =
            parse_line("GPS Location:  5231.957 N   718.577 E measured      1.856 secs ago")
                .unwrap();
        assert_eq!(ev, ParserEvent::GpsLatLon(5231.957, 718.577));
    }

    #[test]
    fn menu_prompt() {
        assert_eq!(
            parse_line("Hit Control-R to RESUME the mission"),
            Some(ParserEvent::Menu)
        );
    }

    #[test]
    fn disconnect_markers() {
        assert_eq!(
            parse_line("surface_3: Waiting for final GPS fix."),
            Some(ParserEvent::DisconnectEvent)
        );
        assert_eq!(
            parse_line("Megabytes available n CF file system"),
            Some(ParserEvent::DisconnectEvent)
        );
    }

    #[test]
    fn non_matching_line_emits_nothing() {
        assert_eq!(parse_line("some unrelated chatter"), None);
    }

    #[test]
    fn line_assembler_splits_and_buffers_partial() {
        let mut la = LineAssembler::new();
        let lines = la.feed("Vehicle Name: sebastian\nGliderDOS");
        assert_eq!(lines, vec!["Vehicle Name: sebastian".to_string()]);
        let lines = la.feed("\n");
        assert_eq!(lines, vec!["GliderDOS".to_string()]);
    }

    #[test]
    fn recent_lines_ring_caps_at_five() {
        let mut la = LineAssembler::new();
        for i in 0..8 {
            la.feed(&format!("line {i}\n"));
        }
        let recent: Vec<_> = la.recent_lines().cloned().collect();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0], "line 3");
        assert_eq!(recent[4], "line 7");
    }
}
