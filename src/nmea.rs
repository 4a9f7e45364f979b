// src/nmea.rs
//
// NMEA 0183 sentence decoding for GPS receivers.
// Picks RMC and GGA sentences (any talker: GN, GP, GL, GA, BD) out of a
// decoded text stream and renders each as the raw line followed by a
// label/value block. Field positions are fixed by comma index.

use chrono::{NaiveDate, NaiveTime, Timelike};

use crate::io::ParseError;

/// Knots to km/h
const KNOTS_TO_KMH: f64 = 1.852;

/// Unterminated text longer than this is not an NMEA sentence (max is 82)
const MAX_PENDING_LINE: usize = 1024;

// ============================================================================
// Parser Trait
// ============================================================================

/// Pluggable decoder that derives structured text from a channel's stream.
pub trait SentenceParser: Send {
    /// Feed decoded text. Returns rendered records for every recognized
    /// sentence completed by this chunk, or `None` when there are none.
    fn parse(&mut self, text: &str) -> Option<String>;

    /// Drop any partial line carried between chunks.
    fn reset(&mut self);
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentenceKind {
    Rmc,
    Gga,
}

impl SentenceKind {
    pub fn tag(self) -> &'static str {
        match self {
            SentenceKind::Rmc => "RMC",
            SentenceKind::Gga => "GGA",
        }
    }
}

/// Recommended minimum data (RMC)
#[derive(Clone, Debug, PartialEq)]
pub struct RmcFix {
    pub time: NaiveTime,
    pub date: NaiveDate,
    /// Decimal degrees, north positive
    pub latitude: f64,
    /// Decimal degrees, east positive
    pub longitude: f64,
    pub speed_kmh: f64,
    pub course_deg: Option<f64>,
}

/// Fix data (GGA)
#[derive(Clone, Debug, PartialEq)]
pub struct GgaFix {
    pub time: NaiveTime,
    pub latitude: f64,
    pub longitude: f64,
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub altitude_m: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NmeaRecord {
    Rmc(RmcFix),
    Gga(GgaFix),
    /// Well-formed sentence without a usable fix
    Status { kind: SentenceKind, detail: String },
    /// Sentence whose fields could not be decoded
    Invalid { kind: SentenceKind, reason: String },
}

impl NmeaRecord {
    pub fn kind(&self) -> SentenceKind {
        match self {
            NmeaRecord::Rmc(_) => SentenceKind::Rmc,
            NmeaRecord::Gga(_) => SentenceKind::Gga,
            NmeaRecord::Status { kind, .. } | NmeaRecord::Invalid { kind, .. } => *kind,
        }
    }

    pub fn is_fix(&self) -> bool {
        matches!(self, NmeaRecord::Rmc(_) | NmeaRecord::Gga(_))
    }

    /// Multi-line block for fixes, one line for status and invalid markers
    pub fn render(&self) -> String {
        match self {
            NmeaRecord::Rmc(fix) => {
                let course = fix
                    .course_deg
                    .map(|c| format!("{:.1}°", c))
                    .unwrap_or_else(|| "-".to_string());
                format!(
                    "[RMC] Position fix\n  Time:       {} UTC\n  Date:       {}\n  Latitude:   {:.6}°\n  Longitude:  {:.6}°\n  Speed:      {:.2} km/h\n  Course:     {}",
                    format_time(fix.time),
                    fix.date.format("%Y-%m-%d"),
                    fix.latitude,
                    fix.longitude,
                    fix.speed_kmh,
                    course
                )
            }
            NmeaRecord::Gga(fix) => {
                format!(
                    "[GGA] Position fix\n  Time:       {} UTC\n  Latitude:   {:.6}°\n  Longitude:  {:.6}°\n  Fix:        {} ({})\n  Satellites: {}\n  HDOP:       {}\n  Altitude:   {}",
                    format_time(fix.time),
                    fix.latitude,
                    fix.longitude,
                    fix.fix_quality,
                    fix_quality_name(fix.fix_quality),
                    fix.satellites,
                    fix.hdop.map(|h| format!("{:.1}", h)).unwrap_or_else(|| "-".to_string()),
                    fix.altitude_m
                        .map(|a| format!("{:.1} m", a))
                        .unwrap_or_else(|| "-".to_string()),
                )
            }
            NmeaRecord::Status { kind, detail } => format!("[{}] Status: {}", kind.tag(), detail),
            NmeaRecord::Invalid { kind, reason } => {
                format!("[{}] Invalid sentence: {}", kind.tag(), reason)
            }
        }
    }
}

/// A recognized line and what it decoded to
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSentence {
    pub raw: String,
    pub record: NmeaRecord,
}

impl ParsedSentence {
    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.raw, self.record.render())
    }
}

fn format_time(time: NaiveTime) -> String {
    format!("{:02}:{:02}:{:02}", time.hour(), time.minute(), time.second())
}

fn fix_quality_name(quality: u8) -> &'static str {
    match quality {
        0 => "invalid",
        1 => "GPS",
        2 => "DGPS",
        3 => "PPS",
        4 => "RTK fixed",
        5 => "RTK float",
        6 => "estimated",
        7 => "manual",
        8 => "simulation",
        _ => "unknown",
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Streaming RMC/GGA parser. Carries an unterminated line between chunks.
#[derive(Debug, Default)]
pub struct NmeaParser {
    pending: String,
    verify_checksum: bool,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject sentences whose `*hh` checksum does not match
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Feed text and return every recognized sentence it completes.
    pub fn parse_records(&mut self, text: &str) -> Vec<ParsedSentence> {
        self.pending.push_str(text);

        let mut lines: Vec<String> = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.pending[consumed..].find('\n') {
            lines.push(self.pending[consumed..consumed + pos].to_string());
            consumed += pos + 1;
        }

        // A trailing fragment that already carries its checksum is complete
        let rest = self.pending[consumed..].trim_end_matches('\r');
        if ends_with_checksum(rest) {
            lines.push(rest.to_string());
            consumed = self.pending.len();
        }
        self.pending.drain(..consumed);

        if self.pending.len() > MAX_PENDING_LINE {
            self.pending.clear();
        }

        lines
            .iter()
            .filter_map(|line| self.parse_line(line.trim_end_matches('\r')))
            .collect()
    }

    /// Decode one line. `None` when it holds no RMC/GGA sentence.
    pub fn parse_line(&self, line: &str) -> Option<ParsedSentence> {
        let start = line.find('$')?;
        let sentence = line[start..].trim_end();
        let kind = sentence_kind(sentence)?;

        let record = match self.decode(kind, sentence) {
            Ok(record) => record,
            Err(e) => NmeaRecord::Invalid {
                kind,
                reason: e.to_string(),
            },
        };
        Some(ParsedSentence {
            raw: sentence.to_string(),
            record,
        })
    }

    fn decode(&self, kind: SentenceKind, sentence: &str) -> Result<NmeaRecord, ParseError> {
        let body = match sentence.rfind('*') {
            Some(star) => {
                if self.verify_checksum {
                    verify_checksum(&sentence[1..star], &sentence[star + 1..])?;
                }
                &sentence[1..star]
            }
            None => &sentence[1..],
        };
        let fields: Vec<&str> = body.split(',').collect();
        match kind {
            SentenceKind::Rmc => decode_rmc(&fields),
            SentenceKind::Gga => decode_gga(&fields),
        }
    }
}

impl SentenceParser for NmeaParser {
    fn parse(&mut self, text: &str) -> Option<String> {
        let records = self.parse_records(text);
        if records.is_empty() {
            return None;
        }
        Some(records.iter().map(ParsedSentence::render).collect())
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}

// ============================================================================
// Field Decoding
// ============================================================================

/// `$ttRMC,` / `$ttGGA,` with a two-letter alphabetic talker id
fn sentence_kind(sentence: &str) -> Option<SentenceKind> {
    let header = sentence.get(1..7)?;
    if !header.is_ascii() {
        return None;
    }
    let (talker, rest) = header.split_at(2);
    if !talker.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    match rest {
        "RMC," => Some(SentenceKind::Rmc),
        "GGA," => Some(SentenceKind::Gga),
        _ => None,
    }
}

fn ends_with_checksum(line: &str) -> bool {
    let bytes = line.as_bytes();
    line.contains('$')
        && bytes.len() >= 3
        && bytes[bytes.len() - 3] == b'*'
        && bytes[bytes.len() - 2..].iter().all(|b| b.is_ascii_hexdigit())
}

fn verify_checksum(body: &str, checksum: &str) -> Result<(), ParseError> {
    let expected = u8::from_str_radix(checksum.trim(), 16)
        .map_err(|_| ParseError::field("checksum", checksum))?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if expected != actual {
        return Err(ParseError::Checksum { expected, actual });
    }
    Ok(())
}

fn field<'a>(fields: &[&'a str], index: usize) -> Result<&'a str, ParseError> {
    fields
        .get(index)
        .map(|f| f.trim())
        .ok_or(ParseError::Truncated(fields.len()))
}

fn decode_rmc(fields: &[&str]) -> Result<NmeaRecord, ParseError> {
    // id,time,status,lat,N/S,lon,E/W,speed,course,date[,variation,E/W]
    if fields.len() < 10 {
        return Err(ParseError::Truncated(fields.len()));
    }
    let status = field(fields, 2)?;
    if status != "A" {
        let shown = if status.is_empty() { "empty" } else { status };
        return Ok(NmeaRecord::Status {
            kind: SentenceKind::Rmc,
            detail: format!("no valid fix (status {})", shown),
        });
    }

    let time = parse_time(field(fields, 1)?)?;
    let latitude = parse_coordinate(field(fields, 3)?, field(fields, 4)?, 'N', 'S', 90.0, "latitude")?;
    let longitude = parse_coordinate(field(fields, 5)?, field(fields, 6)?, 'E', 'W', 180.0, "longitude")?;
    let speed_knots = parse_optional_f64(field(fields, 7)?, "speed")?.unwrap_or(0.0);
    let course_deg = parse_optional_f64(field(fields, 8)?, "course")?;
    let date = parse_date(field(fields, 9)?)?;

    Ok(NmeaRecord::Rmc(RmcFix {
        time,
        date,
        latitude,
        longitude,
        speed_kmh: speed_knots * KNOTS_TO_KMH,
        course_deg,
    }))
}

fn decode_gga(fields: &[&str]) -> Result<NmeaRecord, ParseError> {
    // id,time,lat,N/S,lon,E/W,quality,satellites,hdop,altitude,M,...
    if fields.len() < 10 {
        return Err(ParseError::Truncated(fields.len()));
    }
    let quality_raw = field(fields, 6)?;
    let fix_quality: u8 = quality_raw
        .parse()
        .map_err(|_| ParseError::field("fix quality", quality_raw))?;
    if fix_quality == 0 {
        return Ok(NmeaRecord::Status {
            kind: SentenceKind::Gga,
            detail: "no fix (quality 0)".to_string(),
        });
    }

    let time = parse_time(field(fields, 1)?)?;
    let latitude = parse_coordinate(field(fields, 2)?, field(fields, 3)?, 'N', 'S', 90.0, "latitude")?;
    let longitude = parse_coordinate(field(fields, 4)?, field(fields, 5)?, 'E', 'W', 180.0, "longitude")?;
    let sats_raw = field(fields, 7)?;
    let satellites = if sats_raw.is_empty() {
        0
    } else {
        sats_raw
            .parse()
            .map_err(|_| ParseError::field("satellites", sats_raw))?
    };
    let hdop = parse_optional_f64(field(fields, 8)?, "hdop")?;
    let altitude_m = parse_optional_f64(field(fields, 9)?, "altitude")?;

    Ok(NmeaRecord::Gga(GgaFix {
        time,
        latitude,
        longitude,
        fix_quality,
        satellites,
        hdop,
        altitude_m,
    }))
}

/// `hhmmss` or `hhmmss.sss`
fn parse_time(raw: &str) -> Result<NaiveTime, ParseError> {
    let bad = || ParseError::field("time", raw);
    if raw.len() < 6 || !raw.is_ascii() {
        return Err(bad());
    }
    let hour: u32 = raw[0..2].parse().map_err(|_| bad())?;
    let minute: u32 = raw[2..4].parse().map_err(|_| bad())?;
    let seconds: f64 = raw[4..].parse().map_err(|_| bad())?;
    if !(0.0..60.0).contains(&seconds) {
        return Err(bad());
    }
    let whole = seconds.trunc() as u32;
    let millis = ((seconds - seconds.trunc()) * 1000.0).round().min(999.0) as u32;
    NaiveTime::from_hms_milli_opt(hour, minute, whole, millis).ok_or_else(bad)
}

/// `ddmmyy`; years below 80 are 20xx
fn parse_date(raw: &str) -> Result<NaiveDate, ParseError> {
    let bad = || ParseError::field("date", raw);
    if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let day: u32 = raw[0..2].parse().map_err(|_| bad())?;
    let month: u32 = raw[2..4].parse().map_err(|_| bad())?;
    let yy: i32 = raw[4..6].parse().map_err(|_| bad())?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)
}

/// `(d)ddmm.mmmm` plus hemisphere to signed decimal degrees
fn parse_coordinate(
    raw: &str,
    hemisphere: &str,
    positive: char,
    negative: char,
    limit: f64,
    name: &'static str,
) -> Result<f64, ParseError> {
    let value: f64 = raw.parse().map_err(|_| ParseError::field(name, raw))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::field(name, raw));
    }
    let degrees = (value / 100.0).trunc();
    let minutes = value - degrees * 100.0;
    if minutes >= 60.0 {
        return Err(ParseError::field(name, raw));
    }
    let decimal = degrees + minutes / 60.0;
    if decimal > limit {
        return Err(ParseError::field(name, raw));
    }
    match hemisphere.chars().next() {
        Some(c) if c == positive && hemisphere.len() == 1 => Ok(decimal),
        Some(c) if c == negative && hemisphere.len() == 1 => Ok(-decimal),
        _ => Err(ParseError::field("hemisphere", hemisphere)),
    }
}

fn parse_optional_f64(raw: &str, name: &'static str) -> Result<Option<f64>, ParseError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Some)
        .ok_or_else(|| ParseError::field(name, raw))
}

// ============================================================================
// Tests
// ============================================================================
