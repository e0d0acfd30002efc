//! Record normalization
//!
//! Maps one raw sheet onto canonical [`Record`]s:
//!
//! 1. scan the first rows for the logical header (a date column plus at
//!    least one other recognized column), skipping title and banner rows
//! 2. classify columns: date, time or block index, station, measurements
//! 3. pick the station layout: a station column (long), `STATION_measure`
//!    headers (wide), or one station per sheet / per `Station : X` row group
//! 4. stream the data rows, coercing numbers leniently
//!
//! Records are produced lazily by [`SheetRecords`]. Rows without a usable
//! date (totals, footers) are counted and skipped.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use csv::StringRecord;
use edx_common::RegionCode;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

use crate::archive::Sheet;
use crate::config::HeaderVocabulary;
use crate::error::{IngestError, Result};
use crate::models::{collapse_whitespace, Provenance, Record};

// two-digit years first: `%Y` would accept `25` as year 25
const DATE_FORMATS: &[&str] = &[
    "%d-%m-%y", "%d/%m/%y", "%d.%m.%y", "%d-%b-%y", "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y",
    "%Y-%m-%d", "%Y/%m/%d", "%d-%b-%Y", "%d %b %Y", "%d-%B-%Y",
];

const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%H.%M", "%I:%M %p"];

const MISSING_MARKERS: &[&str] = &["", "-", "--", "na", "n/a", "nan", "null", "nil", "#n/a"];

/// Artifact-level context attached to every record of a sheet
#[derive(Debug, Clone)]
pub struct SheetContext {
    pub region: RegionCode,
    pub artifact_name: String,
    pub source_path: String,
    pub identity: String,
}

/// How station identity is encoded in a sheet
#[derive(Debug, Clone, PartialEq)]
enum Layout {
    /// A column names the station on every row
    Long { entity: usize },
    /// Headers carry the station: `STATION_measure`
    Wide { columns: Vec<WideColumn> },
    /// Banner rows (or the sheet name) name the station
    Grouped,
}

#[derive(Debug, Clone, PartialEq)]
struct WideColumn {
    index: usize,
    station: String,
    field: Field,
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    index: usize,
    name: String,
    /// 1000 for kWh columns, which are stored as MWh
    divisor: f64,
}

#[derive(Debug, Clone)]
struct Columns {
    date: usize,
    time: Option<usize>,
    /// Measurement columns shared by every station on the row
    shared: Vec<Field>,
}

pub struct Normalizer {
    date: Vec<String>,
    time: Vec<String>,
    entity: Vec<String>,
    measures: Vec<String>,
    banner_keywords: Vec<String>,
    scan_rows: usize,
    seconds_per_block: i64,
    blocks_per_day: u32,
}

impl Normalizer {
    pub fn new(vocabulary: &HeaderVocabulary, blocks_per_day: u32) -> Self {
        let tokens = |items: &[String]| items.iter().map(|s| header_token(s)).collect::<Vec<_>>();
        let blocks = blocks_per_day.max(1);
        Self {
            date: tokens(&vocabulary.date),
            time: tokens(&vocabulary.time)
                .into_iter()
                .chain(tokens(&vocabulary.block))
                .collect(),
            entity: tokens(&vocabulary.entity),
            measures: tokens(&vocabulary.measures),
            banner_keywords: tokens(&vocabulary.banner_prefixes),
            scan_rows: vocabulary.scan_rows.max(1),
            seconds_per_block: 86_400 / i64::from(blocks),
            blocks_per_day: blocks,
        }
    }

    /// Locate the header and return a lazy record stream for the sheet
    pub fn normalize<'s>(&self, sheet: &'s Sheet, context: &SheetContext) -> Result<SheetRecords<'s>> {
        let mut rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(sheet.delimiter)
            .trim(csv::Trim::All)
            .from_reader(sheet.content.as_bytes())
            .into_records();

        let mut banner_station = None;
        let mut header = None;
        for _ in 0..self.scan_rows {
            let Some(row) = rows.next() else { break };
            let row = row.map_err(|e| IngestError::parse(&sheet.name, e.to_string()))?;
            if let Some(station) = self.banner_station(&row) {
                banner_station = Some(station);
                continue;
            }
            if self.is_header(&row) {
                header = Some(row);
                break;
            }
        }

        let header = header.ok_or_else(|| {
            IngestError::parse(
                &sheet.name,
                format!("no header row within the first {} rows", self.scan_rows),
            )
        })?;

        let (columns, layout) = self.classify(&header);
        debug!(
            sheet = %sheet.name,
            layout = layout.name(),
            fields = columns.shared.len(),
            "Detected sheet header"
        );

        let default_station = banner_station.unwrap_or_else(|| collapse_whitespace(&sheet.name));

        Ok(SheetRecords {
            rows,
            header: header.iter().map(header_token).collect(),
            columns,
            layout,
            current_station: default_station,
            banner_keywords: self.banner_keywords.clone(),
            seconds_per_block: self.seconds_per_block,
            blocks_per_day: self.blocks_per_day,
            provenance: Provenance {
                artifact: context.artifact_name.clone(),
                source_path: context.source_path.clone(),
                identity: context.identity.clone(),
                sheet: sheet.name.clone(),
            },
            region: context.region.clone(),
            pending: VecDeque::new(),
            skipped_rows: 0,
            sheet: sheet.name.clone(),
        })
    }

    fn is_header(&self, row: &StringRecord) -> bool {
        let tokens: Vec<String> = row.iter().map(header_token).filter(|t| !t.is_empty()).collect();
        if tokens.len() < 2 {
            return false;
        }
        let has_date = tokens.iter().any(|t| matches_any(t, &self.date));
        let others = tokens
            .iter()
            .filter(|t| !matches_any(t, &self.date))
            .filter(|t| {
                matches_any(t, &self.time)
                    || matches_any(t, &self.entity)
                    || contains_any_word(t, &self.measures)
            })
            .count();
        has_date && others > 0
    }

    fn banner_station(&self, row: &StringRecord) -> Option<String> {
        banner_station(row, &self.banner_keywords)
    }

    fn classify(&self, header: &StringRecord) -> (Columns, Layout) {
        let tokens: Vec<String> = header.iter().map(header_token).collect();

        let date = tokens
            .iter()
            .position(|t| matches_any(t, &self.date))
            .unwrap_or(0);
        let time = tokens
            .iter()
            .enumerate()
            .position(|(i, t)| i != date && matches_any(t, &self.time));
        let entity = tokens
            .iter()
            .enumerate()
            .position(|(i, t)| i != date && Some(i) != time && matches_any(t, &self.entity));

        let mut names = FieldNames::default();
        let mut shared = Vec::new();
        let mut wide = Vec::new();
        for (index, raw) in header.iter().enumerate() {
            if index == date || Some(index) == time || Some(index) == entity {
                continue;
            }
            if raw.trim().is_empty() {
                continue;
            }
            match entity.is_none().then(|| self.split_wide(raw)).flatten() {
                Some((station, measure)) => {
                    let (name, divisor) = field_name(&measure);
                    wide.push(WideColumn {
                        index,
                        station,
                        field: Field { index, name, divisor },
                    });
                },
                None => {
                    let (name, divisor) = field_name(raw);
                    shared.push(Field {
                        index,
                        name: names.unique(name),
                        divisor,
                    });
                },
            }
        }

        let stations: BTreeSet<_> = wide.iter().map(|c| c.station.to_lowercase()).collect();
        let layout = if let Some(entity) = entity {
            Layout::Long { entity }
        } else if stations.len() >= 2 {
            Layout::Wide { columns: wide }
        } else {
            // a lone `X_actual` column is an ordinary field
            for column in wide {
                let (name, divisor) = field_name(&header[column.index]);
                shared.push(Field {
                    index: column.index,
                    name: names.unique(name),
                    divisor,
                });
            }
            shared.sort_by_key(|f| f.index);
            Layout::Grouped
        };

        (Columns { date, time, shared }, layout)
    }

    /// `RIHAND_Actual (MWh)` -> (`RIHAND`, `Actual (MWh)`)
    fn split_wide(&self, raw: &str) -> Option<(String, String)> {
        let (station, measure) = raw
            .rsplit_once('_')
            .or_else(|| raw.rsplit_once(" - "))?;
        let station = collapse_whitespace(station);
        let token = header_token(measure);
        if station.is_empty() || !contains_any_word(&token, &self.measures) {
            return None;
        }
        Some((station, measure.trim().to_string()))
    }
}

impl Layout {
    fn name(&self) -> &'static str {
        match self {
            Layout::Long { .. } => "long",
            Layout::Wide { .. } => "wide",
            Layout::Grouped => "grouped",
        }
    }
}

#[derive(Default)]
struct FieldNames {
    seen: BTreeMap<String, usize>,
}

impl FieldNames {
    fn unique(&mut self, name: String) -> String {
        let count = self.seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            name
        } else {
            format!("{}_{}", name, count)
        }
    }
}

/// Lazy record stream over one sheet
pub struct SheetRecords<'s> {
    rows: csv::StringRecordsIntoIter<&'s [u8]>,
    header: Vec<String>,
    columns: Columns,
    layout: Layout,
    current_station: String,
    banner_keywords: Vec<String>,
    seconds_per_block: i64,
    blocks_per_day: u32,
    provenance: Provenance,
    region: RegionCode,
    pending: VecDeque<Record>,
    skipped_rows: usize,
    sheet: String,
}

impl SheetRecords<'_> {
    /// Data rows dropped so far (no usable date, time or station)
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    fn process_row(&mut self, row: &StringRecord) {
        if row.iter().all(|c| c.trim().is_empty()) {
            return;
        }
        if let Some(station) = banner_station(row, &self.banner_keywords) {
            self.current_station = station;
            return;
        }
        if row.iter().map(header_token).eq(self.header.iter().cloned()) {
            return;
        }

        let Some(timestamp) = self.timestamp(row) else {
            self.skipped_rows += 1;
            return;
        };

        let shared: BTreeMap<String, Option<f64>> = self
            .columns
            .shared
            .iter()
            .map(|f| (f.name.clone(), value(row, f)))
            .collect();

        let region = &self.region;
        let provenance = &self.provenance;
        let pending = &mut self.pending;
        let mut emit = |station: String, fields: BTreeMap<String, Option<f64>>| {
            pending.push_back(Record {
                timestamp,
                station,
                fields,
                region: region.clone(),
                provenance: provenance.clone(),
            });
        };

        match &self.layout {
            Layout::Long { entity } => {
                let station = collapse_whitespace(row.get(*entity).unwrap_or(""));
                if station.is_empty() {
                    self.skipped_rows += 1;
                } else {
                    emit(station, shared);
                }
            },
            Layout::Grouped => emit(self.current_station.clone(), shared),
            Layout::Wide { columns } => {
                let mut per_station: Vec<(String, BTreeMap<String, Option<f64>>)> = Vec::new();
                for column in columns {
                    let slot = match per_station.iter().position(|(s, _)| *s == column.station) {
                        Some(slot) => slot,
                        None => {
                            per_station.push((column.station.clone(), shared.clone()));
                            per_station.len() - 1
                        },
                    };
                    per_station[slot]
                        .1
                        .insert(column.field.name.clone(), value(row, &column.field));
                }
                for (station, fields) in per_station {
                    emit(station, fields);
                }
            },
        }
    }

    fn timestamp(&self, row: &StringRecord) -> Option<NaiveDateTime> {
        let raw_date = row.get(self.columns.date)?.trim();
        if let Some(datetime) = parse_datetime(raw_date) {
            return Some(datetime);
        }
        let date = parse_date(raw_date)?;
        let offset = match self.columns.time {
            Some(index) => time_offset(row.get(index)?, self.seconds_per_block, self.blocks_per_day)?,
            None => 0,
        };
        Some(date.and_time(NaiveTime::MIN) + Duration::seconds(offset))
    }
}

impl Iterator for SheetRecords<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            match self.rows.next()? {
                Ok(row) => self.process_row(&row),
                Err(e) => {
                    debug!(sheet = %self.sheet, error = %e, "Unreadable row skipped");
                    self.skipped_rows += 1;
                },
            }
        }
    }
}

fn value(row: &StringRecord, field: &Field) -> Option<f64> {
    row.get(field.index)
        .and_then(coerce_number)
        .map(|v| v / field.divisor)
}

// ============================================================================
// Header tokens
// ============================================================================

/// Lower-case, drop parenthesised units, keep alphanumeric words
pub fn header_token(raw: &str) -> String {
    let mut depth = 0usize;
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {},
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => out.push(' '),
        }
    }
    collapse_whitespace(&out)
}

fn matches_any(token: &str, vocabulary: &[String]) -> bool {
    vocabulary.iter().any(|v| !v.is_empty() && token == v)
}

fn contains_any_word(token: &str, vocabulary: &[String]) -> bool {
    token
        .split(' ')
        .any(|word| vocabulary.iter().any(|v| !v.is_empty() && word == v))
}

/// `Station : RIHAND` (in one cell or spread over cells) -> `RIHAND`
fn banner_station(row: &StringRecord, keywords: &[String]) -> Option<String> {
    let text = row
        .iter()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let (label, name) = text.split_once(':')?;
    let label = header_token(label);
    if !keywords.iter().any(|k| !k.is_empty() && *k == label) {
        return None;
    }
    let name = collapse_whitespace(name);
    (!name.is_empty()).then_some(name)
}

/// Snake-case field name and unit divisor; kWh values are scaled to MWh
pub fn field_name(raw: &str) -> (String, f64) {
    let lower = raw.to_lowercase();
    let divisor = if lower.contains("kwh") { 1000.0 } else { 1.0 };
    let name = header_token(raw)
        .split(' ')
        .filter(|w| !w.is_empty() && !(*w == "kwh" || *w == "mwh" || *w == "in"))
        .collect::<Vec<_>>()
        .join("_");
    let name = if name.is_empty() { "value".to_string() } else { name };
    (name, divisor)
}

// ============================================================================
// Values
// ============================================================================

/// Lenient numeric parse; `None` for blanks, markers and garbage
///
/// Accepts `1,234.5`, `1,23,456`, `1.234,5`, `1 234`, `(12.5)` and `45%`.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if MISSING_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }

    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let body: String = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '%' && *c != '+')
        .collect();

    let commas = body.matches(',').count();
    let dots = body.matches('.').count();
    let normalized = match (commas, dots) {
        (0, _) if dots > 1 => body.replace('.', ""),
        (0, _) => body,
        (_, 0) if commas > 1 => body.replace(',', ""),
        (_, 0) => {
            let (int, frac) = body.split_once(',')?;
            if frac.len() == 3 && !int.trim_start_matches('-').is_empty() {
                format!("{}{}", int, frac)
            } else {
                format!("{}.{}", int, frac)
            }
        },
        _ => {
            let last_comma = body.rfind(',')?;
            let last_dot = body.rfind('.')?;
            if last_comma > last_dot {
                body.replace('.', "").replace(',', ".")
            } else {
                body.replace(',', "")
            }
        },
    };

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    // spreadsheet serial day numbers
    if let Ok(serial) = raw.parse::<f64>() {
        if (20_000.0..80_000.0).contains(&serial) && serial.fract() == 0.0 {
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            return epoch.checked_add_signed(Duration::days(serial as i64));
        }
    }
    None
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let (date_part, time_part) = raw
        .split_once('T')
        .or_else(|| raw.split_once(' '))
        .filter(|(_, t)| t.contains(':'))?;
    let date = parse_date(date_part)?;
    let time = parse_time(time_part.trim())?;
    Some(date.and_time(time))
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(raw, format).ok())
}

/// Seconds after midnight for a time, time range, or 1-based block index
fn time_offset(raw: &str, seconds_per_block: i64, blocks_per_day: u32) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(block) = raw.parse::<f64>() {
        let in_range = block.fract() == 0.0 && block >= 1.0 && block <= f64::from(blocks_per_day);
        return in_range.then(|| (block as i64 - 1) * seconds_per_block);
    }
    let start = raw
        .split(['-', '–'])
        .next()
        .map(str::trim)
        .unwrap_or(raw);
    let time = parse_time(start)?;
    Some(time.signed_duration_since(NaiveTime::MIN).num_seconds())
}
