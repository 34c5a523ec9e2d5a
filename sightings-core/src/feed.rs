//! Sighting feed parsing: RSS channel date plus per-item description blocks.
//!
//! The feed is an RSS document. Each `<item><description>` holds a
//! `label: value` list separated by `<br/>` markers, e.g.
//!
//! ```text
//! Date: Tuesday Oct 20, 2026 <br/>
//! Time: 7:12 PM <br/>
//! Duration: 6 minutes <br/>
//! Maximum Elevation: 71° <br/>
//! ```
//!
//! The description format is not contractually stable, so lines that do not
//! look like `label: value` are skipped instead of failing the feed. The
//! date and time of each record are required, though: a record without them
//! fails the whole parse, and nothing gets persisted.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

use crate::types::{FeedDocument, ParsedFeed, Result, SightingError, SightingRecord};

/// Default per-marker feed location; `{name}` is the marker's feed name.
pub const DEFAULT_FEED_URL: &str =
    "https://spotthestation.nasa.gov/sightings/xml_files/{name}.xml";

/// Channel `pubDate` layout. Always GMT.
const PUB_DATE_FORMAT: &str = "%d %b %Y %H:%M:%S GMT";

/// `date` + `time` description fields, joined with a space.
const SIGHTING_FORMAT: &str = "%A %b %d, %Y %I:%M %p";

const LINE_BREAK: &str = "<br/>";

static DESC_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w ]+):\s*(.*)\s*$").expect("valid regex"));

/// Build the feed URL for a marker.
pub fn feed_url(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}

/// Parse a `label: value` description into `lower_snake_label -> value`.
///
/// Unmatched lines are dropped; a repeated label keeps the last value.
pub fn parse_description(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.split(LINE_BREAK) {
        if let Some(caps) = DESC_LINE.captures(line.trim()) {
            let key = caps[1].to_lowercase().replace(' ', "_");
            out.insert(key, caps[2].to_string());
        }
    }
    out
}

/// Parse the channel publication date (`20 Oct 2026 09:15:00 GMT`).
pub fn parse_pub_date(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), PUB_DATE_FORMAT)
        .map(|dt| dt.and_utc())
        .map_err(|e| SightingError::Parse(format!("bad pubDate {text:?}: {e}")))
}

/// Interpret a feed's local `date` and `time` fields in `tz` and convert to UTC.
///
/// On a DST fall-back the repeated hour resolves to standard time. A time
/// inside a spring-forward gap keeps the offset in force before the jump.
pub fn local_to_utc(date: &str, time: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let text = format!("{} {}", date.trim(), time.trim());
    let naive = NaiveDateTime::parse_from_str(&text, SIGHTING_FORMAT)
        .map_err(|e| SightingError::Parse(format!("bad sighting time {text:?}: {e}")))?;

    let utc = match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(_, standard) => standard.with_timezone(&Utc),
        LocalResult::None => {
            let before = tz
                .offset_from_utc_datetime(&(naive - Duration::days(1)))
                .fix();
            (naive - Duration::seconds(i64::from(before.local_minus_utc()))).and_utc()
        }
    };
    Ok(utc)
}

/// Resolve an IANA zone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| SightingError::Config(format!("unknown time zone {name:?}: {e}")))
}

// ---------------------------------------------------------------------------
// XML walk
// ---------------------------------------------------------------------------

/// Raw text pulled out of the RSS document before interpretation.
#[derive(Debug, Default)]
struct RawChannel {
    pub_date: Option<String>,
    descriptions: Vec<String>,
}

fn read_channel(body: &str) -> Result<RawChannel> {
    let mut reader = Reader::from_str(body);
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut raw = RawChannel::default();
    let mut pub_date = String::new();
    let mut desc = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(e.name().as_ref().to_vec());
            }
            Ok(Event::End(_)) => {
                match classify(&path) {
                    Slot::PubDate => raw.pub_date = Some(std::mem::take(&mut pub_date)),
                    Slot::Description => raw.descriptions.push(std::mem::take(&mut desc)),
                    Slot::Other => {}
                }
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| {
                    SightingError::Parse(format!(
                        "bad text near byte {}: {e}",
                        reader.buffer_position()
                    ))
                })?;
                match classify(&path) {
                    Slot::PubDate => pub_date.push_str(&text),
                    Slot::Description => desc.push_str(&text),
                    Slot::Other => {}
                }
            }
            Ok(Event::CData(c)) => {
                let bytes = c.into_inner();
                let text = String::from_utf8_lossy(&bytes);
                match classify(&path) {
                    Slot::PubDate => pub_date.push_str(&text),
                    Slot::Description => desc.push_str(&text),
                    Slot::Other => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(SightingError::Parse(format!(
                    "malformed feed XML near byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    Ok(raw)
}

enum Slot {
    PubDate,
    Description,
    Other,
}

/// `<root>/channel/pubDate` and `<root>/channel/item/description`.
fn classify(path: &[Vec<u8>]) -> Slot {
    match path {
        [_, channel, leaf] if channel == b"channel" && leaf == b"pubDate" => Slot::PubDate,
        [_, channel, item, leaf]
            if channel == b"channel" && item == b"item" && leaf == b"description" =>
        {
            Slot::Description
        }
        _ => Slot::Other,
    }
}

// ---------------------------------------------------------------------------
// Full feed
// ---------------------------------------------------------------------------

/// Parse a complete feed body for a marker in time zone `tz_name`.
///
/// All-or-nothing: any record with a missing or malformed date/time fails
/// the whole feed.
pub fn parse_feed(body: &str, tz_name: &str) -> Result<ParsedFeed> {
    let tz = parse_timezone(tz_name)?;
    let raw = read_channel(body)?;

    let pub_date = raw
        .pub_date
        .ok_or_else(|| SightingError::Parse("feed has no channel pubDate".into()))?;
    let published = parse_pub_date(&pub_date)?;

    let records = raw
        .descriptions
        .iter()
        .map(|d| parse_record(d, tz))
        .collect::<Result<Vec<_>>>()?;

    Ok(ParsedFeed {
        document: FeedDocument {
            published,
            body: body.to_string(),
        },
        records,
    })
}

fn parse_record(desc: &str, tz: Tz) -> Result<SightingRecord> {
    let info = parse_description(desc);
    let date = info
        .get("date")
        .ok_or_else(|| SightingError::Parse(format!("sighting without date: {desc:?}")))?;
    let time = info
        .get("time")
        .ok_or_else(|| SightingError::Parse(format!("sighting without time: {desc:?}")))?;
    let datetime = local_to_utc(date, time, tz)?;
    Ok(SightingRecord { datetime, info })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
