//! Orbital element page parsing.
//!
//! The element page is HTML with a single `<PRE>` section holding a series
//! of state vector blocks. Each block starts with `Vector Time (GMT): ` and a
//! `YYYY/DDD/HH:MM:SS` validity stamp, and somewhere below carries a
//! `TWO LINE MEAN ELEMENT SET` header followed by the name line and the two
//! element lines.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::types::{Result, SightingError};

/// JSC state vector page for the ISS.
pub const DEFAULT_ELEMENTS_URL: &str =
    "http://spaceflight.nasa.gov/realdata/sightings/SSapplications/Post/JavaSSOP/orbit/ISS/SVPOST.html";

const BLOCK_MARKER: &str = "Vector Time (GMT): ";
const TLE_MARKER: &str = "TWO LINE MEAN ELEMENT SET";
const STAMP_LEN: usize = 17;
const STAMP_FORMAT: &str = "%Y/%j/%H:%M:%S";

/// Offset from the end of the header to the name line, and the span that
/// holds the three element lines.
const TLE_SKIP: usize = 8;
const TLE_SPAN: usize = 152;

/// The process-wide two-line element set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSet {
    pub name: String,
    pub line1: String,
    pub line2: String,
    /// Time the state vector is valid for.
    pub valid_from: DateTime<Utc>,
    /// When this set was pulled from the page.
    pub refreshed_at: DateTime<Utc>,
}

/// One block of the page before selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementBlock {
    pub valid_from: DateTime<Utc>,
    pub lines: [String; 3],
}

fn pre_section(html: &str) -> Result<&str> {
    let pre = html
        .split("<PRE>")
        .nth(1)
        .ok_or_else(|| SightingError::Parse("element page has no <PRE> section".into()))?;
    Ok(pre.split("</PRE>").next().unwrap_or(pre))
}

/// Raw block texts in document order, each starting at its validity stamp.
fn raw_blocks(html: &str) -> Result<impl Iterator<Item = &str>> {
    Ok(pre_section(html)?.split(BLOCK_MARKER).skip(1))
}

fn block_time(block: &str) -> Result<DateTime<Utc>> {
    let stamp = block
        .get(..STAMP_LEN)
        .ok_or_else(|| SightingError::Parse(format!("short vector block: {block:?}")))?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .map(|dt| dt.and_utc())
        .map_err(|e| SightingError::Parse(format!("bad vector time {stamp:?}: {e}")))
}

fn block_lines(block: &str, valid_from: DateTime<Utc>) -> Result<[String; 3]> {
    let (_, tail) = block.split_once(TLE_MARKER).ok_or_else(|| {
        SightingError::Parse(format!("vector block at {valid_from} has no element set"))
    })?;

    let text: String = tail.chars().skip(TLE_SKIP).take(TLE_SPAN).collect();
    let mut lines = text.split('\n').map(str::trim);
    let mut next = || {
        lines
            .next()
            .map(str::to_string)
            .ok_or_else(|| SightingError::Parse(format!("truncated element set at {valid_from}")))
    };
    Ok([next()?, next()?, next()?])
}

/// Parse every block of the page, in document order.
pub fn parse_element_page(html: &str) -> Result<Vec<ElementBlock>> {
    raw_blocks(html)?
        .map(|block| {
            let valid_from = block_time(block)?;
            let lines = block_lines(block, valid_from)?;
            Ok(ElementBlock { valid_from, lines })
        })
        .collect()
}

/// Select the element set applicable at `now`: the first block in document
/// order whose validity stamp is at or after `now`.
///
/// Blocks are read lazily. Earlier blocks only need a readable stamp, and
/// nothing after the selected block is looked at.
pub fn current_element_set(html: &str, now: DateTime<Utc>) -> Result<ElementSet> {
    let mut seen = 0;
    for block in raw_blocks(html)? {
        seen += 1;
        let valid_from = block_time(block)?;
        if valid_from < now {
            continue;
        }
        let [name, line1, line2] = block_lines(block, valid_from)?;
        return Ok(ElementSet {
            name,
            line1,
            line2,
            valid_from,
            refreshed_at: now,
        });
    }
    Err(SightingError::Parse(format!(
        "none of {seen} element blocks is valid at {now}"
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) const ISS_NAME: &str = "ISS";
    pub(crate) const ISS_LINE1: &str =
        "1 25544U 98067A   08264.51782528 -.00002182  00000-0 -11606-4 0  2927";
    pub(crate) const ISS_LINE2: &str =
        "2 25544  51.6416 247.4627 0006703 130.5360 325.0288 15.72125391563537";

    fn block(stamp: &str, tle_line1: &str) -> String {
        format!(
            "{BLOCK_MARKER}{stamp}\n\
             Vector Epoch ...\n\
             \n\
             \x20   {TLE_MARKER}\n\
             \n\
             \x20     {ISS_NAME}\n\
             {tle_line1}\n\
             {ISS_LINE2}\n\
             \n"
        )
    }

    pub(crate) fn sample_page(stamps: &[&str]) -> String {
        let mut body = String::from("<HTML><BODY><H1>ISS Trajectory Data</H1><PRE>\n header\n");
        for s in stamps {
            body.push_str(&block(s, ISS_LINE1));
        }
        body.push_str("</PRE></BODY></HTML>");
        body
    }

    #[test]
    fn test_parse_blocks() {
        let page = sample_page(&["2026/292/12:00:00", "2026/294/00:30:00"]);
        let blocks = parse_element_page(&page).unwrap();
        assert_eq!(blocks.len(), 2);
        // Day 292 of 2026 is 19 Oct.
        assert_eq!(
            blocks[0].valid_from,
            Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
        );
        assert_eq!(blocks[0].lines[0], ISS_NAME);
        assert_eq!(blocks[0].lines[1], ISS_LINE1);
        assert_eq!(blocks[0].lines[2], ISS_LINE2);
    }

    #[test]
    fn test_select_first_valid_after_now() {
        let page = sample_page(&["2026/290/00:00:00", "2026/293/06:00:00", "2026/295/06:00:00"]);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let set = current_element_set(&page, now).unwrap();
        assert_eq!(set.valid_from, Utc.with_ymd_and_hms(2026, 10, 20, 6, 0, 0).unwrap());
        assert_eq!(set.refreshed_at, now);
        assert_eq!(set.line1, ISS_LINE1);
    }

    #[test]
    fn test_all_blocks_stale() {
        let page = sample_page(&["2026/200/00:00:00"]);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        assert!(matches!(
            current_element_set(&page, now),
            Err(SightingError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_pre() {
        assert!(parse_element_page("<html>maintenance</html>").is_err());
    }

    #[test]
    fn test_bad_stamp() {
        let page = sample_page(&["yesterday-ish....."]);
        assert!(matches!(
            parse_element_page(&page),
            Err(SightingError::Parse(_))
        ));
    }

    #[test]
    fn test_broken_block_after_selection_is_ignored() {
        let mut page = sample_page(&["2026/290/00:00:00", "2026/293/06:00:00"]);
        let tail = format!("{BLOCK_MARKER}2026/295/06:00:00\n truncated...</PRE>");
        page = page.replace("</PRE>", &tail);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();

        let set = current_element_set(&page, now).unwrap();
        assert_eq!(set.valid_from, Utc.with_ymd_and_hms(2026, 10, 20, 6, 0, 0).unwrap());
        assert_eq!(set.line2, ISS_LINE2);
        // A full parse still sees the broken block.
        assert!(parse_element_page(&page).is_err());
    }

    #[test]
    fn test_stale_block_without_elements_is_skipped() {
        let stale = format!("{BLOCK_MARKER}2026/200/00:00:00\n only vectors\n");
        let page = sample_page(&["2026/293/06:00:00"]).replace("<PRE>\n", &format!("<PRE>\n{stale}"));
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();

        let set = current_element_set(&page, now).unwrap();
        assert_eq!(set.line1, ISS_LINE1);
    }

    #[test]
    fn test_bad_stamp_before_selection_fails() {
        let page = sample_page(&["yesterday-ish.....", "2026/293/06:00:00"]);
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        assert!(matches!(
            current_element_set(&page, now),
            Err(SightingError::Parse(_))
        ));
    }

    #[test]
    fn test_block_without_elements() {
        let page = format!("<PRE>{BLOCK_MARKER}2026/293/06:00:00\n only vectors\n</PRE>");
        assert!(parse_element_page(&page).is_err());
    }
}
