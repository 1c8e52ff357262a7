//! XML response deserialization for Get Page Ranges.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ErrorCode, SyncError, SyncResult};
use crate::models::IndexRange;

/// Parsed `PageList` response body.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageList {
    /// Written page ranges, converted from inclusive `Start`/`End` pairs.
    pub ranges: Vec<IndexRange>,
    /// Continuation marker for the next request, if any.
    pub next_marker: Option<String>,
}

impl PageList {
    pub fn parse(xml: &str) -> SyncResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut result = Self::default();
        let mut buf = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut start: Option<u64> = None;
        let mut end: Option<u64> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    path.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
                }
                Ok(Event::End(_)) => {
                    let closed = path.pop().unwrap_or_default();
                    if closed == "PageRange" {
                        let range = match (start.take(), end.take()) {
                            (Some(s), Some(e)) => IndexRange::from_inclusive(s, e),
                            _ => None,
                        };
                        match range {
                            Some(range) => result.ranges.push(range),
                            None => {
                                return Err(invalid("PageRange without a valid Start/End pair"))
                            }
                        }
                    } else if closed == "ClearRange" {
                        // Diff listings only.
                        start = None;
                        end = None;
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|_| invalid("undecodable text node"))?
                        .to_string();
                    if text.trim().is_empty() {
                        continue;
                    }

                    match path.last().map(String::as_str) {
                        Some("Start") => start = Some(parse_offset(&text)?),
                        Some("End") => end = Some(parse_offset(&text)?),
                        Some("NextMarker") => result.next_marker = Some(text),
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(invalid(e.to_string())),
                _ => {}
            }
            buf.clear();
        }

        result.ranges.sort();
        Ok(result)
    }
}

fn parse_offset(text: &str) -> SyncResult<u64> {
    text.trim()
        .parse()
        .map_err(|_| invalid(format!("invalid page offset {text:?}")))
}

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::with_message(
        ErrorCode::Remote,
        format!("invalid PageList response: {}", message.into()),
    )
}
