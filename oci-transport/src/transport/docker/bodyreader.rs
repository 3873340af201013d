//! A resumable blob body reader. Wraps an HTTP byte stream and, on a
//! connection drop partway through, reconnects with a `Range` header
//! picking up from the last byte actually delivered to the caller, rather
//! than surfacing the error and making the copy pipeline restart the whole
//! blob.

use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{map_res, opt};
use nom::sequence::tuple;
use nom::IResult;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, |s: &str| s.parse::<u64>())(input)
}

fn total(input: &str) -> IResult<&str, Option<u64>> {
    nom::branch::alt((
        nom::combinator::map(tag("*"), |_| None),
        nom::combinator::map(number, Some),
    ))(input)
}

/// Strictly parse a `Content-Range: bytes start-end/total` header value.
/// Any deviation (missing `bytes` unit, non-numeric range, `end < start`)
/// is a hard error rather than a best-effort guess, since silently
/// accepting a malformed range risks skipping or duplicating bytes.
pub fn parse_content_range(header: &str) -> Result<ContentRange, super::error::RegistryError> {
    let parse = tuple((
        tag("bytes "),
        number,
        tag("-"),
        number,
        tag("/"),
        total,
        opt(nom::character::complete::space0),
    ));
    let mut parse = nom::combinator::all_consuming(parse);
    let (_, (_, start, _, end, _, total, _)) = parse(header)
        .map_err(|_| super::error::RegistryError::MalformedContentRange(header.to_string()))?;
    if end < start {
        return Err(super::error::RegistryError::MalformedContentRange(header.to_string()));
    }
    Ok(ContentRange { start, end, total })
}

/// How long to wait for the next chunk before declaring the download
/// stalled and either reconnecting or giving up, per the resumable-GET
/// design.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of reconnect attempts for one logical blob GET before
/// surfacing the last error to the caller.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// State the resumable reader threads through reconnect attempts: how many
/// bytes have already been delivered to the caller, so a reconnect can ask
/// for `Range: bytes=delivered-`.
#[derive(Debug, Clone, Copy)]
pub struct ResumeState {
    pub delivered: u64,
    pub attempts: u32,
}

impl ResumeState {
    pub fn new() -> Self {
        ResumeState { delivered: 0, attempts: 0 }
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-", self.delivered)
    }

    pub fn record_chunk(&mut self, len: u64) {
        self.delivered += len;
    }

    /// Called when the underlying stream errors out. Returns `true` if a
    /// reconnect should be attempted, `false` if attempts are exhausted.
    pub fn record_disconnect(&mut self) -> bool {
        self.attempts += 1;
        self.attempts <= MAX_RECONNECT_ATTEMPTS
    }

    /// Validate that a reconnect response's Content-Range picks up exactly
    /// where we left off; a server that restarts from 0 or skips bytes is a
    /// hard error rather than something to paper over.
    pub fn validate_resume(&self, range: &ContentRange) -> Result<(), super::error::RegistryError> {
        if range.start != self.delivered {
            return Err(super::error::RegistryError::MalformedContentRange(format!(
                "expected resume at byte {}, server restarted at {}",
                self.delivered, range.start
            )));
        }
        Ok(())
    }
}

impl Default for ResumeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_content_range() {
        let r = parse_content_range("bytes 100-199/1000").unwrap();
        assert_eq!(r, ContentRange { start: 100, end: 199, total: Some(1000) });
    }

    #[test]
    fn parses_unknown_total() {
        let r = parse_content_range("bytes 0-499/*").unwrap();
        assert_eq!(r.total, None);
    }

    #[test]
    fn rejects_missing_unit() {
        assert!(parse_content_range("0-499/1000").is_err());
    }

    #[test]
    fn rejects_end_before_start() {
        assert!(parse_content_range("bytes 500-100/1000").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_content_range("bytes 0-499/1000 extra").is_err());
    }

    #[test]
    fn resume_state_tracks_delivered_bytes_and_range_header() {
        let mut state = ResumeState::new();
        state.record_chunk(1024);
        assert_eq!(state.range_header(), "bytes=1024-");
    }

    #[test]
    fn reconnect_attempts_are_bounded() {
        let mut state = ResumeState::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            assert!(state.record_disconnect());
        }
        assert!(!state.record_disconnect());
    }

    #[test]
    fn validate_resume_rejects_server_restart_from_zero() {
        let mut state = ResumeState::new();
        state.record_chunk(500);
        let range = ContentRange { start: 0, end: 999, total: Some(1000) };
        assert!(state.validate_resume(&range).is_err());
    }
}
