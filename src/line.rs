//! Byte-line tokenizer: small prefix-consuming operations over a log line.
//!
//! Every operation takes the remaining input and returns what is left after it consumed
//! its part, or `None` when the input does not match. Chains are written with `?`, so the
//! first failing step aborts the whole parse.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

const DATE_SEPARATORS: &[char] = &['-', '/'];
const DATE_TIME_SEPARATORS: &[char] = &[' ', '\t'];

/// Strip leading and trailing whitespace. Never fails.
pub fn trim(input: &str) -> &str {
    input.trim()
}

/// Consume the next char if it is one of `allowed`.
pub fn rune<'a>(input: &'a str, allowed: &[char]) -> Option<(char, &'a str)> {
    let c = input.chars().next()?;
    if !allowed.contains(&c) {
        return None;
    }
    Some((c, &input[c.len_utf8()..]))
}

/// Parse exactly `width` ASCII digits as a base-10 number.
pub fn number(input: &str, width: usize) -> Option<(u32, &str)> {
    let digits = input.get(..width)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = digits.parse().ok()?;
    Some((value, &input[width..]))
}

/// Parse a `[YYYY/MM/DD HH:MM:SS.mmm]` prefix into a UTC instant.
///
/// Dates may use `-` instead of `/`, and a tab may separate date and time.
pub fn bracketed_timestamp(input: &str) -> Option<(DateTime<Utc>, &str)> {
    let (_, rest) = rune(input, &['['])?;
    let (year, rest) = number(rest, 4)?;
    let (_, rest) = rune(rest, DATE_SEPARATORS)?;
    let (month, rest) = number(rest, 2)?;
    let (_, rest) = rune(rest, DATE_SEPARATORS)?;
    let (day, rest) = number(rest, 2)?;
    let (_, rest) = rune(rest, DATE_TIME_SEPARATORS)?;
    let (hour, rest) = number(rest, 2)?;
    let (_, rest) = rune(rest, &[':'])?;
    let (minute, rest) = number(rest, 2)?;
    let (_, rest) = rune(rest, &[':'])?;
    let (second, rest) = number(rest, 2)?;
    let (_, rest) = rune(rest, &['.'])?;
    let (millis, rest) = number(rest, 3)?;
    let (_, rest) = rune(rest, &[']'])?;

    let ts = NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_milli_opt(hour, minute, second, millis)?
        .and_utc();
    Some((ts, rest))
}

/// Which `NAME[value]` marks to pull out of a line, and how to merge repeated captures.
#[derive(Debug, Clone, Copy)]
pub struct MarkSpec<'a> {
    pub names: &'a [&'a str],
    /// Join every capture with `separator`; otherwise the last capture wins.
    pub combine: bool,
    pub separator: &'a str,
}

/// Remove every matching mark from `input`, returning the remaining text and the merged
/// captured value (if any mark carried a value).
///
/// A mark only matches at the start of the line or right after whitespace. A mark without
/// a closing `]` stops the scan; everything from there on is kept verbatim.
pub fn extract_marks(input: &str, spec: &MarkSpec<'_>) -> (String, Option<String>) {
    let mut rest = String::with_capacity(input.len());
    let mut out: Option<String> = None;
    let mut i = 0;

    while i < input.len() {
        let at_boundary =
            i == 0 || input[..i].chars().next_back().is_some_and(char::is_whitespace);
        if at_boundary && let Some(name) = mark_at(&input[i..], spec.names) {
            let open = i + name.len() + 1;
            let Some(len) = input[open..].find(']') else {
                rest.push_str(&input[i..]);
                return (rest, out);
            };
            let value = &input[open..open + len];
            if !value.is_empty() {
                match out.as_mut() {
                    Some(acc) if spec.combine => {
                        acc.push_str(spec.separator);
                        acc.push_str(value);
                    }
                    _ => out = Some(value.to_string()),
                }
            }
            i = open + len + 1;
            continue;
        }
        // i always sits on a char boundary
        let Some(c) = input[i..].chars().next() else {
            break;
        };
        rest.push(c);
        i += c.len_utf8();
    }
    (rest, out)
}

fn mark_at<'a>(text: &str, names: &[&'a str]) -> Option<&'a str> {
    names
        .iter()
        .copied()
        .find(|name| text.starts_with(name) && text[name.len()..].starts_with('['))
}

/// Decode the whole input as a JSON object. Consumes the buffer on success.
pub fn decode_json_object(input: &str) -> Option<Map<String, Value>> {
    serde_json::from_str::<Map<String, Value>>(input).ok()
}
