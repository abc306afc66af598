// Parser module - validates and decomposes RFC5424 lines into records
//
// This is a pure function over the input line: no I/O, no hidden state.
// The grammar (RFC 5424, abridged):
//
//   <PRI>VERSION SP TIMESTAMP SP HOSTNAME SP APP-NAME SP PROCID SP MSGID
//        SP STRUCTURED-DATA [SP MSG]
//
// Any violation produces a ParseError naming the offending field and the
// offending substring; the caller decides whether to drop or fall back.

use crate::record::{facility_of, severity_of, LogRecord, SdElement, StructuredData};
use chrono::{DateTime, Utc};
use std::fmt;

// Header field length caps from RFC 5424 section 6.
const MAX_HOSTNAME: usize = 255;
const MAX_APP_NAME: usize = 48;
const MAX_PROC_ID: usize = 128;
const MAX_MSG_ID: usize = 32;
const MAX_SD_NAME: usize = 32;

/// How much of the offending input an error carries.
const SNIPPET_LEN: usize = 64;

/// A line that failed RFC5424 validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Grammar field that failed: "pri", "version", "timestamp",
    /// "hostname", "app_name", "proc_id", "msg_id", "structured_data",
    /// or "length" for an over-long line.
    pub field: &'static str,
    /// The offending substring, truncated for log hygiene.
    pub snippet: String,
}

impl ParseError {
    fn new(field: &'static str, offending: &str) -> Self {
        let snippet = if offending.len() > SNIPPET_LEN {
            let mut end = SNIPPET_LEN;
            while !offending.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &offending[..end])
        } else {
            offending.to_string()
        };
        Self { field, snippet }
    }

    /// Error for a line exceeding the configured maximum length.
    pub fn line_too_long(len: usize, max: usize) -> Self {
        Self {
            field: "length",
            snippet: format!("{len} bytes (max {max})"),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.field, self.snippet)
    }
}

impl std::error::Error for ParseError {}

/// Parse one RFC5424 line into a record.
///
/// The line must already be stripped of its trailing LF; a trailing CR is
/// tolerated and removed here.
pub fn parse(line: &str) -> Result<LogRecord, ParseError> {
    let line = line.strip_suffix('\r').unwrap_or(line);

    let (priority, rest) = parse_pri(line)?;
    let rest = parse_version(rest)?;

    let (token, rest) = next_token(rest, "timestamp")?;
    let timestamp = parse_timestamp(token)?;

    let (token, rest) = next_token(rest, "hostname")?;
    let hostname = parse_header_field(token, "hostname", MAX_HOSTNAME)?;

    let (token, rest) = next_token(rest, "app_name")?;
    let app_name = parse_header_field(token, "app_name", MAX_APP_NAME)?;

    let (token, rest) = next_token(rest, "proc_id")?;
    let proc_id = parse_header_field(token, "proc_id", MAX_PROC_ID)?;

    let (token, rest) = next_token(rest, "msg_id")?;
    let msg_id = parse_header_field(token, "msg_id", MAX_MSG_ID)?;

    let (structured_data, rest) = parse_structured_data(rest)?;

    let message = if rest.is_empty() {
        String::new()
    } else {
        // A single SP separates SD from MSG; the MSG may open with a UTF-8
        // BOM which is not part of the message text.
        let msg = &rest[1..];
        msg.strip_prefix('\u{feff}').unwrap_or(msg).to_string()
    };

    Ok(LogRecord {
        id: None,
        priority,
        facility: facility_of(priority),
        severity: severity_of(priority),
        version: 1,
        timestamp,
        hostname,
        app_name,
        proc_id,
        msg_id,
        structured_data,
        message,
        created_at: None,
    })
}

/// `<N>` with N in 0..=191, no leading zeros except `<0>`.
fn parse_pri(line: &str) -> Result<(u8, &str), ParseError> {
    let Some(inner) = line.strip_prefix('<') else {
        return Err(ParseError::new("pri", line));
    };
    let Some(end) = inner.find('>') else {
        return Err(ParseError::new("pri", line));
    };
    let digits = &inner[..end];
    let well_formed = !digits.is_empty()
        && digits.len() <= 3
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !(digits.len() > 1 && digits.starts_with('0'));
    if !well_formed {
        return Err(ParseError::new("pri", digits));
    }
    let value: u16 = digits.parse().map_err(|_| ParseError::new("pri", digits))?;
    if value > 191 {
        return Err(ParseError::new("pri", digits));
    }
    Ok((value as u8, &inner[end + 1..]))
}

/// The literal digit `1` followed by a space.
fn parse_version(rest: &str) -> Result<&str, ParseError> {
    match rest.strip_prefix("1 ") {
        Some(rest) => Ok(rest),
        None => {
            let token = rest.split(' ').next().unwrap_or(rest);
            Err(ParseError::new("version", token))
        }
    }
}

fn next_token<'a>(rest: &'a str, field: &'static str) -> Result<(&'a str, &'a str), ParseError> {
    if rest.is_empty() {
        return Err(ParseError::new(field, ""));
    }
    match rest.find(' ') {
        Some(0) => Err(ParseError::new(field, "")),
        Some(i) => Ok((&rest[..i], &rest[i + 1..])),
        None => Ok((rest, "")),
    }
}

/// RFC3339 with up to six fractional digits. The NILVALUE is rejected:
/// every stored record carries a real timestamp.
fn parse_timestamp(token: &str) -> Result<DateTime<Utc>, ParseError> {
    if token == "-" {
        return Err(ParseError::new("timestamp", token));
    }
    if let Some(dot) = token.find('.') {
        let frac = token[dot + 1..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if frac == 0 || frac > 6 {
            return Err(ParseError::new("timestamp", token));
        }
    }
    DateTime::parse_from_rfc3339(token)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ParseError::new("timestamp", token))
}

/// A header token: printable ASCII, no whitespace, within its cap.
/// The nil value `-` maps to the empty string.
fn parse_header_field(
    token: &str,
    field: &'static str,
    cap: usize,
) -> Result<String, ParseError> {
    if token == "-" {
        return Ok(String::new());
    }
    let well_formed = !token.is_empty()
        && token.len() <= cap
        && token.bytes().all(|b| (33..=126).contains(&b));
    if !well_formed {
        return Err(ParseError::new(field, token));
    }
    Ok(token.to_string())
}

/// `-` or one-or-more `[SD-ID (SP NAME="VALUE")*]` elements.
/// Returns the remaining input, which is either empty or starts with the
/// SP that precedes the MSG part.
fn parse_structured_data(rest: &str) -> Result<(StructuredData, &str), ParseError> {
    if let Some(after) = rest.strip_prefix('-') {
        if after.is_empty() || after.starts_with(' ') {
            return Ok((StructuredData::empty(), after));
        }
        return Err(ParseError::new("structured_data", rest));
    }
    if !rest.starts_with('[') {
        return Err(ParseError::new("structured_data", rest));
    }

    let mut sd = StructuredData::empty();
    let mut cursor = rest;
    while let Some(body) = cursor.strip_prefix('[') {
        let (element, after) = parse_sd_element(body)?;
        sd.push(element);
        cursor = after;
    }
    if !(cursor.is_empty() || cursor.starts_with(' ')) {
        return Err(ParseError::new("structured_data", cursor));
    }
    Ok((sd, cursor))
}

/// One element body (input starts just past the `[`); consumes the
/// closing `]` and returns what follows it.
fn parse_sd_element(body: &str) -> Result<(SdElement, &str), ParseError> {
    let id_end = body
        .find([' ', ']'])
        .ok_or_else(|| ParseError::new("structured_data", body))?;
    let id = &body[..id_end];
    validate_sd_name(id)?;

    let mut element = SdElement::new(id);
    let mut cursor = &body[id_end..];
    loop {
        if let Some(after) = cursor.strip_prefix(']') {
            return Ok((element, after));
        }
        let Some(param) = cursor.strip_prefix(' ') else {
            return Err(ParseError::new("structured_data", cursor));
        };
        let eq = param
            .find('=')
            .ok_or_else(|| ParseError::new("structured_data", param))?;
        let name = &param[..eq];
        validate_sd_name(name)?;
        let quoted = param[eq + 1..]
            .strip_prefix('"')
            .ok_or_else(|| ParseError::new("structured_data", &param[eq + 1..]))?;
        let (value, after_value) = parse_param_value(quoted)?;
        // Duplicate PARAM-NAME within one element: last value wins.
        element.set_param(name, value);
        cursor = after_value;
    }
}

/// SD-NAME: printable ASCII except `=`, SP, `]`, `"`; 1..=32 bytes.
fn validate_sd_name(name: &str) -> Result<(), ParseError> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_SD_NAME
        && name
            .bytes()
            .all(|b| (33..=126).contains(&b) && b != b'=' && b != b']' && b != b'"');
    if well_formed {
        Ok(())
    } else {
        Err(ParseError::new("structured_data", name))
    }
}

/// PARAM-VALUE after its opening quote: `"`, `\` and `]` arrive
/// backslash-escaped and are unescaped here. A backslash before any other
/// character is kept verbatim, which is what RFC 5424 asks receivers to
/// tolerate. Returns the value and the input after the closing quote.
fn parse_param_value(input: &str) -> Result<(String, &str), ParseError> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, esc @ ('"' | '\\' | ']'))) => value.push(esc),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(ParseError::new("structured_data", input)),
            },
            ']' => return Err(ParseError::new("structured_data", input)),
            _ => value.push(ch),
        }
    }
    Err(ParseError::new("structured_data", input))
}
