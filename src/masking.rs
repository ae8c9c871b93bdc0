//! PHI masking for HL7 v2 payloads and the test-message filtering rule.

use crate::config::Environment;

/// Replaces credential values in diagnostic output.
pub const REDACTION_TOKEN: &str = "********";

const MASK: &str = "***";

/// Segments that carry no patient data and are left readable.
const WHITELISTED_SEGMENTS: &[&str] = &["MSH", "MSA", "ERR", "QAK", "SFT", "BHS", "BTS", "FHS", "FTS"];

/// MSH-11 processing ids marking a message as test traffic.
const TEST_PROCESSING_IDS: &[&str] = &["T", "D"];

/// Mask every field value in non-whitelisted HL7 segments.
///
/// Segment terminators and field/component separators are preserved so the
/// masked message keeps its shape. Lines that are not HL7 segments are left
/// as they are.
pub fn mask_phi(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut segment = String::new();
    for ch in message.chars() {
        if ch == '\r' || ch == '\n' {
            out.push_str(&mask_segment(&segment));
            segment.clear();
            out.push(ch);
        } else {
            segment.push(ch);
        }
    }
    out.push_str(&mask_segment(&segment));
    out
}

fn mask_segment(segment: &str) -> String {
    let Some(name) = segment_name(segment) else {
        return segment.to_string();
    };
    if WHITELISTED_SEGMENTS.contains(&name) {
        return segment.to_string();
    }

    let mut out = String::with_capacity(segment.len());
    out.push_str(name);
    let mut in_value = false;
    for ch in segment[name.len()..].chars() {
        if is_delimiter(ch) {
            out.push(ch);
            in_value = false;
        } else if !in_value {
            out.push_str(MASK);
            in_value = true;
        }
    }
    out
}

/// Three upper-case alphanumerics followed by the field separator.
fn segment_name(segment: &str) -> Option<&str> {
    let name = segment.get(..3)?;
    let valid = name
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    (valid && segment[3..].starts_with('|')).then_some(name)
}

fn is_delimiter(ch: char) -> bool {
    matches!(ch, '|' | '^' | '~' | '\\' | '&')
}

/// MSH-11 processing id (first component) of an HL7 message.
pub fn processing_id(message: &str) -> Option<&str> {
    let msh = message
        .split(['\r', '\n'])
        .map(str::trim_start)
        .find(|line| line.starts_with("MSH|"))?;
    // MSH-1 is the separator itself, so MSH-n sits at split index n-1.
    let field = msh.split('|').nth(10)?;
    let id = field.split('^').next()?.trim();
    (!id.is_empty()).then_some(id)
}

/// Test traffic is marked `T` (training) or `D` (debugging) in MSH-11.
pub fn is_test_message(message: &str) -> bool {
    processing_id(message).is_some_and(|id| TEST_PROCESSING_IDS.contains(&id))
}

/// Whether diagnostic output for `message` must be filtered.
///
/// Only test messages in a non-production environment are exempt.
pub fn should_filter(message: Option<&str>, environment: Environment) -> bool {
    let test_message = message.is_some_and(is_test_message);
    !(test_message && !environment.is_production())
}

/// Mask and bound upstream content kept on a fault.
pub fn mask_original_body(body: &str, limit: usize) -> String {
    let masked = mask_phi(body);
    if masked.len() <= limit {
        return masked;
    }
    let mut end = limit;
    while !masked.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &masked[..end])
}
