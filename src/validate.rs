use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FILENAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9 _.\-()\[\]]+$").unwrap();
}

/// The widest drift a viewer may be offset from the room clock, in seconds.
pub const MAX_DRIFT_SECONDS: f64 = 60.0;

/// Accepts basenames only: no separators, no parent references, printable
/// media-name characters, at most 255 bytes.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.contains("..")
        && FILENAME_REGEX.is_match(name)
}

/// A time field must be a finite, non-negative number of seconds.
pub fn is_valid_time(seconds: f64) -> bool {
    seconds.is_finite() && seconds >= 0.0
}

/// Clamps a drift offset into `[-60, 60]` seconds.
pub fn clamp_drift(seconds: f64) -> f64 {
    if !seconds.is_finite() {
        return 0.0;
    }

    seconds.clamp(-MAX_DRIFT_SECONDS, MAX_DRIFT_SECONDS)
}

/// Bound-checks a playlist index against the live playlist length.
pub fn bounded_index(index: i32, len: usize) -> Option<usize> {
    if index < 0 {
        return None;
    }

    let index = index as usize;
    (index < len).then_some(index)
}

/// Escapes text destined for chat fan-out.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for char in text.chars() {
        match char {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }

    escaped
}
