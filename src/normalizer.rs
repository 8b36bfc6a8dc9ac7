//! Normalization of raw database column values before they reach any NLP step.
//!
//! Drivers hand back whatever the column holds: text, numbers, arrays, raw
//! bytes or NULL. [`normalize`] folds all of it into [`NormalizedValue`] so the
//! rest of the crate only ever sees text or a reasoned absence.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

/// Untyped value read from an external row.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// SQL NULL.
    Null,
    /// Integer column.
    Integer(i64),
    /// Floating point or decimal column.
    Float(f64),
    /// Already-decoded text.
    Text(String),
    /// Text column delivered as undecoded bytes.
    Bytes(Vec<u8>),
    /// Array column, or a driver that wraps scalars in a list.
    List(Vec<RawValue>),
    /// Any other column type, by name.
    Other(String),
}

/// Why a raw value was treated as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// The value was an empty list.
    EmptyList,
    /// NULL, numeric, or otherwise not text.
    WrongType,
    /// Empty or whitespace-only text.
    Blank,
    /// Bytes that are not well-formed UTF-8.
    BadEncoding,
}

impl SkipReason {
    /// Stable reason code used in logs and reports.
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyList => "empty-list",
            Self::WrongType => "wrong-type",
            Self::Blank => "blank",
            Self::BadEncoding => "bad-encoding",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Canonical form of a raw value: usable text, or absent with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedValue {
    /// Non-blank, well-formed text.
    Text(String),
    /// Nothing usable.
    Absent(SkipReason),
}

impl NormalizedValue {
    /// Text when present.
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Absent(_) => None,
        }
    }

    /// Reason code when absent.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Text(_) => None,
            Self::Absent(reason) => Some(*reason),
        }
    }
}

/// Normalizes a single raw value. Never fails.
pub fn normalize(value: RawValue) -> NormalizedValue {
    let value = match value {
        RawValue::List(items) => match items.into_iter().next() {
            Some(first) => first,
            None => return NormalizedValue::Absent(SkipReason::EmptyList),
        },
        other => other,
    };

    let text = match value {
        RawValue::Null | RawValue::Integer(_) | RawValue::Float(_) => {
            return NormalizedValue::Absent(SkipReason::WrongType)
        }
        RawValue::List(_) | RawValue::Other(_) => {
            return NormalizedValue::Absent(SkipReason::WrongType)
        }
        RawValue::Text(text) => text,
        RawValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return NormalizedValue::Absent(SkipReason::BadEncoding),
        },
    };

    if text.trim().is_empty() {
        return NormalizedValue::Absent(SkipReason::Blank);
    }
    NormalizedValue::Text(text)
}

/// Row read outcome as delivered by a fetch loop.
pub type FetchedValue = anyhow::Result<RawValue>;

/// Accepted texts plus diagnostics for one category of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedTexts {
    /// Usable texts in fetch order.
    pub texts: Vec<String>,
    /// Row index and reason for every skipped row.
    pub skipped: Vec<(usize, SkipReason)>,
    /// Message of the fetch error that ended iteration early, if any.
    pub interrupted: Option<String>,
}

impl CollectedTexts {
    /// True when no row produced usable text.
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Runs every fetched row through [`normalize`].
///
/// Malformed rows are logged and skipped. A fetch error stops iteration but
/// keeps the texts gathered so far.
pub fn collect_texts<I>(category: &str, rows: I) -> CollectedTexts
where
    I: IntoIterator<Item = FetchedValue>,
{
    let mut collected = CollectedTexts::default();
    for (index, row) in rows.into_iter().enumerate() {
        let raw = match row {
            Ok(raw) => raw,
            Err(err) => {
                warn!(category, index, error = %err, "row fetch failed; keeping rows read so far");
                collected.interrupted = Some(format!("{err:#}"));
                break;
            }
        };
        match normalize(raw) {
            NormalizedValue::Text(text) => {
                debug!(category, index, chars = text.len(), "row accepted");
                collected.texts.push(text);
            }
            NormalizedValue::Absent(reason) => {
                debug!(category, index, reason = reason.code(), "row skipped");
                collected.skipped.push((index, reason));
            }
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn normalizes_heterogeneous_values() {
        let cases = vec![
            (RawValue::List(vec![]), NormalizedValue::Absent(SkipReason::EmptyList)),
            (RawValue::Null, NormalizedValue::Absent(SkipReason::WrongType)),
            (RawValue::Integer(42), NormalizedValue::Absent(SkipReason::WrongType)),
            (RawValue::Float(3.5), NormalizedValue::Absent(SkipReason::WrongType)),
            (RawValue::Text("   ".into()), NormalizedValue::Absent(SkipReason::Blank)),
            (RawValue::Text("hello".into()), NormalizedValue::Text("hello".into())),
            (
                RawValue::List(vec![RawValue::Text("x".into())]),
                NormalizedValue::Text("x".into()),
            ),
            (RawValue::Other("jsonb".into()), NormalizedValue::Absent(SkipReason::WrongType)),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize(raw.clone()), expected, "input {raw:?}");
        }
    }

    #[test]
    fn list_wrapped_values_are_normalized_like_scalars() {
        assert_eq!(
            normalize(RawValue::List(vec![RawValue::Null])),
            NormalizedValue::Absent(SkipReason::WrongType)
        );
        assert_eq!(
            normalize(RawValue::List(vec![RawValue::Text("\n\t".into())])),
            NormalizedValue::Absent(SkipReason::Blank)
        );
    }

    #[test]
    fn bytes_must_be_utf8() {
        assert_eq!(
            normalize(RawValue::Bytes(vec![0xff, 0xfe, 0x41])),
            NormalizedValue::Absent(SkipReason::BadEncoding)
        );
        assert_eq!(
            normalize(RawValue::Bytes("Condition: asthma".as_bytes().to_vec())),
            NormalizedValue::Text("Condition: asthma".into())
        );
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(SkipReason::EmptyList.code(), "empty-list");
        assert_eq!(SkipReason::WrongType.to_string(), "wrong-type");
        assert_eq!(SkipReason::Blank.code(), "blank");
        assert_eq!(SkipReason::BadEncoding.code(), "bad-encoding");
    }

    #[test]
    fn collect_skips_bad_rows_and_stops_on_fetch_error() {
        let rows: Vec<FetchedValue> = vec![
            Ok(RawValue::Text("first".into())),
            Ok(RawValue::Integer(7)),
            Ok(RawValue::List(vec![RawValue::Text("second".into())])),
            Err(anyhow!("connection reset")),
            Ok(RawValue::Text("never read".into())),
        ];
        let collected = collect_texts("Condition", rows);

        assert_eq!(collected.texts, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(collected.skipped, vec![(1, SkipReason::WrongType)]);
        assert_eq!(collected.interrupted.as_deref(), Some("connection reset"));
    }
}
