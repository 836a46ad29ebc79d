//! Line protocol encoding.
//!
//! ```text
//! measurement[,tag_key=tag_value...] field_key=field_value[,field_key=field_value...] timestamp
//! ```
//!
//! Tags and fields are written in key order, so identical snapshots always produce identical
//! bytes. Timestamps are in milliseconds, matching the `precision=ms` every write request
//! carries.

use crate::{
    dialect::Dialect,
    error::EncodeError,
    snapshot::{FieldValue, MetricRecord},
};
use std::fmt::Write;

/// Encoded records, one line each, in snapshot order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    lines: Vec<String>,
}

impl EncodedBatch {
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Request bodies of at most `batch_size` lines, joined by newlines.
    pub fn bodies(&self, batch_size: usize) -> impl Iterator<Item = String> + '_ {
        self.lines
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.join("\n"))
    }
}

/// Encodes every record of a snapshot for a server speaking `dialect`.
///
/// Records without a single finite field are skipped.
///
/// # Errors
/// Returns an error for records that line protocol cannot express: an empty name, or a tag
/// or field named `time`.
pub fn encode(records: &[MetricRecord], dialect: Dialect) -> Result<EncodedBatch, EncodeError> {
    let mut lines = Vec::with_capacity(records.len());
    for record in records {
        match encode_record(record, dialect)? {
            Some(line) => lines.push(line),
            None => log::debug!("Skipping {}: no finite field values", record.name),
        }
    }
    Ok(EncodedBatch { lines })
}

/// Encodes one record, or `None` when it has no finite field values.
///
/// # Errors
/// See [`encode`].
pub fn encode_record(record: &MetricRecord, dialect: Dialect) -> Result<Option<String>, EncodeError> {
    if record.name.trim().is_empty() {
        return Err(EncodeError::EmptyName);
    }

    let reserved = |kind| EncodeError::ReservedKey {
        measurement: record.name.clone(),
        kind,
    };

    let mut fields = String::new();
    for (key, value) in &record.fields {
        if key == "time" {
            return Err(reserved("field"));
        }
        if key.is_empty() {
            continue;
        }
        let Some(value) = format_field(*value, dialect) else {
            continue;
        };
        if !fields.is_empty() {
            fields.push(',');
        }
        escape_into(&mut fields, key, &[',', '=', ' ']);
        fields.push('=');
        fields.push_str(&value);
    }
    if fields.is_empty() {
        return Ok(None);
    }

    let mut line = String::new();
    escape_into(&mut line, &record.name, &[',', ' ']);
    for (key, value) in &record.tags {
        if key == "time" {
            return Err(reserved("tag"));
        }
        // Empty tag keys and values are rejected by the server.
        if key.is_empty() || value.is_empty() {
            continue;
        }
        line.push(',');
        escape_into(&mut line, key, &[',', '=', ' ']);
        line.push('=');
        escape_into(&mut line, value, &[',', '=', ' ']);
    }

    let _ = write!(line, " {fields} {}", record.timestamp_ms);
    Ok(Some(line))
}

/// Formats a field value, or `None` for NaN and infinities.
#[must_use]
pub fn format_field(value: FieldValue, dialect: Dialect) -> Option<String> {
    match value {
        FieldValue::Float(v) => format_float(v),
        FieldValue::Integer(v) => Some(format!("{v}i")),
        FieldValue::UInteger(v) => match dialect {
            Dialect::MultiTenant => Some(format!("{v}u")),
            Dialect::LegacySingleNode => match i64::try_from(v) {
                Ok(v) => Some(format!("{v}i")),
                #[allow(clippy::cast_precision_loss)]
                Err(_) => format_float(v as f64),
            },
        },
    }
}

/// Up to six fractional digits, trailing zeros dropped: `0`, `0.5`, `3.141593`.
fn format_float(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    let mut formatted = format!("{value:.6}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.').len();
    formatted.truncate(trimmed);
    if formatted == "-0" {
        formatted.remove(0);
    }
    Some(formatted)
}

/// Escapes `special` characters. A backslash that would otherwise end the token or sit
/// right before an escaped character is doubled so it cannot escape the delimiter.
fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    let mut chars = raw
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .peekable();
    while let Some(c) = chars.next() {
        let escaped = special.contains(&c)
            || (c == '\\' && chars.peek().is_none_or(|next| special.contains(next)));
        if escaped {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(value: f64) -> MetricRecord {
        MetricRecord::new("my_counter", 1)
            .tag("metric_type", "counter")
            .field("value", value)
    }

    #[test]
    fn encodes_simple_counter() {
        let batch = encode(&[counter(0.0)], Dialect::LegacySingleNode).unwrap();
        assert_eq!(batch.lines(), ["my_counter,metric_type=counter value=0 1"]);
    }

    #[test]
    fn tags_and_fields_are_sorted() {
        let record = MetricRecord::new("http", 1_000)
            .tag("uri", "/home")
            .tag("method", "GET")
            .field("upper", 9.5)
            .field("count", 3.0)
            .field("mean", 2.25);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().unwrap(),
            "http,method=GET,uri=/home count=3,mean=2.25,upper=9.5 1000"
        );
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let record = MetricRecord::new("disk usage,total", 5)
            .tag("mount point", "a=b,c")
            .field("used bytes", 1.0);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().unwrap(),
            r"disk\ usage\,total,mount\ point=a\=b\,c used\ bytes=1 5"
        );
    }

    #[test]
    fn newlines_never_split_a_record() {
        let record = MetricRecord::new("multi\nline", 5).field("value", 1.0);
        let line = encode_record(&record, Dialect::MultiTenant).unwrap().unwrap();
        assert_eq!(line, r"multi\ line value=1 5");
    }

    #[test]
    fn floats_are_locale_independent_and_trimmed() {
        let format = |v| format_field(FieldValue::Float(v), Dialect::MultiTenant);
        assert_eq!(format(0.0).as_deref(), Some("0"));
        assert_eq!(format(-0.0).as_deref(), Some("0"));
        assert_eq!(format(1234.5).as_deref(), Some("1234.5"));
        assert_eq!(format(std::f64::consts::PI).as_deref(), Some("3.141593"));
        assert_eq!(format(-2.0).as_deref(), Some("-2"));
        assert_eq!(format(1e16).as_deref(), Some("10000000000000000"));
        assert_eq!(format(f64::NAN), None);
        assert_eq!(format(f64::INFINITY), None);
    }

    #[test]
    fn integers_carry_type_suffixes() {
        assert_eq!(
            format_field(FieldValue::Integer(-7), Dialect::LegacySingleNode).as_deref(),
            Some("-7i")
        );
        assert_eq!(
            format_field(FieldValue::UInteger(7), Dialect::MultiTenant).as_deref(),
            Some("7u")
        );
        assert_eq!(
            format_field(FieldValue::UInteger(7), Dialect::LegacySingleNode).as_deref(),
            Some("7i")
        );
        assert_eq!(
            format_field(FieldValue::UInteger(u64::MAX), Dialect::LegacySingleNode).as_deref(),
            Some("18446744073709551616")
        );
    }

    #[test]
    fn non_finite_fields_are_dropped() {
        let record = MetricRecord::new("gauge", 1)
            .field("value", f64::NAN)
            .field("other", 2.0);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().as_deref(),
            Some("gauge other=2 1")
        );

        let all_nan = MetricRecord::new("gauge", 1).field("value", f64::NAN);
        let batch = encode(&[all_nan, counter(1.0)], Dialect::MultiTenant).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn empty_tag_values_are_omitted() {
        let record = MetricRecord::new("cpu", 1).tag("host", "").field("value", 1.0);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().as_deref(),
            Some("cpu value=1 1")
        );
    }

    #[test]
    fn trailing_backslashes_cannot_escape_delimiters() {
        let record = MetricRecord::new(r"dir\", 1)
            .tag("path", r"C:\")
            .tag("share", r"a\,b")
            .field("value", 1.0);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().as_deref(),
            Some(r"dir\\,path=C:\\,share=a\\\,b value=1 1")
        );

        let inner = MetricRecord::new(r"a\b", 1).field("value", 1.0);
        assert_eq!(
            encode_record(&inner, Dialect::MultiTenant).unwrap().as_deref(),
            Some(r"a\b value=1 1")
        );
    }

    #[test]
    fn empty_keys_are_omitted() {
        let record = MetricRecord::new("cpu", 1)
            .tag("", "orphan")
            .field("", 2.0)
            .field("value", 1.0);
        assert_eq!(
            encode_record(&record, Dialect::MultiTenant).unwrap().as_deref(),
            Some("cpu value=1 1")
        );

        let only_empty_key = MetricRecord::new("cpu", 1).field("", 1.0);
        assert_eq!(encode_record(&only_empty_key, Dialect::MultiTenant).unwrap(), None);
    }

    #[test]
    fn contract_violations_are_errors() {
        let nameless = MetricRecord::new(" ", 1).field("value", 1.0);
        assert_eq!(encode(&[nameless], Dialect::MultiTenant), Err(EncodeError::EmptyName));

        let time_tag = MetricRecord::new("cpu", 1).tag("time", "now").field("value", 1.0);
        assert_eq!(
            encode(&[time_tag], Dialect::MultiTenant),
            Err(EncodeError::ReservedKey {
                measurement: "cpu".into(),
                kind: "tag",
            })
        );
    }

    #[test]
    fn one_line_per_record() {
        for n in [0, 1, 7, 100] {
            let records: Vec<_> = (0..n).map(|i| counter(f64::from(i))).collect();
            let batch = encode(&records, Dialect::LegacySingleNode).unwrap();
            assert_eq!(batch.len(), records.len());
        }
        assert!(encode(&[], Dialect::MultiTenant).unwrap().is_empty());
    }

    #[test]
    fn encoding_is_deterministic() {
        let records = vec![
            MetricRecord::new("b", 2).tag("z", "1").tag("a", "2").field("y", 1.5).field("x", 2u64),
            MetricRecord::new("a", 3).tag("k", "v").field("value", -3i64),
        ];
        let first = encode(&records, Dialect::MultiTenant).unwrap();
        let second = encode(&records.clone(), Dialect::MultiTenant).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.lines()[0], "b,a=2,z=1 x=2u,y=1.5 2");
    }

    #[test]
    fn bodies_respect_batch_size() {
        let records: Vec<_> = (0..5).map(|i| counter(f64::from(i))).collect();
        let batch = encode(&records, Dialect::MultiTenant).unwrap();
        let bodies: Vec<_> = batch.bodies(2).collect();
        assert_eq!(bodies.len(), 3);
        assert_eq!(
            bodies[0],
            "my_counter,metric_type=counter value=0 1\nmy_counter,metric_type=counter value=1 1"
        );
    }
}
