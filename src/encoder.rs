// Exposition encoder - Prometheus text format
//
// Groups a gathered snapshot into metric families and renders:
//
//   # HELP <name> <help>
//   # TYPE <name> gauge|counter
//   <name>{<label>="<value>",...} <value>
//
// Families are sorted by name and samples by label values, so the output for
// a given snapshot does not depend on the order collectors finished in.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;

use crate::metrics::{MetricDesc, Sample, ValueKind};

/// Reasons a snapshot cannot be encoded. Any of them abandons the cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("metric {name} was collected with inconsistent help, type or labels")]
    InconsistentFamily { name: String },

    #[error("metric {name} expects {expected} label value(s), got {got}")]
    LabelCardinality {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("metric {name} was collected twice with label values {labels:?}")]
    DuplicateSample { name: String, labels: Vec<String> },
}

struct Family<'a> {
    desc: &'a Arc<MetricDesc>,
    kind: ValueKind,
    samples: Vec<&'a Sample>,
}

/// Encodes samples into the text exposition format.
///
/// # Errors
/// Returns an error instead of a partial body if two samples disagree on a
/// family's help, type or label schema, if a sample's label values do not
/// match its descriptor, or if the same series appears twice.
pub fn encode(samples: &[Sample]) -> Result<String, EncodeError> {
    let mut families: BTreeMap<&str, Family<'_>> = BTreeMap::new();

    for sample in samples {
        let desc = sample.desc();
        if sample.label_values().len() != desc.label_names().len() {
            return Err(EncodeError::LabelCardinality {
                name: desc.name().to_string(),
                expected: desc.label_names().len(),
                got: sample.label_values().len(),
            });
        }

        let family = families.entry(desc.name()).or_insert_with(|| Family {
            desc,
            kind: sample.kind(),
            samples: Vec::new(),
        });
        let same_desc = Arc::ptr_eq(family.desc, desc) || **family.desc == **desc;
        if !same_desc || family.kind != sample.kind() {
            return Err(EncodeError::InconsistentFamily {
                name: desc.name().to_string(),
            });
        }
        family.samples.push(sample);
    }

    let mut out = String::new();
    for (name, family) in families.iter_mut() {
        family
            .samples
            .sort_by(|a, b| a.label_values().cmp(b.label_values()));
        if let Some(pair) = family
            .samples
            .windows(2)
            .find(|pair| pair[0].label_values() == pair[1].label_values())
        {
            return Err(EncodeError::DuplicateSample {
                name: name.to_string(),
                labels: pair[0].label_values().to_vec(),
            });
        }

        let _ = writeln!(out, "# HELP {} {}", name, escape_help(family.desc.help()));
        let _ = writeln!(out, "# TYPE {} {}", name, family.kind);
        for sample in &family.samples {
            write_sample(&mut out, family.desc, sample);
        }
    }

    Ok(out)
}

fn write_sample(out: &mut String, desc: &MetricDesc, sample: &Sample) {
    let mut pairs: Vec<(&str, &str)> = desc
        .const_labels()
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain(
            desc.label_names()
                .iter()
                .map(String::as_str)
                .zip(sample.label_values().iter().map(String::as_str)),
        )
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    out.push_str(desc.name());
    if !pairs.is_empty() {
        out.push('{');
        for (i, (name, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", name, escape_label_value(value));
        }
        out.push('}');
    }
    out.push(' ');
    out.push_str(&format_value(sample.value()));
    out.push('\n');
}

/// Escape HELP text: backslash and newline.
fn escape_help(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Escape a label value: backslash, double-quote, and newline.
fn escape_label_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        // Display is the shortest representation that round-trips
        format!("{v}")
    }
}
