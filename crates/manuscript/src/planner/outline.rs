//! Validating decode of the planner's reply into an [`Outline`].

use serde::Deserialize;

use super::PlanError;
use crate::store::{Outline, OutlineUnit, UnitKind};

/// Limits applied while decoding.
#[derive(Debug, Clone)]
pub struct OutlineLimits {
    pub max_units: usize,
    pub default_target_size: u32,
}

#[derive(Debug, Deserialize)]
struct RawOutline {
    #[serde(default)]
    title: Option<String>,
    units: Vec<RawUnit>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    #[serde(default)]
    index: Option<i64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    target_size: Option<i64>,
    #[serde(default)]
    summary: Option<String>,
}

/// Returns the first balanced `{...}` object in `response`, skipping braces
/// inside strings. Model replies often wrap JSON in prose or code fences.
pub fn extract_json(response: &str) -> Option<&str> {
    let start = response.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in response[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&response[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Decodes and validates a planner reply.
///
/// Units are ordered by index; indices must cover `0..n` exactly once.
pub fn decode_outline(
    response: &str,
    fallback_title: &str,
    limits: &OutlineLimits,
) -> Result<Outline, PlanError> {
    let json = extract_json(response).ok_or(PlanError::NoJson)?;
    let raw: RawOutline =
        serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;

    if raw.units.is_empty() {
        return Err(PlanError::Empty);
    }
    if raw.units.len() > limits.max_units {
        return Err(PlanError::TooManyUnits {
            count: raw.units.len(),
            max: limits.max_units,
        });
    }

    let count = raw.units.len();
    let mut units = Vec::with_capacity(count);
    for (position, unit) in raw.units.into_iter().enumerate() {
        let index = match unit.index {
            None => position,
            Some(i) if i >= 0 && (i as usize) < count => i as usize,
            Some(i) => return Err(PlanError::IndexOutOfRange { index: i, count }),
        };
        let title = unit.title.trim().to_string();
        if title.is_empty() {
            return Err(PlanError::EmptyTitle(index));
        }
        let target_size = match unit.target_size {
            Some(size) if size > 0 => u32::try_from(size).unwrap_or(u32::MAX),
            _ => limits.default_target_size,
        };
        units.push(OutlineUnit {
            index,
            title,
            kind: unit
                .kind
                .as_deref()
                .map(UnitKind::parse_lenient)
                .unwrap_or(UnitKind::Body),
            target_size,
            summary: unit.summary.filter(|s| !s.trim().is_empty()),
        });
    }

    units.sort_by_key(|u| u.index);
    for (expected, unit) in units.iter().enumerate() {
        if unit.index != expected {
            return Err(PlanError::DuplicateIndex(unit.index));
        }
    }

    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback_title.to_string());

    Ok(Outline { title, units })
}
