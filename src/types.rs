// src/types.rs

//! Small shared types: identifiers, row snapshots, the boxed future alias
//! used by every pluggable collaborator, and config-level enums.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Identifier of a generated field (the scheduler's per-key unit).
pub type FieldId = u64;

/// Stable integer identifier of a table row.
pub type RowId = u64;

/// Read-only, human readable cell values of a row keyed by column name.
pub type RowSnapshot = BTreeMap<String, String>;

/// Boxed, sendable future returned by object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What to keep when more than one row fails within the same run.
///
/// - `First`: only the first captured error message is reported (default).
/// - `All`: every captured message is kept and joined in the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    First,
    All,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::First
    }
}

impl FromStr for ErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(ErrorPolicy::First),
            "all" => Ok(ErrorPolicy::All),
            other => Err(format!(
                "invalid error_policy: {other} (expected \"first\" or \"all\")"
            )),
        }
    }
}

/// Parse a duration string such as `"250ms"`, `"3s"`, `"5m"` or `"72h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
