//! Small domain value types shared by the registry and the volume service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::size::{GB, MB, SizeString};

/// Write policy of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    Sync,
    Async,
    #[default]
    Auto,
}

impl WritePolicy {
    pub const CHOICES: [&'static str; 3] = ["async", "sync", "auto"];

    pub fn as_str(self) -> &'static str {
        match self {
            WritePolicy::Sync => "sync",
            WritePolicy::Async => "async",
            WritePolicy::Auto => "auto",
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "sync" => Ok(WritePolicy::Sync),
            "async" => Ok(WritePolicy::Async),
            "auto" => Ok(WritePolicy::Auto),
            _ => Err(format!("must be one of {}", Self::CHOICES.join(", "))),
        }
    }
}

/// Persisted marker describing the mutation in progress on a volume.
///
/// `Unknown` is only seen on legacy registry entries written before the
/// marker existed; it is upgraded to `Finished` in memory on first access
/// and never written back as `unknown` deliberately.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub enum OperationState {
    #[default]
    Unknown,
    BeginCreate,
    BeginImport,
    BeginGrowLogical,
    BeginGrowPhysical,
    BeginRunningSetWritePolicy,
    Finished,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Unknown => "unknown",
            OperationState::BeginCreate => "beginCreate",
            OperationState::BeginImport => "beginImport",
            OperationState::BeginGrowLogical => "beginGrowLogical",
            OperationState::BeginGrowPhysical => "beginGrowPhysical",
            OperationState::BeginRunningSetWritePolicy => {
                "beginRunningSetWritePolicy"
            }
            OperationState::Finished => "finished",
        }
    }

    /// The operation a begin-state marker belongs to, for error messages.
    pub fn operation_name(self) -> &'static str {
        match self {
            OperationState::BeginCreate => "create",
            OperationState::BeginImport => "import",
            OperationState::BeginGrowLogical => "growLogical",
            OperationState::BeginGrowPhysical => "growPhysical",
            OperationState::BeginRunningSetWritePolicy => "changeWritePolicy",
            _ => "unknown",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index memory setting: one of the exact fractional strings `0.25`, `0.5`
/// and `0.75`, or an integral number of gigabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMemory {
    Quarter,
    Half,
    ThreeQuarters,
    Gigabytes(u32),
}

impl IndexMemory {
    pub fn to_size(self) -> SizeString {
        match self {
            IndexMemory::Quarter => SizeString::from_bytes(256 * MB),
            IndexMemory::Half => SizeString::from_bytes(512 * MB),
            IndexMemory::ThreeQuarters => SizeString::from_bytes(768 * MB),
            IndexMemory::Gigabytes(n) => SizeString::from_bytes(n as u64 * GB),
        }
    }
}

impl Default for IndexMemory {
    fn default() -> Self {
        IndexMemory::Quarter
    }
}

impl fmt::Display for IndexMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMemory::Quarter => f.write_str("0.25"),
            IndexMemory::Half => f.write_str("0.5"),
            IndexMemory::ThreeQuarters => f.write_str("0.75"),
            IndexMemory::Gigabytes(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for IndexMemory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        // The fractional settings are exact string matches: "0.50" is not
        // a valid spelling of "0.5".
        match s {
            "0.25" => return Ok(IndexMemory::Quarter),
            "0.5" => return Ok(IndexMemory::Half),
            "0.75" => return Ok(IndexMemory::ThreeQuarters),
            _ => {}
        }
        s.parse::<u32>()
            .ok()
            .map(IndexMemory::Gigabytes)
            .ok_or_else(|| "not an index memory value".to_string())
    }
}

impl Serialize for IndexMemory {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match self {
            IndexMemory::Quarter => serializer.serialize_f64(0.25),
            IndexMemory::Half => serializer.serialize_f64(0.5),
            IndexMemory::ThreeQuarters => serializer.serialize_f64(0.75),
            IndexMemory::Gigabytes(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for IndexMemory {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = IndexMemory;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an index memory setting")
            }

            fn visit_f64<E: serde::de::Error>(
                self,
                v: f64,
            ) -> Result<IndexMemory, E> {
                if v == 0.25 {
                    Ok(IndexMemory::Quarter)
                } else if v == 0.5 {
                    Ok(IndexMemory::Half)
                } else if v == 0.75 {
                    Ok(IndexMemory::ThreeQuarters)
                } else if v.fract() == 0.0 && v >= 0.0 {
                    Ok(IndexMemory::Gigabytes(v as u32))
                } else {
                    Err(E::custom("not an index memory value"))
                }
            }

            fn visit_u64<E: serde::de::Error>(
                self,
                v: u64,
            ) -> Result<IndexMemory, E> {
                Ok(IndexMemory::Gigabytes(v as u32))
            }

            fn visit_i64<E: serde::de::Error>(
                self,
                v: i64,
            ) -> Result<IndexMemory, E> {
                self.visit_u64(v as u64)
            }

            fn visit_str<E: serde::de::Error>(
                self,
                v: &str,
            ) -> Result<IndexMemory, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Driver log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Notice,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub const CHOICES: [&'static str; 6] =
        ["critical", "error", "warning", "notice", "info", "debug"];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Notice => "notice",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "notice" => Ok(LogLevel::Notice),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(format!("must be one of {}", Self::CHOICES.join(", "))),
        }
    }
}

/// Serde adapter for booleans stored as `enabled`/`disabled`.
///
/// Configurations written by an earlier automation layer used `yes`/`no`;
/// both spellings are accepted on read and the canonical form is emitted.
pub mod enabled {
    use serde::{Deserialize, Deserializer, Serializer};

    pub const ENABLED: &str = "enabled";
    pub const DISABLED: &str = "disabled";

    pub fn as_str(value: bool) -> &'static str {
        if value { ENABLED } else { DISABLED }
    }

    pub fn serialize<S: Serializer>(
        value: &bool,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(as_str(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<bool, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "enabled" | "yes" => Ok(true),
            "disabled" | "no" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "expected enabled or disabled, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_memory_exact_strings() {
        assert_eq!("0.25".parse::<IndexMemory>(), Ok(IndexMemory::Quarter));
        assert_eq!("0.5".parse::<IndexMemory>(), Ok(IndexMemory::Half));
        assert!("0.50".parse::<IndexMemory>().is_err());
        assert_eq!(
            "1024".parse::<IndexMemory>(),
            Ok(IndexMemory::Gigabytes(1024))
        );
    }

    #[test]
    fn index_memory_size() {
        assert_eq!(
            IndexMemory::Quarter.to_size(),
            "0.25G".parse::<SizeString>().unwrap()
        );
        assert_eq!(
            IndexMemory::Gigabytes(2).to_size(),
            "2G".parse::<SizeString>().unwrap()
        );
    }

    #[test]
    fn operation_state_yaml_names() {
        let s = serde_yaml::to_string(&OperationState::BeginCreate).unwrap();
        assert_eq!(s.trim(), "beginCreate");
        let parsed: OperationState = serde_yaml::from_str("finished").unwrap();
        assert_eq!(parsed, OperationState::Finished);
    }

    #[test]
    fn write_policy_round_trip() {
        for policy in [WritePolicy::Sync, WritePolicy::Async, WritePolicy::Auto]
        {
            assert_eq!(
                policy.as_str().parse::<WritePolicy>().unwrap(),
                policy
            );
        }
        assert!("fast".parse::<WritePolicy>().is_err());
    }
}
