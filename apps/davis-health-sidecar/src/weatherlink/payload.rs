use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Decoded body of a current or historic response.
///
/// Only the envelope is typed; per-sensor samples stay loose because the vendor adds
/// fields per hardware revision. A malformed block never fails the whole payload.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawPayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sensors: Vec<SensorBlock>,
    #[serde(default, deserialize_with = "loose_integer")]
    pub generated_at: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SensorBlock {
    #[serde(default, deserialize_with = "loose_integer")]
    pub lsid: Option<i64>,
    #[serde(default, deserialize_with = "loose_integer")]
    pub sensor_type: Option<i64>,
    /// `None` when the vendor omitted or garbled the type; such blocks are never selected.
    #[serde(default, deserialize_with = "loose_integer")]
    pub data_structure_type: Option<u32>,
    #[serde(default, deserialize_with = "object_samples")]
    pub data: Vec<Map<String, JsonValue>>,
}

impl RawPayload {
    /// Typed blocks grouped by data structure type, in payload order within each type.
    pub fn blocks_by_type(&self) -> BTreeMap<u32, Vec<&SensorBlock>> {
        let mut grouped: BTreeMap<u32, Vec<&SensorBlock>> = BTreeMap::new();
        for block in &self.sensors {
            let Some(code) = block.data_structure_type else {
                continue;
            };
            grouped.entry(code).or_default().push(block);
        }
        grouped
    }
}

impl SensorBlock {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Numbers or numeric strings; anything else reads as absent.
fn loose_integer<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let number = match &value {
        JsonValue::Number(number) => number.as_i64(),
        JsonValue::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(number.and_then(|n| T::try_from(n).ok()))
}

/// Keeps object samples only; `null` or a non-array reads as no samples.
fn object_samples<'de, D>(deserializer: D) -> Result<Vec<Map<String, JsonValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    let samples = match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(sample) => Some(sample),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(samples)
}
