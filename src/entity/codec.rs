use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use crate::Result;

/// Canonical byte representation of an entity: compact UTF-8 JSON.
///
/// Field order follows the type declaration, so equal values always encode
/// to equal bytes.
pub fn encode<E: Serialize>(entity: &E) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(entity)?))
}

pub fn decode<E: DeserializeOwned>(raw: &[u8]) -> Result<E> {
    Ok(serde_json::from_slice(raw)?)
}

/// Reads an explicit `null` as the type's default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
