//! Typed record access over a [`Coordinator`].
//!
//! Records are stored as JSON. A payload that does not decode is reported as
//! [`CoordError::Serialization`], never as a transient failure.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coordinator::Coordinator;
use crate::error::{CoordError, Result};
use crate::event::Watch;

pub fn encode<T: Serialize>(path: &str, record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| CoordError::Serialization {
        path: path.to_string(),
        message: e.to_string(),
    })
}

pub fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| CoordError::Serialization {
        path: path.to_string(),
        message: e.to_string(),
    })
}

pub async fn load<C, T>(coord: &C, path: &str) -> Result<T>
where
    C: Coordinator + ?Sized,
    T: DeserializeOwned,
{
    let data = coord.get(path).await?;
    decode(path, &data)
}

/// Loads a record and watches its node.
pub async fn load_w<C, T>(coord: &C, path: &str) -> Result<(T, Watch)>
where
    C: Coordinator + ?Sized,
    T: DeserializeOwned,
{
    let (data, watch) = coord.get_w(path).await?;
    Ok((decode(path, &data)?, watch))
}

pub async fn create_record<C, T>(coord: &C, path: &str, record: &T) -> Result<()>
where
    C: Coordinator + ?Sized,
    T: Serialize + Sync,
{
    let data = encode(path, record)?;
    coord.create(path, data).await
}

/// Overwrites an existing record.
pub async fn store<C, T>(coord: &C, path: &str, record: &T) -> Result<()>
where
    C: Coordinator + ?Sized,
    T: Serialize + Sync,
{
    let data = encode(path, record)?;
    coord.set(path, data).await
}

/// Loads a record, applies `mutate`, and writes it back.
pub async fn update<C, T, F>(coord: &C, path: &str, mutate: F) -> Result<T>
where
    C: Coordinator + ?Sized,
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnOnce(&mut T) + Send,
{
    let mut record: T = load(coord, path).await?;
    mutate(&mut record);
    store(coord, path, &record).await?;
    Ok(record)
}
