//! Typed collectives: bincode on top of the byte-level `Communicator`.

use crate::codec::{decode, encode};
use crate::comm::Communicator;
use crate::error::TransportError;
use serde::{de::DeserializeOwned, Serialize};

fn decode_all<T: DeserializeOwned>(parts: Vec<Vec<u8>>) -> Result<Vec<T>, TransportError> {
    parts
        .iter()
        .map(|bytes| decode(bytes).map_err(TransportError::from))
        .collect()
}

pub fn all_gather_obj<C, T>(comm: &C, value: &T) -> Result<Vec<T>, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    decode_all(comm.all_gather(encode(value)?)?)
}

/// Sends `values[i]` to `neighbors[i]`; returns one value per neighbor.
pub fn neighbor_all_to_all<C, T>(
    comm: &C,
    neighbors: &[usize],
    values: &[T],
) -> Result<Vec<T>, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let payloads = values
        .iter()
        .map(|v| encode(v).map_err(TransportError::from))
        .collect::<Result<Vec<_>, _>>()?;
    decode_all(comm.neighbor_exchange(neighbors, payloads)?)
}

/// Sends the same value to every neighbor.
pub fn neighbor_all_gather<C, T>(
    comm: &C,
    neighbors: &[usize],
    value: &T,
) -> Result<Vec<T>, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let bytes = encode(value)?;
    let payloads = vec![bytes; neighbors.len()];
    decode_all(comm.neighbor_exchange(neighbors, payloads)?)
}

pub fn gather_obj<C, T>(comm: &C, root: usize, value: &T) -> Result<Option<Vec<T>>, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    match comm.gather(root, encode(value)?)? {
        Some(parts) => Ok(Some(decode_all(parts)?)),
        None => Ok(None),
    }
}

/// `values` is only read at `root`, where it must hold one value per rank.
pub fn scatter_obj<C, T>(comm: &C, root: usize, values: Option<&[T]>) -> Result<T, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let parts = match values {
        Some(values) if comm.rank() == root => values
            .iter()
            .map(|v| encode(v).map_err(TransportError::from))
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };
    Ok(decode(&comm.scatter(root, parts)?)?)
}

/// `value` is only read at `root`.
pub fn broadcast_obj<C, T>(comm: &C, root: usize, value: Option<&T>) -> Result<T, TransportError>
where
    C: Communicator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let bytes = match value {
        Some(v) if comm.rank() == root => encode(v)?,
        _ => Vec::new(),
    };
    Ok(decode(&comm.broadcast(root, bytes)?)?)
}
