//! Area map: the landmark set saved into an ADF payload.
//!
//! Payload layout:
//! - `[0..4]`: magic `ATAM`
//! - `[4..6]`: u16 LE format version
//! - `[6..]`: bincode-encoded landmark table

use crate::error::{MapDecodeError, PersistenceError};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MAGIC: [u8; 4] = *b"ATAM";
pub const VERSION: u16 = 1;
const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapLandmark {
    /// Position in the area-description frame, meters.
    pub position: [f64; 3],
    /// Session tick at which this landmark was first observed. Not persisted;
    /// `None` for landmarks loaded from a payload.
    #[serde(skip)]
    pub first_seen_tick: Option<u64>,
}

impl MapLandmark {
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.position[0], self.position[1], self.position[2])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaMap {
    landmarks: BTreeMap<u64, MapLandmark>,
}

impl AreaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }

    pub fn get(&self, descriptor: u64) -> Option<&MapLandmark> {
        self.landmarks.get(&descriptor)
    }

    /// Insert a landmark unless the descriptor is already mapped.
    pub fn insert_if_absent(&mut self, descriptor: u64, position: Vector3<f64>, tick: u64) -> bool {
        if self.landmarks.contains_key(&descriptor) {
            return false;
        }
        self.landmarks.insert(
            descriptor,
            MapLandmark {
                position: [position.x, position.y, position.z],
                first_seen_tick: Some(tick),
            },
        );
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &MapLandmark)> {
        self.landmarks.iter().map(|(d, l)| (*d, l))
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        let body = bincode::serialize(self).map_err(|e| PersistenceError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<AreaMap, MapDecodeError> {
        if payload.len() < HEADER_LEN {
            return Err(MapDecodeError::Truncated);
        }
        if payload[0..4] != MAGIC {
            return Err(MapDecodeError::BadMagic);
        }
        let version = u16::from_le_bytes([payload[4], payload[5]]);
        if version != VERSION {
            return Err(MapDecodeError::UnsupportedVersion(version));
        }
        bincode::deserialize(&payload[HEADER_LEN..]).map_err(|e| MapDecodeError::Decode(e.to_string()))
    }
}
