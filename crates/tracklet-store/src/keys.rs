//! Binary key/value encoding for persisted trajectory samples.
//!
//! Sample keys are `epoch(1B) ++ cell_id(8B BE) ++ timestamp(6B BE)`; values
//! are `object_id(16B) ++ class_id(2B BE)`. Big-endian layout makes the
//! store's lexicographic ordering match numeric ordering, so samples sort by
//! spatial cell first and by time within a cell.

use s2::cellid::CellID;
use s2::latlng::LatLng;
use s2::s1::Deg;
use uuid::Uuid;

use crate::GeoPoint;

pub const SAMPLE_KEY_LEN: usize = 1 + 8 + 6;
pub const SAMPLE_VALUE_LEN: usize = 16 + 2;

/// Leaf spherical cell containing `point`.
pub fn cell_id(point: GeoPoint) -> u64 {
    let latlng = LatLng::new(Deg(point.lat).into(), Deg(point.lng).into());
    CellID::from(latlng).0
}

/// Center of the cell `id`. Decoding is intentionally lossy: the center is
/// within a fraction of a centimeter of any point stored into the cell, but
/// it is not the originally sampled coordinate.
pub fn cell_center(id: u64) -> GeoPoint {
    let center = LatLng::from(CellID(id));
    GeoPoint {
        lat: center.lat.deg(),
        lng: center.lng.deg(),
    }
}

pub fn sample_key(epoch: u8, cell: u64, timestamp_ms: u64) -> [u8; SAMPLE_KEY_LEN] {
    let mut key = [0u8; SAMPLE_KEY_LEN];
    key[0] = epoch;
    key[1..9].copy_from_slice(&cell.to_be_bytes());
    key[9..15].copy_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
    key
}

/// Decode `(cell, timestamp)` from a sample key, ignoring the epoch byte.
/// Returns `None` for keys of any other shape sharing the keyspace.
pub fn decode_sample_key(key: &[u8]) -> Option<(u64, u64)> {
    if key.len() != SAMPLE_KEY_LEN {
        return None;
    }
    let cell = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let mut ts = [0u8; 8];
    ts[2..8].copy_from_slice(&key[9..15]);
    Some((cell, u64::from_be_bytes(ts)))
}

pub fn sample_value(object_id: Uuid, class_id: u16) -> [u8; SAMPLE_VALUE_LEN] {
    let mut value = [0u8; SAMPLE_VALUE_LEN];
    value[0..16].copy_from_slice(object_id.as_bytes());
    value[16..18].copy_from_slice(&class_id.to_be_bytes());
    value
}

pub fn decode_sample_value(value: &[u8]) -> Option<(Uuid, u16)> {
    if value.len() != SAMPLE_VALUE_LEN {
        return None;
    }
    let object_id = Uuid::from_slice(&value[0..16]).ok()?;
    let class_id = u16::from_be_bytes(value[16..18].try_into().ok()?);
    Some((object_id, class_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_time_within_a_cell() {
        let cell = cell_id(GeoPoint {
            lat: 45.393,
            lng: -75.751,
        });
        let earlier = sample_key(0, cell, 1_000);
        let later = sample_key(0, cell, 2_000);
        assert!(earlier < later);
    }

    #[test]
    fn keys_order_by_cell_before_time() {
        let a = sample_key(0, 5, u64::MAX >> 16);
        let b = sample_key(0, 6, 0);
        assert!(a < b);
    }

    #[test]
    fn key_round_trip() {
        let ts = 1_554_700_000_123;
        let cell = cell_id(GeoPoint {
            lat: 45.0,
            lng: -75.0,
        });
        let key = sample_key(0, cell, ts);
        assert_eq!(decode_sample_key(&key), Some((cell, ts)));
    }

    #[test]
    fn value_round_trip() {
        let id = Uuid::new_v4();
        let value = sample_value(id, 3);
        assert_eq!(decode_sample_value(&value), Some((id, 3)));
    }

    #[test]
    fn foreign_shapes_are_rejected() {
        assert_eq!(decode_sample_key(b"node/calibration"), None);
        assert_eq!(decode_sample_value(&[0u8; 4]), None);
    }

    #[test]
    fn cell_center_is_close_but_not_exact() {
        let point = GeoPoint {
            lat: 45.393495598366655,
            lng: -75.75021684378025,
        };
        let center = cell_center(cell_id(point));
        // Leaf cells are centimeter-scale; the decoded center sits within
        // ~1e-7 degrees of the sampled point but rarely equals it.
        assert!((center.lat - point.lat).abs() < 1e-7);
        assert!((center.lng - point.lng).abs() < 1e-7);
    }
}
