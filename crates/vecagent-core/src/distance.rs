//! Distance metrics and object encodings supported by the graph index.

use serde::{Deserialize, Serialize};

use crate::simd::{dot_product, l1_distance, l2_normalize, l2_squared, norm};

/// Distance function used to order neighbours. Smaller is always closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceType {
    L1,
    L2,
    Angle,
    Hamming,
    Cosine,
    NormalizedAngle,
    NormalizedCosine,
}

impl Default for DistanceType {
    fn default() -> Self {
        DistanceType::L2
    }
}

impl DistanceType {
    /// Whether stored objects and queries are unit-normalized before use.
    pub fn normalizes(self) -> bool {
        matches!(
            self,
            DistanceType::NormalizedAngle | DistanceType::NormalizedCosine
        )
    }

    /// Prepare a vector for this metric (normalizes when required).
    pub fn prepare(self, v: &mut [f32]) {
        if self.normalizes() {
            l2_normalize(v);
        }
    }

    /// Distance between two prepared vectors of equal length.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceType::L1 => l1_distance(a, b),
            DistanceType::L2 => l2_squared(a, b).sqrt(),
            DistanceType::Angle => cosine_similarity(a, b).clamp(-1.0, 1.0).acos(),
            DistanceType::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceType::NormalizedAngle => dot_product(a, b).clamp(-1.0, 1.0).acos(),
            DistanceType::NormalizedCosine => 1.0 - dot_product(a, b),
            DistanceType::Hamming => a
                .iter()
                .zip(b)
                .map(|(x, y)| ((*x as u8) ^ (*y as u8)).count_ones() as f32)
                .sum(),
        }
    }
}

#[inline]
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot_product(a, b) / denom
}

/// Element encoding of stored objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Float,
    Uint8,
}

impl Default for ObjectType {
    fn default() -> Self {
        ObjectType::Float
    }
}

impl ObjectType {
    /// Quantize a vector into this object type's value domain.
    pub fn encode(self, v: &mut [f32]) {
        if self == ObjectType::Uint8 {
            v.iter_mut().for_each(|x| *x = x.round().clamp(0.0, 255.0));
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            ObjectType::Float => 1,
            ObjectType::Uint8 => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(ObjectType::Float),
            2 => Some(ObjectType::Uint8),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_distance() {
        let d = DistanceType::L2.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical_is_zero() {
        let v = [0.3, -1.2, 4.0];
        assert!(DistanceType::Cosine.distance(&v, &v).abs() < 1e-6);
        assert!(DistanceType::Angle.distance(&v, &v).abs() < 1e-3);
    }

    #[test]
    fn test_normalized_metrics_prepare() {
        let mut v = vec![3.0, 4.0];
        DistanceType::NormalizedCosine.prepare(&mut v);
        assert!((norm(&v) - 1.0).abs() < 1e-6);

        let mut raw = vec![3.0, 4.0];
        DistanceType::L2.prepare(&mut raw);
        assert_eq!(raw, vec![3.0, 4.0]);
    }

    #[test]
    fn test_hamming_counts_bits() {
        let d = DistanceType::Hamming.distance(&[0.0, 255.0], &[1.0, 255.0]);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn test_uint8_encoding_clamps() {
        let mut v = vec![-3.0, 12.4, 300.0];
        ObjectType::Uint8.encode(&mut v);
        assert_eq!(v, vec![0.0, 12.0, 255.0]);
    }

    #[test]
    fn test_serde_names() {
        let t: DistanceType = serde_json::from_str("\"normalizedcosine\"").unwrap();
        assert_eq!(t, DistanceType::NormalizedCosine);
        assert_eq!(serde_json::to_string(&ObjectType::Uint8).unwrap(), "\"uint8\"");
    }
}
