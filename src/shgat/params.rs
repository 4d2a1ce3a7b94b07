//! SHGAT parameter block: layout, initialization, and serialization.
//!
//! Parameters are owned by the model, mutated only by trainer-owned
//! gradient updates, and exported as a self-describing map of tensors:
//! every tensor carries its name, dtype tag, and shape, so the importer
//! can reject mismatches instead of silently misreading a blob from an
//! older layout.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::TrainError;
use crate::math::Matrix;

use super::ShgatConfig;

/// Result type for parameter operations.
pub type ParamResult<T> = std::result::Result<T, TrainError>;

/// Dtype tag in the serialized framing. Only f32 exists today; the tag is
/// there so the format can grow without a flag day.
const DTYPE_F32: u8 = 0;

/// Magic prefix of a serialized parameter blob.
const MAGIC: &[u8; 4] = b"KHP1";

// ---------------------------------------------------------------------------
// Tensor map
// ---------------------------------------------------------------------------

/// A named tensor in the export map.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Build from a matrix.
    pub fn from_matrix(m: &Matrix) -> Self {
        Self {
            shape: vec![m.rows(), m.cols()],
            data: m.as_slice().to_vec(),
        }
    }

    /// Build from a vector.
    pub fn from_vec(v: &[f32]) -> Self {
        Self {
            shape: vec![v.len()],
            data: v.to_vec(),
        }
    }

    /// Interpret as a matrix, checking the recorded shape.
    pub fn to_matrix(&self, name: &str, rows: usize, cols: usize) -> ParamResult<Matrix> {
        if self.shape != [rows, cols] {
            return Err(TrainError::ShapeMismatch {
                name: name.into(),
                expected: vec![rows, cols],
                actual: self.shape.clone(),
            });
        }
        Matrix::from_vec(rows, cols, self.data.clone()).map_err(|_| TrainError::ShapeMismatch {
            name: name.into(),
            expected: vec![rows, cols],
            actual: vec![self.data.len()],
        })
    }

    /// Interpret as a vector, checking the recorded shape.
    pub fn to_vector(&self, name: &str, len: usize) -> ParamResult<Vec<f32>> {
        if self.shape != [len] {
            return Err(TrainError::ShapeMismatch {
                name: name.into(),
                expected: vec![len],
                actual: self.shape.clone(),
            });
        }
        Ok(self.data.clone())
    }
}

/// The export map type: tensor name → tensor.
pub type TensorMap = BTreeMap<String, Tensor>;

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

/// Per-head attention parameters for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadParams {
    /// Source projection, `scoring_dim × embedding_dim`.
    pub w_source: Matrix,
    /// Target projection, `scoring_dim × embedding_dim`.
    pub w_target: Matrix,
    /// Attention vector over `[src ‖ tgt]`, length `2 · scoring_dim`.
    pub a: Vec<f32>,
}

/// One attention phase: K heads plus the output feed-forward weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseParams {
    pub heads: Vec<HeadParams>,
    /// Output projection, `embedding_dim × (heads · scoring_dim)`.
    pub w_out: Matrix,
}

/// One message-passing layer: per-level V→E, per-boundary E→E up and down,
/// and the E→V mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerParams {
    /// Indexed by capability level `0..=max_level`.
    pub v2e: Vec<PhaseParams>,
    /// Up passes, indexed by boundary `ℓ → ℓ+1`.
    pub up: Vec<PhaseParams>,
    /// Down passes, mirror of `up`.
    pub down: Vec<PhaseParams>,
    /// Final hyperedge-to-vertex pass.
    pub e2v: PhaseParams,
}

/// Intent scorer parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerParams {
    /// Intent projection, `embedding_dim × embedding_dim`.
    pub w_intent: Matrix,
    /// Per-head query projections, `scoring_dim × embedding_dim`.
    pub w_q: Vec<Matrix>,
    /// Per-head key projections, `scoring_dim × embedding_dim`.
    pub w_k: Vec<Matrix>,
    /// Fusion MLP over handcrafted candidate stats (v2 scoring).
    pub fusion: FusionMlp,
}

/// Two-layer MLP folding per-candidate trace stats into the logit.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionMlp {
    /// `hidden × num_features`.
    pub w1: Matrix,
    pub b1: Vec<f32>,
    /// `1 × hidden`.
    pub w2: Matrix,
    pub b2: Vec<f32>,
}

/// The full parameter block.
#[derive(Debug, Clone, PartialEq)]
pub struct ShgatParams {
    pub layers: Vec<LayerParams>,
    pub scorer: ScorerParams,
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

fn xavier(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix {
    let bound = (6.0 / (rows + cols) as f32).sqrt();
    let data = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Matrix::from_vec(rows, cols, data).expect("xavier shape is consistent")
}

fn xavier_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    let bound = (3.0 / len as f32).sqrt();
    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
}

fn init_head(rng: &mut StdRng, config: &ShgatConfig) -> HeadParams {
    HeadParams {
        w_source: xavier(rng, config.scoring_dim, config.embedding_dim),
        w_target: xavier(rng, config.scoring_dim, config.embedding_dim),
        a: xavier_vec(rng, 2 * config.scoring_dim),
    }
}

fn init_phase(rng: &mut StdRng, config: &ShgatConfig) -> PhaseParams {
    PhaseParams {
        heads: (0..config.num_heads).map(|_| init_head(rng, config)).collect(),
        w_out: xavier(
            rng,
            config.embedding_dim,
            config.num_heads * config.scoring_dim,
        ),
    }
}

impl ShgatParams {
    /// Seeded Xavier initialization for a hierarchy of `max_level` levels.
    ///
    /// The same seed and config always yield the same parameters.
    pub fn init(config: &ShgatConfig, max_level: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = (0..config.num_layers)
            .map(|_| LayerParams {
                v2e: (0..=max_level).map(|_| init_phase(&mut rng, config)).collect(),
                up: (0..max_level).map(|_| init_phase(&mut rng, config)).collect(),
                down: (0..max_level).map(|_| init_phase(&mut rng, config)).collect(),
                e2v: init_phase(&mut rng, config),
            })
            .collect();

        let scorer = ScorerParams {
            w_intent: xavier(&mut rng, config.embedding_dim, config.embedding_dim),
            w_q: (0..config.num_heads)
                .map(|_| xavier(&mut rng, config.scoring_dim, config.embedding_dim))
                .collect(),
            w_k: (0..config.num_heads)
                .map(|_| xavier(&mut rng, config.scoring_dim, config.embedding_dim))
                .collect(),
            fusion: FusionMlp {
                w1: xavier(&mut rng, config.fusion_hidden, config.fusion_features),
                b1: vec![0.0; config.fusion_hidden],
                w2: xavier(&mut rng, 1, config.fusion_hidden),
                b2: vec![0.0; 1],
            },
        };

        Self { layers, scorer }
    }

    /// Number of hierarchy levels these parameters cover.
    pub fn max_level(&self) -> usize {
        self.layers
            .first()
            .map(|l| l.v2e.len().saturating_sub(1))
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    /// Export as a named tensor map.
    pub fn export(&self) -> TensorMap {
        let mut map = TensorMap::new();
        for (li, layer) in self.layers.iter().enumerate() {
            for (level, phase) in layer.v2e.iter().enumerate() {
                export_phase(&mut map, &format!("layer{li}.v2e.level{level}"), phase);
            }
            for (level, phase) in layer.up.iter().enumerate() {
                export_phase(&mut map, &format!("layer{li}.up.level{level}"), phase);
            }
            for (level, phase) in layer.down.iter().enumerate() {
                export_phase(&mut map, &format!("layer{li}.down.level{level}"), phase);
            }
            export_phase(&mut map, &format!("layer{li}.e2v"), &layer.e2v);
        }
        map.insert(
            "w_intent".into(),
            Tensor::from_matrix(&self.scorer.w_intent),
        );
        for (h, w) in self.scorer.w_q.iter().enumerate() {
            map.insert(format!("head{h}.w_q"), Tensor::from_matrix(w));
        }
        for (h, w) in self.scorer.w_k.iter().enumerate() {
            map.insert(format!("head{h}.w_k"), Tensor::from_matrix(w));
        }
        map.insert("fusion.w1".into(), Tensor::from_matrix(&self.scorer.fusion.w1));
        map.insert("fusion.b1".into(), Tensor::from_vec(&self.scorer.fusion.b1));
        map.insert("fusion.w2".into(), Tensor::from_matrix(&self.scorer.fusion.w2));
        map.insert("fusion.b2".into(), Tensor::from_vec(&self.scorer.fusion.b2));
        map
    }

    /// Replace parameters in place from a tensor map.
    ///
    /// Every tensor the current layout expects must be present with the
    /// exact shape; otherwise nothing is modified and the first offending
    /// tensor is reported.
    pub fn import(&mut self, map: &TensorMap, config: &ShgatConfig) -> ParamResult<()> {
        // Build the replacement fully before committing.
        let mut layers = Vec::with_capacity(self.layers.len());
        for (li, layer) in self.layers.iter().enumerate() {
            layers.push(LayerParams {
                v2e: import_phases(map, config, &format!("layer{li}.v2e.level"), layer.v2e.len())?,
                up: import_phases(map, config, &format!("layer{li}.up.level"), layer.up.len())?,
                down: import_phases(map, config, &format!("layer{li}.down.level"), layer.down.len())?,
                e2v: import_phase(map, config, &format!("layer{li}.e2v"))?,
            });
        }

        let w_intent = lookup(map, "w_intent")?.to_matrix(
            "w_intent",
            config.embedding_dim,
            config.embedding_dim,
        )?;
        let mut w_q = Vec::with_capacity(config.num_heads);
        let mut w_k = Vec::with_capacity(config.num_heads);
        for h in 0..config.num_heads {
            let qn = format!("head{h}.w_q");
            w_q.push(lookup(map, &qn)?.to_matrix(&qn, config.scoring_dim, config.embedding_dim)?);
            let kn = format!("head{h}.w_k");
            w_k.push(lookup(map, &kn)?.to_matrix(&kn, config.scoring_dim, config.embedding_dim)?);
        }
        let fusion = FusionMlp {
            w1: lookup(map, "fusion.w1")?.to_matrix(
                "fusion.w1",
                config.fusion_hidden,
                config.fusion_features,
            )?,
            b1: lookup(map, "fusion.b1")?.to_vector("fusion.b1", config.fusion_hidden)?,
            w2: lookup(map, "fusion.w2")?.to_matrix("fusion.w2", 1, config.fusion_hidden)?,
            b2: lookup(map, "fusion.b2")?.to_vector("fusion.b2", 1)?,
        };

        self.layers = layers;
        self.scorer = ScorerParams {
            w_intent,
            w_q,
            w_k,
            fusion,
        };
        Ok(())
    }
}

fn export_phase(map: &mut TensorMap, prefix: &str, phase: &PhaseParams) {
    for (h, head) in phase.heads.iter().enumerate() {
        map.insert(
            format!("{prefix}.head{h}.w_source"),
            Tensor::from_matrix(&head.w_source),
        );
        map.insert(
            format!("{prefix}.head{h}.w_target"),
            Tensor::from_matrix(&head.w_target),
        );
        map.insert(format!("{prefix}.head{h}.a"), Tensor::from_vec(&head.a));
    }
    map.insert(format!("{prefix}.w_out"), Tensor::from_matrix(&phase.w_out));
}

fn import_phases(
    map: &TensorMap,
    config: &ShgatConfig,
    prefix: &str,
    count: usize,
) -> ParamResult<Vec<PhaseParams>> {
    (0..count)
        .map(|level| import_phase(map, config, &format!("{prefix}{level}")))
        .collect()
}

fn import_phase(map: &TensorMap, config: &ShgatConfig, prefix: &str) -> ParamResult<PhaseParams> {
    let mut heads = Vec::with_capacity(config.num_heads);
    for h in 0..config.num_heads {
        let sn = format!("{prefix}.head{h}.w_source");
        let tn = format!("{prefix}.head{h}.w_target");
        let an = format!("{prefix}.head{h}.a");
        heads.push(HeadParams {
            w_source: lookup(map, &sn)?.to_matrix(&sn, config.scoring_dim, config.embedding_dim)?,
            w_target: lookup(map, &tn)?.to_matrix(&tn, config.scoring_dim, config.embedding_dim)?,
            a: lookup(map, &an)?.to_vector(&an, 2 * config.scoring_dim)?,
        });
    }
    let on = format!("{prefix}.w_out");
    let w_out = lookup(map, &on)?.to_matrix(
        &on,
        config.embedding_dim,
        config.num_heads * config.scoring_dim,
    )?;
    Ok(PhaseParams { heads, w_out })
}

fn lookup<'m>(map: &'m TensorMap, name: &str) -> ParamResult<&'m Tensor> {
    map.get(name).ok_or_else(|| TrainError::MissingTensor {
        name: name.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Binary framing
// ---------------------------------------------------------------------------

/// Serialize a tensor map into the tagged binary framing.
pub fn serialize_tensor_map(map: &TensorMap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (name, tensor) in map {
        let name_bytes = name.as_bytes();
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out.push(DTYPE_F32);
        out.push(tensor.shape.len() as u8);
        for dim in &tensor.shape {
            out.extend_from_slice(&(*dim as u32).to_le_bytes());
        }
        for v in &tensor.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Decode the tagged binary framing back into a tensor map.
pub fn deserialize_tensor_map(bytes: &[u8]) -> ParamResult<TensorMap> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let magic = cursor.take(4)?;
    if magic != MAGIC {
        return Err(TrainError::MalformedBlob {
            message: "bad magic prefix".into(),
        });
    }
    let count = u32::from_le_bytes(cursor.take(4)?.try_into().expect("4 bytes")) as usize;
    let mut map = TensorMap::new();
    for _ in 0..count {
        let name_len = u16::from_le_bytes(cursor.take(2)?.try_into().expect("2 bytes")) as usize;
        let name = String::from_utf8(cursor.take(name_len)?.to_vec()).map_err(|_| {
            TrainError::MalformedBlob {
                message: "tensor name is not UTF-8".into(),
            }
        })?;
        let dtype = cursor.take(1)?[0];
        if dtype != DTYPE_F32 {
            return Err(TrainError::MalformedBlob {
                message: format!("unknown dtype tag {dtype}"),
            });
        }
        let ndim = cursor.take(1)?[0] as usize;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            shape.push(u32::from_le_bytes(cursor.take(4)?.try_into().expect("4 bytes")) as usize);
        }
        let len: usize = shape.iter().product();
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(f32::from_le_bytes(
                cursor.take(4)?.try_into().expect("4 bytes"),
            ));
        }
        map.insert(name, Tensor { shape, data });
    }
    Ok(map)
}

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn take(&mut self, n: usize) -> ParamResult<&'b [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(TrainError::MalformedBlob {
                message: format!(
                    "truncated blob: wanted {n} bytes at offset {}, have {}",
                    self.pos,
                    self.bytes.len() - self.pos
                ),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ShgatConfig {
        ShgatConfig {
            embedding_dim: 8,
            scoring_dim: 4,
            num_heads: 2,
            num_layers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn init_is_deterministic_for_a_seed() {
        let config = test_config();
        let a = ShgatParams::init(&config, 2, 42);
        let b = ShgatParams::init(&config, 2, 42);
        assert_eq!(a, b);
        let c = ShgatParams::init(&config, 2, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn export_import_round_trip() {
        let config = test_config();
        let original = ShgatParams::init(&config, 1, 7);
        let map = original.export();

        let mut replica = ShgatParams::init(&config, 1, 99);
        assert_ne!(original, replica);
        replica.import(&map, &config).unwrap();
        assert_eq!(original, replica);
    }

    #[test]
    fn binary_framing_round_trip() {
        let config = test_config();
        let params = ShgatParams::init(&config, 1, 7);
        let map = params.export();
        let bytes = serialize_tensor_map(&map);
        let back = deserialize_tensor_map(&bytes).unwrap();
        assert_eq!(map, back);
    }

    #[test]
    fn import_rejects_shape_mismatch() {
        let config = test_config();
        let params = ShgatParams::init(&config, 1, 7);
        let mut map = params.export();
        map.insert(
            "w_intent".into(),
            Tensor {
                shape: vec![4, 4],
                data: vec![0.0; 16],
            },
        );
        let mut target = ShgatParams::init(&config, 1, 8);
        let snapshot = target.clone();
        let err = target.import(&map, &config).unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { .. }));
        // A failed import leaves the parameters untouched.
        assert_eq!(target, snapshot);
    }

    #[test]
    fn import_rejects_missing_tensor() {
        let config = test_config();
        let params = ShgatParams::init(&config, 1, 7);
        let mut map = params.export();
        map.remove("head0.w_q");
        let mut target = ShgatParams::init(&config, 1, 8);
        assert!(matches!(
            target.import(&map, &config),
            Err(TrainError::MissingTensor { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let config = test_config();
        let map = ShgatParams::init(&config, 0, 7).export();
        let bytes = serialize_tensor_map(&map);
        let err = deserialize_tensor_map(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, TrainError::MalformedBlob { .. }));
    }
}
