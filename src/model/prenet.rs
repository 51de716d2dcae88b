//! Prenet: bottleneck over the previous output frame.
//!
//! Dropout stays on at inference when enabled; it is what keeps the decoder
//! from copying its own previous frame. [`DropoutRng`] makes it reproducible.

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Linear, VarBuilder};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::Result;
use crate::config::{DecoderConfig, PrenetKind};

/// Source of dropout masks.
#[derive(Debug, Clone)]
pub enum DropoutRng {
    /// candle's own dropout (thread RNG, not reproducible).
    Thread,
    /// Host-side masks from a seeded ChaCha8 stream.
    Seeded(ChaCha8Rng),
}

impl DropoutRng {
    /// Seeded when `seed` is given, thread RNG otherwise.
    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::Seeded(ChaCha8Rng::seed_from_u64(seed)),
            None => Self::Thread,
        }
    }

    /// Inverted dropout: zero with probability `p`, scale survivors by `1 / (1 - p)`.
    pub fn dropout(&mut self, x: &Tensor, p: f32) -> Result<Tensor> {
        if p <= 0.0 {
            return Ok(x.clone());
        }
        match self {
            Self::Thread => Ok(candle_nn::ops::dropout(x, p)?),
            Self::Seeded(rng) => {
                let scale = 1.0 / (1.0 - p);
                let keep: Vec<f32> = (0..x.elem_count())
                    .map(|_| if rng.random::<f32>() >= p { scale } else { 0.0 })
                    .collect();
                let mask = Tensor::from_vec(keep, x.shape(), x.device())?.to_dtype(x.dtype())?;
                Ok(x.mul(&mask)?)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PrenetLayer {
    linear: Linear,
    norm: Option<BatchNorm>,
}

#[derive(Debug, Clone)]
pub struct Prenet {
    layers: Vec<PrenetLayer>,
    dropout_p: Option<f32>,
    out_dim: usize,
}

impl Prenet {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.prenet_dims.len());
        let mut in_dim = cfg.frame_dim;
        for (i, &out_dim) in cfg.prenet_dims.iter().enumerate() {
            let vb_l = vb.pp(format!("linear_layers.{i}"));
            let linear = candle_nn::linear_no_bias(in_dim, out_dim, vb_l.pp("linear_layer"))?;
            let norm = match cfg.prenet_kind {
                PrenetKind::Original => None,
                PrenetKind::BatchNorm => Some(candle_nn::batch_norm(out_dim, 1e-5, vb_l.pp("bn"))?),
            };
            layers.push(PrenetLayer { linear, norm });
            in_dim = out_dim;
        }
        Ok(Self {
            layers,
            dropout_p: cfg.prenet_dropout.then_some(cfg.prenet_dropout_p),
            out_dim: in_dim,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `[1, frame_dim] -> [1, prenet_dims.last()]`.
    pub fn forward(&self, frame: &Tensor, rng: &mut DropoutRng) -> Result<Tensor> {
        let mut x = frame.clone();
        for layer in &self.layers {
            x = layer.linear.forward(&x)?;
            if let Some(norm) = &layer.norm {
                x = norm.forward_t(&x, false)?;
            }
            x = x.relu()?;
            if let Some(p) = self.dropout_p {
                x = rng.dropout(&x, p)?;
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cfg(dropout: bool, kind: PrenetKind) -> DecoderConfig {
        DecoderConfig {
            frame_dim: 6,
            prenet_dims: vec![8, 4],
            prenet_kind: kind,
            prenet_dropout: dropout,
            ..Default::default()
        }
    }

    #[test]
    fn output_width_follows_last_layer() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let prenet = Prenet::new(&cfg(true, PrenetKind::BatchNorm), vb).unwrap();
        assert_eq!(prenet.out_dim(), 4);
        let x = Tensor::ones((1, 6), DType::F32, &dev).unwrap();
        let y = prenet.forward(&x, &mut DropoutRng::from_seed(Some(1))).unwrap();
        assert_eq!(y.dims(), &[1, 4]);
    }

    #[test]
    fn seeded_dropout_is_reproducible() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let prenet = Prenet::new(&cfg(true, PrenetKind::Original), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 6), &dev).unwrap();

        let run = |seed| {
            let mut rng = DropoutRng::from_seed(Some(seed));
            let a: Vec<f32> = prenet.forward(&x, &mut rng).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = prenet.forward(&x, &mut rng).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            (a, b)
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn dropout_mask_scales_survivors() {
        let dev = Device::Cpu;
        let x = Tensor::ones((1, 1000), DType::F32, &dev).unwrap();
        let mut rng = DropoutRng::from_seed(Some(3));
        let y: Vec<f32> = rng.dropout(&x, 0.5).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.iter().filter(|&&v| v > 0.0).count();
        assert!((350..650).contains(&kept));
    }

    #[test]
    fn disabled_dropout_is_deterministic() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let prenet = Prenet::new(&cfg(false, PrenetKind::Original), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 6), &dev).unwrap();
        let a: Vec<f32> = prenet.forward(&x, &mut DropoutRng::Thread).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = prenet.forward(&x, &mut DropoutRng::Thread).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
