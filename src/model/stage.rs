//! Generator stages: strided convolution, optional normalization, activation.
//!
//! The set is closed. [`Stage::Down`] halves resolution, [`Stage::Up`]
//! doubles it, and [`Stage::Head`] maps the last decoder features to RGB.

use ndarray::{Array1, Array2, Array4, Ix1, Ix4};
use rand::RngCore;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};

use super::architecture::{StagePlan, DROPOUT_RATE, KERNEL_SIZE, LEAKY_SLOPE, NORM_EPSILON, STRIDE};
use super::checkpoint::Checkpoint;
use super::ops::{self, FeatureMap};

/// How normalization and dropout behave during a forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Stored moving statistics, no dropout. Deterministic.
    #[default]
    Evaluation,
    /// Per-call feature statistics and random dropout.
    Training,
}

/// Forward-pass state threaded through every stage.
pub(crate) enum Regime<'a> {
    Evaluation,
    Training(&'a mut dyn RngCore),
}

/// Standard deviation of the normal initializer used for fresh weights.
const INIT_STDDEV: f32 = 0.02;

/// Convolution weights, stored pre-flattened into the matrix the op multiplies by.
#[derive(Debug, Clone, PartialEq)]
struct Conv {
    weights: Array2<f32>,
    bias: Option<Array1<f32>>,
    in_channels: usize,
    out_channels: usize,
    transposed: bool,
}

impl Conv {
    /// Checkpoint shape of the kernel: `(kh, kw, in, out)` or `(kh, kw, out, in)` when transposed.
    const fn kernel_shape(in_channels: usize, out_channels: usize, transposed: bool) -> [usize; 4] {
        if transposed {
            [KERNEL_SIZE, KERNEL_SIZE, out_channels, in_channels]
        } else {
            [KERNEL_SIZE, KERNEL_SIZE, in_channels, out_channels]
        }
    }

    fn from_kernel(kernel: Array4<f32>, bias: Option<Array1<f32>>, transposed: bool) -> Result<Self> {
        let (kh, kw, a, b) = kernel.dim();
        let (in_channels, out_channels) = if transposed { (b, a) } else { (a, b) };

        let weights = if transposed {
            kernel
                .permuted_axes([3, 0, 1, 2])
                .to_shape((in_channels, kh * kw * out_channels))?
                .into_owned()
        } else {
            kernel.to_shape((kh * kw * in_channels, out_channels))?.into_owned()
        };

        Ok(Self {
            weights,
            bias,
            in_channels,
            out_channels,
            transposed,
        })
    }

    fn load(
        checkpoint: &mut Checkpoint,
        prefix: &str,
        plan: &StagePlan,
        transposed: bool,
        with_bias: bool,
    ) -> Result<Self> {
        let shape = Self::kernel_shape(plan.in_channels, plan.out_channels, transposed);
        let kernel = checkpoint
            .take(&format!("{prefix}.conv.kernel"), &shape)?
            .into_dimensionality::<Ix4>()?;

        let bias = if with_bias {
            Some(
                checkpoint
                    .take(&format!("{prefix}.conv.bias"), &[plan.out_channels])?
                    .into_dimensionality::<Ix1>()?,
            )
        } else {
            None
        };

        Self::from_kernel(kernel, bias, transposed)
    }

    fn initialized(plan: &StagePlan, transposed: bool, with_bias: bool, rng: &mut dyn RngCore) -> Result<Self> {
        let normal = Normal::new(0.0, INIT_STDDEV).map_err(|err| Error::InvalidParameter {
            name: "init_stddev".to_string(),
            reason: err.to_string(),
        })?;
        let shape = Self::kernel_shape(plan.in_channels, plan.out_channels, transposed);
        let kernel = Array4::from_shape_simple_fn(shape, || normal.sample(&mut *rng));
        let bias = with_bias.then(|| Array1::zeros(plan.out_channels));

        Self::from_kernel(kernel, bias, transposed)
    }

    /// Kernel in checkpoint layout.
    fn kernel(&self) -> Result<Array4<f32>> {
        let k = KERNEL_SIZE;
        let kernel = if self.transposed {
            self.weights
                .to_shape((self.in_channels, k, k, self.out_channels))?
                .into_owned()
                .permuted_axes([1, 2, 3, 0])
        } else {
            self.weights
                .to_shape((k, k, self.in_channels, self.out_channels))?
                .into_owned()
        };
        Ok(kernel.as_standard_layout().into_owned())
    }

    fn export(&self, checkpoint: &mut Checkpoint, prefix: &str) -> Result<()> {
        checkpoint.insert(format!("{prefix}.conv.kernel"), self.kernel()?.into_dyn());
        if let Some(bias) = &self.bias {
            checkpoint.insert(format!("{prefix}.conv.bias"), bias.clone().into_dyn());
        }
        Ok(())
    }

    fn forward(&self, x: &FeatureMap) -> Result<FeatureMap> {
        let mut y = if self.transposed {
            ops::conv_transpose2d(x, &self.weights, KERNEL_SIZE, STRIDE)?
        } else {
            ops::conv2d(x, &self.weights, KERNEL_SIZE, STRIDE)?
        };
        if let Some(bias) = &self.bias {
            y += bias;
        }
        Ok(y)
    }
}

/// Batch normalization parameters with the evaluation transform folded in.
#[derive(Debug, Clone, PartialEq)]
struct BatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    moving_mean: Array1<f32>,
    moving_variance: Array1<f32>,
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm {
    const PARAMETERS: [&'static str; 4] = ["gamma", "beta", "moving_mean", "moving_variance"];

    fn new(
        gamma: Array1<f32>,
        beta: Array1<f32>,
        moving_mean: Array1<f32>,
        moving_variance: Array1<f32>,
    ) -> Self {
        let scale = &gamma / &moving_variance.mapv(|v| (v + NORM_EPSILON).sqrt());
        let shift = &beta - &(&moving_mean * &scale);
        Self {
            gamma,
            beta,
            moving_mean,
            moving_variance,
            scale,
            shift,
        }
    }

    fn load(checkpoint: &mut Checkpoint, prefix: &str, channels: usize) -> Result<Self> {
        let mut take = |name: &str| -> Result<Array1<f32>> {
            Ok(checkpoint
                .take(&format!("{prefix}.norm.{name}"), &[channels])?
                .into_dimensionality::<Ix1>()?)
        };
        let [gamma, beta, mean, variance] = Self::PARAMETERS;
        Ok(Self::new(take(gamma)?, take(beta)?, take(mean)?, take(variance)?))
    }

    fn identity(channels: usize) -> Self {
        Self::new(
            Array1::ones(channels),
            Array1::zeros(channels),
            Array1::zeros(channels),
            Array1::ones(channels),
        )
    }

    fn export(&self, checkpoint: &mut Checkpoint, prefix: &str) {
        let values = [&self.gamma, &self.beta, &self.moving_mean, &self.moving_variance];
        for (name, value) in Self::PARAMETERS.iter().zip(values) {
            checkpoint.insert(format!("{prefix}.norm.{name}"), value.clone().into_dyn());
        }
    }

    fn forward(&self, x: &mut FeatureMap, regime: &Regime<'_>) {
        match regime {
            Regime::Evaluation => ops::affine_channels(x, &self.scale, &self.shift),
            Regime::Training(_) => {
                ops::normalize_with_batch_statistics(x, &self.gamma, &self.beta, NORM_EPSILON);
            }
        }
    }
}

/// Encoder stage: strided convolution, optional normalization, leaky rectifier.
#[derive(Debug, Clone, PartialEq)]
pub struct DownStage {
    conv: Conv,
    norm: Option<BatchNorm>,
}

/// Decoder stage: transposed convolution, normalization, optional dropout, rectifier.
#[derive(Debug, Clone, PartialEq)]
pub struct UpStage {
    conv: Conv,
    norm: BatchNorm,
    dropout: bool,
}

/// Output head: transposed convolution with bias, then tanh.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadStage {
    conv: Conv,
}

/// One step of the generator pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Down(DownStage),
    Up(UpStage),
    Head(HeadStage),
}

impl Stage {
    /// Restore an encoder stage from `<prefix>.conv.*` and `<prefix>.norm.*`.
    pub(crate) fn load_down(checkpoint: &mut Checkpoint, prefix: &str, plan: &StagePlan) -> Result<Self> {
        let conv = Conv::load(checkpoint, prefix, plan, false, false)?;
        let norm = if plan.normalize {
            Some(BatchNorm::load(checkpoint, prefix, plan.out_channels)?)
        } else {
            None
        };
        Ok(Self::Down(DownStage { conv, norm }))
    }

    /// Restore a decoder stage.
    pub(crate) fn load_up(checkpoint: &mut Checkpoint, prefix: &str, plan: &StagePlan) -> Result<Self> {
        let conv = Conv::load(checkpoint, prefix, plan, true, false)?;
        let norm = BatchNorm::load(checkpoint, prefix, plan.out_channels)?;
        Ok(Self::Up(UpStage {
            conv,
            norm,
            dropout: plan.dropout,
        }))
    }

    /// Restore the output head.
    pub(crate) fn load_head(checkpoint: &mut Checkpoint, prefix: &str, plan: &StagePlan) -> Result<Self> {
        let conv = Conv::load(checkpoint, prefix, plan, true, true)?;
        Ok(Self::Head(HeadStage { conv }))
    }

    /// Fresh encoder stage with normally distributed kernel weights.
    pub(crate) fn init_down(plan: &StagePlan, rng: &mut dyn RngCore) -> Result<Self> {
        let conv = Conv::initialized(plan, false, false, rng)?;
        let norm = plan.normalize.then(|| BatchNorm::identity(plan.out_channels));
        Ok(Self::Down(DownStage { conv, norm }))
    }

    /// Fresh decoder stage.
    pub(crate) fn init_up(plan: &StagePlan, rng: &mut dyn RngCore) -> Result<Self> {
        let conv = Conv::initialized(plan, true, false, rng)?;
        Ok(Self::Up(UpStage {
            conv,
            norm: BatchNorm::identity(plan.out_channels),
            dropout: plan.dropout,
        }))
    }

    /// Fresh output head.
    pub(crate) fn init_head(plan: &StagePlan, rng: &mut dyn RngCore) -> Result<Self> {
        let conv = Conv::initialized(plan, true, true, rng)?;
        Ok(Self::Head(HeadStage { conv }))
    }

    /// Write this stage's parameters under `prefix`.
    pub(crate) fn export(&self, checkpoint: &mut Checkpoint, prefix: &str) -> Result<()> {
        match self {
            Self::Down(stage) => {
                stage.conv.export(checkpoint, prefix)?;
                if let Some(norm) = &stage.norm {
                    norm.export(checkpoint, prefix);
                }
            }
            Self::Up(stage) => {
                stage.conv.export(checkpoint, prefix)?;
                stage.norm.export(checkpoint, prefix);
            }
            Self::Head(stage) => stage.conv.export(checkpoint, prefix)?,
        }
        Ok(())
    }

    /// Channels this stage consumes.
    #[must_use]
    pub const fn in_channels(&self) -> usize {
        self.conv().in_channels
    }

    /// Channels this stage produces.
    #[must_use]
    pub const fn out_channels(&self) -> usize {
        self.conv().out_channels
    }

    const fn conv(&self) -> &Conv {
        match self {
            Self::Down(stage) => &stage.conv,
            Self::Up(stage) => &stage.conv,
            Self::Head(stage) => &stage.conv,
        }
    }

    /// Consume a feature map and produce the next one.
    pub(crate) fn forward(&self, x: &FeatureMap, regime: &mut Regime<'_>) -> Result<FeatureMap> {
        match self {
            Self::Down(stage) => {
                let mut y = stage.conv.forward(x)?;
                if let Some(norm) = &stage.norm {
                    norm.forward(&mut y, regime);
                }
                ops::leaky_relu(&mut y, LEAKY_SLOPE);
                Ok(y)
            }
            Self::Up(stage) => {
                let mut y = stage.conv.forward(x)?;
                stage.norm.forward(&mut y, regime);
                if stage.dropout {
                    if let Regime::Training(rng) = regime {
                        ops::dropout(&mut y, DROPOUT_RATE, &mut **rng);
                    }
                }
                ops::relu(&mut y);
                Ok(y)
            }
            Self::Head(stage) => {
                let mut y = stage.conv.forward(x)?;
                ops::tanh(&mut y);
                Ok(y)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plan(in_channels: usize, out_channels: usize, normalize: bool, dropout: bool) -> StagePlan {
        StagePlan {
            in_channels,
            out_channels,
            normalize,
            dropout,
        }
    }

    #[test]
    fn test_down_stage_halves_resolution() {
        let mut rng = StdRng::seed_from_u64(1);
        let stage = Stage::init_down(&plan(3, 8, true, false), &mut rng).unwrap();
        let x = Array3::<f32>::from_elem((16, 16, 3), 0.5);

        let y = stage.forward(&x, &mut Regime::Evaluation).unwrap();
        assert_eq!(y.dim(), (8, 8, 8));
    }

    #[test]
    fn test_up_stage_doubles_resolution() {
        let mut rng = StdRng::seed_from_u64(2);
        let stage = Stage::init_up(&plan(6, 4, true, true), &mut rng).unwrap();
        let x = Array3::<f32>::from_elem((4, 4, 6), 0.5);

        let y = stage.forward(&x, &mut Regime::Evaluation).unwrap();
        assert_eq!(y.dim(), (8, 8, 4));
        assert!(y.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_head_is_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let stage = Stage::init_head(&plan(4, 3, false, false), &mut rng).unwrap();
        let x = Array3::<f32>::from_elem((4, 4, 4), 1000.0);

        let y = stage.forward(&x, &mut Regime::Evaluation).unwrap();
        assert_eq!(y.dim(), (8, 8, 3));
        assert!(y.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_export_then_load_is_identity() {
        let mut rng = StdRng::seed_from_u64(4);
        let down_plan = plan(3, 5, true, false);
        let up_plan = plan(5, 2, true, false);
        let head_plan = plan(2, 3, false, false);

        let stages = [
            Stage::init_down(&down_plan, &mut rng).unwrap(),
            Stage::init_up(&up_plan, &mut rng).unwrap(),
            Stage::init_head(&head_plan, &mut rng).unwrap(),
        ];

        let mut checkpoint = Checkpoint::new();
        for (i, stage) in stages.iter().enumerate() {
            stage.export(&mut checkpoint, &format!("s{i}")).unwrap();
        }

        let restored = [
            Stage::load_down(&mut checkpoint, "s0", &down_plan).unwrap(),
            Stage::load_up(&mut checkpoint, "s1", &up_plan).unwrap(),
            Stage::load_head(&mut checkpoint, "s2", &head_plan).unwrap(),
        ];

        assert_eq!(restored, stages);
        assert!(checkpoint.is_empty());
    }

    #[test]
    fn test_transposed_kernel_layout() {
        let mut rng = StdRng::seed_from_u64(5);
        let stage = Stage::init_up(&plan(6, 4, true, false), &mut rng).unwrap();

        let mut checkpoint = Checkpoint::new();
        stage.export(&mut checkpoint, "up").unwrap();

        let kernel = checkpoint.get("up.conv.kernel").unwrap();
        assert_eq!(kernel.shape(), &[4, 4, 4, 6]);
        assert_eq!(stage.in_channels(), 6);
        assert_eq!(stage.out_channels(), 4);
    }

    #[test]
    fn test_training_regime_is_random() {
        let mut rng = StdRng::seed_from_u64(6);
        let stage = Stage::init_up(&plan(4, 8, true, true), &mut rng).unwrap();
        let x = Array3::from_shape_fn((4, 4, 4), |(y, x, c)| (y + x + c) as f32 * 0.1);

        let eval_a = stage.forward(&x, &mut Regime::Evaluation).unwrap();
        let eval_b = stage.forward(&x, &mut Regime::Evaluation).unwrap();
        assert_eq!(eval_a, eval_b);

        let mut rng_a = StdRng::seed_from_u64(10);
        let mut rng_b = StdRng::seed_from_u64(11);
        let train_a = stage.forward(&x, &mut Regime::Training(&mut rng_a)).unwrap();
        let train_b = stage.forward(&x, &mut Regime::Training(&mut rng_b)).unwrap();
        assert_ne!(train_a, train_b);
    }
}
