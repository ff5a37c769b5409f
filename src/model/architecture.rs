//! Static description of the U-Net generator.
//!
//! The layer layout never changes after training, so it is a fixed table of
//! stage descriptions rather than a list built at runtime. Only the base
//! width is configurable; channel counts are multiples of it.

use crate::error::{Error, Result};
use crate::image::{IMAGE_SIZE, RGB_CHANNELS};

/// Kernel size shared by every convolution in the generator.
pub const KERNEL_SIZE: usize = 4;

/// Stride shared by every convolution in the generator.
pub const STRIDE: usize = 2;

/// Number of downsampling stages.
pub const ENCODER_DEPTH: usize = 8;

/// Number of upsampling stages (the output head is separate).
pub const DECODER_DEPTH: usize = 7;

/// Width of the original pix2pix generator.
pub const DEFAULT_BASE_FILTERS: usize = 64;

/// Negative slope of the encoder's leaky rectifier.
pub const LEAKY_SLOPE: f32 = 0.3;

/// Drop probability of the decoder's dropout stages.
pub const DROPOUT_RATE: f32 = 0.5;

/// Epsilon added to the variance in every normalization step.
pub const NORM_EPSILON: f32 = 1e-3;

/// Description of one encoder or decoder stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    /// Output channels as a multiple of the base width.
    pub width: usize,
    /// Whether the convolution is followed by batch normalization.
    pub normalize: bool,
    /// Whether dropout follows normalization (decoder only).
    pub dropout: bool,
}

impl StageSpec {
    const fn down(width: usize, normalize: bool) -> Self {
        Self {
            width,
            normalize,
            dropout: false,
        }
    }

    const fn up(width: usize, dropout: bool) -> Self {
        Self {
            width,
            normalize: true,
            dropout,
        }
    }
}

const ENCODER: [StageSpec; ENCODER_DEPTH] = [
    StageSpec::down(1, false),
    StageSpec::down(2, true),
    StageSpec::down(4, true),
    StageSpec::down(8, true),
    StageSpec::down(8, true),
    StageSpec::down(8, true),
    StageSpec::down(8, true),
    StageSpec::down(8, true),
];

const DECODER: [StageSpec; DECODER_DEPTH] = [
    StageSpec::up(8, true),
    StageSpec::up(8, true),
    StageSpec::up(8, true),
    StageSpec::up(8, false),
    StageSpec::up(4, false),
    StageSpec::up(2, false),
    StageSpec::up(1, false),
];

/// Explicit mapping from decoder stage index to the encoder stage whose output
/// it is concatenated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipTable {
    sources: [usize; DECODER_DEPTH],
}

impl SkipTable {
    /// Build and validate a skip table.
    ///
    /// Every decoder stage must pair with a distinct encoder stage other than
    /// the bottleneck, and the paired outputs must share spatial dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Architecture`] if the pairing is invalid.
    pub fn new(sources: [usize; DECODER_DEPTH]) -> Result<Self> {
        let mut used = [false; ENCODER_DEPTH - 1];

        for (decoder, &encoder) in sources.iter().enumerate() {
            if encoder >= ENCODER_DEPTH - 1 {
                return Err(Error::Architecture {
                    reason: format!(
                        "decoder stage {decoder} skips from encoder stage {encoder}, \
                         only stages 0..{} may be skipped",
                        ENCODER_DEPTH - 1
                    ),
                });
            }
            if std::mem::replace(&mut used[encoder], true) {
                return Err(Error::Architecture {
                    reason: format!("encoder stage {encoder} is paired with more than one decoder stage"),
                });
            }
            let decoded = decoder_resolution(decoder);
            let encoded = encoder_resolution(encoder);
            if decoded != encoded {
                return Err(Error::Architecture {
                    reason: format!(
                        "decoder stage {decoder} produces {decoded}x{decoded} but encoder stage \
                         {encoder} produces {encoded}x{encoded}"
                    ),
                });
            }
        }

        Ok(Self { sources })
    }

    /// The U-Net pairing: encoder outputs except the deepest, in reverse order.
    #[must_use]
    pub const fn reversed() -> Self {
        let mut sources = [0; DECODER_DEPTH];
        let mut i = 0;
        while i < DECODER_DEPTH {
            sources[i] = DECODER_DEPTH - 1 - i;
            i += 1;
        }
        Self { sources }
    }

    /// Encoder stage paired with `decoder`.
    #[must_use]
    pub const fn source(&self, decoder: usize) -> usize {
        self.sources[decoder]
    }

    /// All `(decoder, encoder)` pairs in decoder order.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sources.iter().copied().enumerate()
    }
}

impl Default for SkipTable {
    fn default() -> Self {
        Self::reversed()
    }
}

/// Side length of the output of encoder stage `index`.
#[must_use]
pub const fn encoder_resolution(index: usize) -> usize {
    (IMAGE_SIZE as usize) >> (index + 1)
}

/// Side length of the output of decoder stage `index`.
#[must_use]
pub const fn decoder_resolution(index: usize) -> usize {
    encoder_resolution(ENCODER_DEPTH - 1) << (index + 1)
}

/// Shape bookkeeping for one concrete stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    pub in_channels: usize,
    pub out_channels: usize,
    pub normalize: bool,
    pub dropout: bool,
}

/// The generator's layer layout at a given base width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    base_filters: usize,
    skips: SkipTable,
}

impl Default for Architecture {
    fn default() -> Self {
        Self::pix2pix()
    }
}

impl Architecture {
    /// The architecture the published checkpoints were trained with.
    #[must_use]
    pub const fn pix2pix() -> Self {
        Self {
            base_filters: DEFAULT_BASE_FILTERS,
            skips: SkipTable::reversed(),
        }
    }

    /// Same layout with every channel count scaled to a different base width.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_filters` is zero.
    pub fn with_base_filters(base_filters: usize) -> Result<Self> {
        if base_filters == 0 {
            return Err(Error::InvalidParameter {
                name: "base_filters".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(Self {
            base_filters,
            skips: SkipTable::reversed(),
        })
    }

    /// Replace the skip table.
    #[must_use]
    pub fn with_skips(mut self, skips: SkipTable) -> Self {
        self.skips = skips;
        self
    }

    #[must_use]
    pub const fn base_filters(&self) -> usize {
        self.base_filters
    }

    #[must_use]
    pub const fn skips(&self) -> &SkipTable {
        &self.skips
    }

    /// Output channels of every encoder stage.
    #[must_use]
    pub fn encoder_widths(&self) -> [usize; ENCODER_DEPTH] {
        ENCODER.map(|stage| stage.width * self.base_filters)
    }

    /// Output channels of every decoder stage, before concatenation.
    #[must_use]
    pub fn decoder_widths(&self) -> [usize; DECODER_DEPTH] {
        DECODER.map(|stage| stage.width * self.base_filters)
    }

    /// Channels after concatenating decoder stage `index` with its skip source.
    #[must_use]
    pub fn concat_channels(&self, index: usize) -> usize {
        self.decoder_widths()[index] + self.encoder_widths()[self.skips.source(index)]
    }

    /// Per-stage channel plan for the encoder.
    #[must_use]
    pub fn encoder_plan(&self) -> [StagePlan; ENCODER_DEPTH] {
        let widths = self.encoder_widths();
        std::array::from_fn(|i| StagePlan {
            in_channels: if i == 0 { RGB_CHANNELS } else { widths[i - 1] },
            out_channels: widths[i],
            normalize: ENCODER[i].normalize,
            dropout: ENCODER[i].dropout,
        })
    }

    /// Per-stage channel plan for the decoder.
    #[must_use]
    pub fn decoder_plan(&self) -> [StagePlan; DECODER_DEPTH] {
        let widths = self.decoder_widths();
        let bottleneck = self.encoder_widths()[ENCODER_DEPTH - 1];
        std::array::from_fn(|i| StagePlan {
            in_channels: if i == 0 {
                bottleneck
            } else {
                self.concat_channels(i - 1)
            },
            out_channels: widths[i],
            normalize: DECODER[i].normalize,
            dropout: DECODER[i].dropout,
        })
    }

    /// Channel plan for the output head.
    #[must_use]
    pub fn head_plan(&self) -> StagePlan {
        StagePlan {
            in_channels: self.concat_channels(DECODER_DEPTH - 1),
            out_channels: RGB_CHANNELS,
            normalize: false,
            dropout: false,
        }
    }

    /// Total number of learned scalars.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        let kernel = KERNEL_SIZE * KERNEL_SIZE;
        let stage = |plan: &StagePlan| {
            let norm = if plan.normalize { 4 * plan.out_channels } else { 0 };
            kernel * plan.in_channels * plan.out_channels + norm
        };
        let head = self.head_plan();

        self.encoder_plan().iter().map(stage).sum::<usize>()
            + self.decoder_plan().iter().map(stage).sum::<usize>()
            + kernel * head.in_channels * head.out_channels
            + head.out_channels
    }
}
