//! EfficientNet frame encoder.
//!
//! Parameter names follow the timm layout (`conv_stem`, `bn1`,
//! `blocks.{stage}.{block}.*`, `conv_head`, `bn2`) so ImageNet weights
//! published for timm load by name.
//!
//! The encoder is split structurally: the stem and stages before
//! `trainable_from_stage` (and the head convolution unless
//! `train_head_conv` is set) are created in the frozen variable map and
//! always run in inference mode. The activation entering the first trainable
//! layer is detached, so no gradient is ever computed for frozen
//! parameters.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    VarBuilder,
};
use deepfake_core::BACKBONE_STAGES;

/// Channel counts are rounded to multiples of this.
const CHANNEL_DIVISOR: usize = 8;

/// Squeeze-and-excitation reduction relative to the block input channels.
const SE_RATIO: f64 = 0.25;

const BN_EPS: f64 = 1e-5;

/// One stage of the MBConv stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub kernel: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub out_channels: usize,
    pub repeats: usize,
}

const fn stage(
    kernel: usize,
    stride: usize,
    expand_ratio: usize,
    out_channels: usize,
    repeats: usize,
) -> StageSpec {
    StageSpec {
        kernel,
        stride,
        expand_ratio,
        out_channels,
        repeats,
    }
}

/// EfficientNet-B0 stage table before width/depth scaling.
const B0_STAGES: [StageSpec; BACKBONE_STAGES] = [
    stage(3, 1, 1, 16, 1),
    stage(3, 2, 6, 24, 2),
    stage(5, 2, 6, 40, 2),
    stage(3, 2, 6, 80, 3),
    stage(5, 1, 6, 112, 3),
    stage(5, 2, 6, 192, 4),
    stage(3, 1, 6, 320, 1),
];
const B0_STEM: usize = 32;
const B0_HEAD: usize = 1280;

/// Round `v` to the nearest multiple of 8, never dropping more than 10%.
#[must_use]
pub fn make_divisible(v: f64) -> usize {
    let rounded = ((v + CHANNEL_DIVISOR as f64 / 2.0) as usize) / CHANNEL_DIVISOR * CHANNEL_DIVISOR;
    let rounded = rounded.max(CHANNEL_DIVISOR);
    if (rounded as f64) < 0.9 * v {
        rounded + CHANNEL_DIVISOR
    } else {
        rounded
    }
}

/// Concrete layer sizes for one width/depth scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneArch {
    pub stem_channels: usize,
    pub stages: Vec<StageSpec>,
    pub head_channels: usize,
}

impl BackboneArch {
    /// Scale the B0 table: channels by `width` (rounded with
    /// [`make_divisible`]), repeats by `depth` (rounded up).
    #[must_use]
    pub fn scaled(width: f64, depth: f64) -> Self {
        let stages = B0_STAGES
            .iter()
            .map(|s| StageSpec {
                out_channels: make_divisible(s.out_channels as f64 * width),
                repeats: (s.repeats as f64 * depth).ceil() as usize,
                ..*s
            })
            .collect();
        Self {
            stem_channels: make_divisible(B0_STEM as f64 * width),
            stages,
            head_channels: make_divisible(B0_HEAD as f64 * width),
        }
    }

    /// Length of the pooled feature vector per frame.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.head_channels
    }
}

/// Which parts of the encoder receive gradient updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezePolicy {
    /// Stages with index `>= trainable_from_stage` are trainable.
    pub trainable_from_stage: usize,
    pub train_head_conv: bool,
}

impl FreezePolicy {
    fn stage_trainable(&self, stage: usize) -> bool {
        stage >= self.trainable_from_stage
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

fn conv_config(kernel: usize, stride: usize, groups: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding: kernel / 2,
        stride,
        groups,
        ..Default::default()
    }
}

fn bn(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    batch_norm(
        channels,
        BatchNormConfig {
            eps: BN_EPS,
            ..Default::default()
        },
        vb,
    )
}

/// Convolution (no bias) followed by batch norm and optional SiLU.
#[derive(Debug, Clone)]
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
    act: bool,
}

impl ConvBn {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_ch: usize,
        out_ch: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        act: bool,
        vb: &VarBuilder,
        conv_name: &str,
        bn_name: &str,
    ) -> Result<Self> {
        let conv = conv2d_no_bias(
            in_ch,
            out_ch,
            kernel,
            conv_config(kernel, stride, groups),
            vb.pp(conv_name),
        )?;
        let bn = bn(out_ch, vb.pp(bn_name))?;
        Ok(Self { conv, bn, act })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, train)?;
        if self.act {
            x.silu()
        } else {
            Ok(x)
        }
    }
}

#[derive(Debug, Clone)]
struct SqueezeExcite {
    reduce: Conv2d,
    expand: Conv2d,
}

impl SqueezeExcite {
    fn new(channels: usize, reduced: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig::default();
        Ok(Self {
            reduce: conv2d(channels, reduced, 1, cfg, vb.pp("conv_reduce"))?,
            expand: conv2d(reduced, channels, 1, cfg, vb.pp("conv_expand"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.mean_keepdim(3)?.mean_keepdim(2)?;
        let s = self.reduce.forward(&s)?.silu()?;
        let gate = candle_nn::ops::sigmoid(&self.expand.forward(&s)?)?;
        x.broadcast_mul(&gate)
    }
}

/// MBConv block. Blocks with expand ratio 1 have no expansion convolution
/// and use the depthwise-separable parameter layout.
#[derive(Debug, Clone)]
struct MbConv {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    se: SqueezeExcite,
    project: ConvBn,
    residual: bool,
}

impl MbConv {
    fn new(in_ch: usize, out_ch: usize, spec: &StageSpec, stride: usize, vb: VarBuilder) -> Result<Self> {
        let reduced = ((in_ch as f64 * SE_RATIO).round() as usize).max(1);
        let k = spec.kernel;
        let residual = stride == 1 && in_ch == out_ch;

        if spec.expand_ratio == 1 {
            let depthwise = ConvBn::new(in_ch, in_ch, k, stride, in_ch, true, &vb, "conv_dw", "bn1")?;
            let se = SqueezeExcite::new(in_ch, reduced, vb.pp("se"))?;
            let project = ConvBn::new(in_ch, out_ch, 1, 1, 1, false, &vb, "conv_pw", "bn2")?;
            return Ok(Self {
                expand: None,
                depthwise,
                se,
                project,
                residual,
            });
        }

        let mid = in_ch * spec.expand_ratio;
        let expand = ConvBn::new(in_ch, mid, 1, 1, 1, true, &vb, "conv_pw", "bn1")?;
        let depthwise = ConvBn::new(mid, mid, k, stride, mid, true, &vb, "conv_dw", "bn2")?;
        let se = SqueezeExcite::new(mid, reduced, vb.pp("se"))?;
        let project = ConvBn::new(mid, out_ch, 1, 1, 1, false, &vb, "conv_pwl", "bn3")?;
        Ok(Self {
            expand: Some(expand),
            depthwise,
            se,
            project,
            residual,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = match &self.expand {
            Some(expand) => expand.forward_t(x, train)?,
            None => x.clone(),
        };
        h = self.depthwise.forward_t(&h, train)?;
        h = self.se.forward(&h)?;
        h = self.project.forward_t(&h, train)?;
        if self.residual {
            h + x
        } else {
            Ok(h)
        }
    }
}

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

/// EfficientNet feature extractor: image batch `(N, 3, H, W)` to pooled
/// features `(N, F)`.
#[derive(Debug, Clone)]
pub struct Backbone {
    stem: ConvBn,
    stages: Vec<Vec<MbConv>>,
    head: ConvBn,
    policy: FreezePolicy,
    feature_dim: usize,
}

impl Backbone {
    /// Build the encoder, placing every parameter in `frozen` or
    /// `trainable` according to `policy`.
    pub fn new(
        arch: &BackboneArch,
        policy: FreezePolicy,
        frozen: VarBuilder,
        trainable: VarBuilder,
    ) -> Result<Self> {
        let stem = ConvBn::new(3, arch.stem_channels, 3, 2, 1, true, &frozen, "conv_stem", "bn1")?;

        let mut in_ch = arch.stem_channels;
        let mut stages = Vec::with_capacity(arch.stages.len());
        for (s, spec) in arch.stages.iter().enumerate() {
            let vb = if policy.stage_trainable(s) { &trainable } else { &frozen };
            let vb = vb.pp(format!("blocks.{s}"));
            let mut blocks = Vec::with_capacity(spec.repeats);
            for b in 0..spec.repeats {
                let stride = if b == 0 { spec.stride } else { 1 };
                blocks.push(MbConv::new(in_ch, spec.out_channels, spec, stride, vb.pp(b))?);
                in_ch = spec.out_channels;
            }
            stages.push(blocks);
        }

        let vb = if policy.train_head_conv { &trainable } else { &frozen };
        let head = ConvBn::new(in_ch, arch.head_channels, 1, 1, 1, true, vb, "conv_head", "bn2")?;

        Ok(Self {
            stem,
            stages,
            head,
            policy,
            feature_dim: arch.head_channels,
        })
    }

    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Encode and globally average-pool a batch of images.
    ///
    /// `train` only affects trainable layers; frozen layers always use
    /// their running batch-norm statistics.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.stem.forward_t(x, false)?;
        for (s, blocks) in self.stages.iter().enumerate() {
            let trainable = self.policy.stage_trainable(s);
            if s == self.policy.trainable_from_stage {
                x = x.detach();
            }
            for block in blocks {
                x = block.forward_t(&x, train && trainable)?;
            }
        }
        if self.policy.trainable_from_stage >= self.stages.len() {
            x = x.detach();
        }
        x = self.head.forward_t(&x, train && self.policy.train_head_conv)?;
        let pooled = x.mean((2, 3))?;
        if self.policy.trainable_from_stage >= self.stages.len() && !self.policy.train_head_conv {
            Ok(pooled.detach())
        } else {
            Ok(pooled)
        }
    }
}
