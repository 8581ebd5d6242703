// Multi-directional MDLSTM
//
// A single sweep only lets cell (r, c) see the region above and to its left.
// Running four sweeps, each on a flipped copy of the input with its own
// parameter bundle, gives every cell context from all four quadrants:
//
//   Original     top-left  → bottom-right
//   FlipHeight   bottom-left → top-right
//   FlipWidth    top-right → bottom-left
//   FlipBoth     bottom-right → top-left
//
// Each direction's output is flipped back, so all maps align with the input.
// The classifier flattens every map per example, concatenates them in the
// order above and projects with a Linear head.
//
// Directions share nothing, so with Parallelism::Rayon they run as one rayon
// fork-join; outputs are identical to the sequential loop.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use mdrnn_core::backend::Backend;
use mdrnn_core::context::ExecutionContext;
use mdrnn_core::error::{Error, Result};
use mdrnn_core::shape::Shape;
use mdrnn_core::tensor::Tensor;
use mdrnn_core::SizeTwoDimensional;

use super::engine::{MdlstmEngine, OutputGating};
use super::parameters::{MdlstmParameters, DEFAULT_DROPOUT_P};
use crate::linear::Linear;
use crate::module::{prefixed, Module};

/// Number of classes of the default classifier head.
pub const DEFAULT_NUM_CLASSES: usize = 10;

/// One sweep order over the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanDirection {
    Original,
    FlipHeight,
    FlipWidth,
    FlipBoth,
}

impl ScanDirection {
    /// All four directions, in output order.
    pub const ALL: [ScanDirection; 4] = [
        ScanDirection::Original,
        ScanDirection::FlipHeight,
        ScanDirection::FlipWidth,
        ScanDirection::FlipBoth,
    ];

    /// Flip `[N, C, H, W]` into this direction's sweep order. Every flip is
    /// its own inverse, so the same call maps outputs back.
    pub fn apply<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        match self {
            ScanDirection::Original => Ok(x.clone()),
            ScanDirection::FlipHeight => x.flip(2),
            ScanDirection::FlipWidth => x.flip(3),
            ScanDirection::FlipBoth => x.flip(2)?.flip(3),
        }
    }
}

/// One direction or all four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionMode {
    Single,
    #[default]
    Multi,
}

impl DirectionMode {
    pub fn directions(&self) -> &'static [ScanDirection] {
        match self {
            DirectionMode::Single => &ScanDirection::ALL[..1],
            DirectionMode::Multi => &ScanDirection::ALL,
        }
    }
}

/// How independent directions are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    #[default]
    Sequential,
    Rayon,
}

/// Construction parameters of an MDLSTM layer.
///
/// ```ignore
/// let mut config = MdlstmConfig::new(1, 8, SizeTwoDimensional::new(32, 32)?);
/// config.parallelism = Parallelism::Rayon;
/// let model = MultiDimensionalLstm::new(config, &ctx)?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MdlstmConfig {
    pub input_channels: usize,
    pub hidden_size: usize,
    /// Spatial size the classifier head is built for.
    pub input_size: SizeTwoDimensional,
    pub num_classes: usize,
    pub directions: DirectionMode,
    pub use_dropout: bool,
    pub dropout_p: f64,
    pub output_gating: OutputGating,
    pub parallelism: Parallelism,
}

impl MdlstmConfig {
    /// Four directions, ten classes, no dropout, sequential directions.
    pub fn new(input_channels: usize, hidden_size: usize, input_size: SizeTwoDimensional) -> Self {
        MdlstmConfig {
            input_channels,
            hidden_size,
            input_size,
            num_classes: DEFAULT_NUM_CLASSES,
            directions: DirectionMode::Multi,
            use_dropout: false,
            dropout_p: DEFAULT_DROPOUT_P,
            output_gating: OutputGating::Default,
            parallelism: Parallelism::Sequential,
        }
    }

    /// Width of the concatenated per-example feature vector.
    pub fn feature_size(&self) -> usize {
        self.input_size.area() * self.hidden_size * self.directions.directions().len()
    }
}

/// Parameter bundles for a set of scan directions, with the engine that
/// runs them.
pub struct DirectionSet<B: Backend> {
    directions: Vec<ScanDirection>,
    bundles: Vec<MdlstmParameters<B>>,
    engine: MdlstmEngine,
    parallelism: Parallelism,
}

impl<B: Backend> DirectionSet<B> {
    pub fn new(config: &MdlstmConfig, ctx: &ExecutionContext<B>) -> Result<Self> {
        let directions = config.directions.directions().to_vec();
        let bundles = directions
            .iter()
            .map(|_| {
                MdlstmParameters::new(
                    config.input_channels,
                    config.hidden_size,
                    config.use_dropout,
                    config.dropout_p,
                    ctx,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DirectionSet {
            directions,
            bundles,
            engine: MdlstmEngine::new(config.output_gating),
            parallelism: config.parallelism,
        })
    }

    /// Use existing bundles, one per direction in [`ScanDirection::ALL`]
    /// order (1 bundle → single direction, 4 → all).
    pub fn from_bundles(
        bundles: Vec<MdlstmParameters<B>>,
        output_gating: OutputGating,
        parallelism: Parallelism,
    ) -> Result<Self> {
        let mode = match bundles.len() {
            1 => DirectionMode::Single,
            4 => DirectionMode::Multi,
            n => {
                return Err(Error::msg(format!(
                    "expected 1 or 4 direction bundles, got {n}"
                )))
            }
        };
        Ok(DirectionSet {
            directions: mode.directions().to_vec(),
            bundles,
            engine: MdlstmEngine::new(output_gating),
            parallelism,
        })
    }

    pub fn directions(&self) -> &[ScanDirection] {
        &self.directions
    }

    pub fn bundles(&self) -> &[MdlstmParameters<B>] {
        &self.bundles
    }

    pub fn engine(&self) -> MdlstmEngine {
        self.engine
    }

    fn run_one(
        &self,
        direction: ScanDirection,
        bundle: &MdlstmParameters<B>,
        x: &Tensor<B>,
    ) -> Result<Tensor<B>> {
        let flipped = direction.apply(x)?;
        let out = self.engine.run_direction(bundle, &flipped)?;
        direction.apply(&out)
    }

    /// `[N, C, H, W]` → one `[N, hidden, H, W]` map per direction, aligned
    /// with the input.
    pub fn forward_directions(&self, x: &Tensor<B>) -> Result<Vec<Tensor<B>>> {
        let pairs: Vec<(ScanDirection, &MdlstmParameters<B>)> = self
            .directions
            .iter()
            .copied()
            .zip(self.bundles.iter())
            .collect();
        match self.parallelism {
            Parallelism::Sequential => pairs
                .iter()
                .map(|&(direction, bundle)| self.run_one(direction, bundle, x))
                .collect(),
            Parallelism::Rayon => pairs
                .par_iter()
                .map(|&(direction, bundle)| self.run_one(direction, bundle, x))
                .collect(),
        }
    }

    pub fn set_training(&self, training: bool) {
        for bundle in &self.bundles {
            bundle.set_training(training);
        }
    }

    pub fn parameters(&self) -> Vec<Tensor<B>> {
        self.bundles.iter().flat_map(|b| b.parameters()).collect()
    }

    /// `directions.{i}.{kernel}.{weight|bias}`.
    pub fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.bundles
            .iter()
            .enumerate()
            .flat_map(|(i, b)| prefixed(&format!("directions.{i}"), b.named_parameters()))
            .collect()
    }
}

/// MDLSTM classifier: directions → flatten → concat → Linear.
pub struct MultiDimensionalLstm<B: Backend> {
    config: MdlstmConfig,
    directions: DirectionSet<B>,
    head: Linear<B>,
    training: AtomicBool,
}

impl<B: Backend> MultiDimensionalLstm<B> {
    pub fn new(config: MdlstmConfig, ctx: &ExecutionContext<B>) -> Result<Self> {
        let directions = DirectionSet::new(&config, ctx)?;
        let head = Linear::new(config.feature_size(), config.num_classes, true, ctx)?;
        log::debug!(
            "mdlstm classifier: {} direction(s), input {}, {} features -> {} classes",
            directions.directions().len(),
            config.input_size,
            config.feature_size(),
            config.num_classes
        );
        Ok(MultiDimensionalLstm {
            config,
            directions,
            head,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &MdlstmConfig {
        &self.config
    }

    pub fn direction_set(&self) -> &DirectionSet<B> {
        &self.directions
    }

    pub fn head(&self) -> &Linear<B> {
        &self.head
    }

    /// Per-direction feature maps, before the head.
    pub fn forward_directions(&self, x: &Tensor<B>) -> Result<Vec<Tensor<B>>> {
        let (n, c, h, w) = x.shape().dims4()?;
        let size = self.config.input_size;
        if (h, w) != (size.height(), size.width()) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((n, c, size.height(), size.width())),
                got: x.shape().clone(),
            });
        }
        self.directions.forward_directions(x)
    }
}

impl<B: Backend> Module<B> for MultiDimensionalLstm<B> {
    /// `[N, C, H, W]` → class scores `[N, num_classes]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let features = self
            .forward_directions(x)?
            .iter()
            .map(|map| map.flatten(1, 3))
            .collect::<Result<Vec<_>>>()?;
        let combined = Tensor::cat(&features, 1)?;
        self.head.forward(&combined)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = self.directions.parameters();
        params.extend(self.head.parameters());
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = self.directions.named_parameters();
        named.extend(prefixed("head", self.head.named_parameters()));
        named
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.directions.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }
}
