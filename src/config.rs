use crate::{
    common::*,
    model::{ActivationKind, NormKind},
};

/// Attention-layer plan shared by the flow network and the target decoder.
///
/// A depth `d` in the set means "apply flow-guided attention at the decoder
/// stage whose remaining distance to full resolution is `d`". Both networks
/// consume the same plan so they cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAttnLayers", into = "RawAttnLayers")]
pub struct AttnLayers {
    layers: BTreeSet<usize>,
    kernel_sizes: BTreeMap<usize, usize>,
}

/// Wire form of [`AttnLayers`]; deserialization funnels through
/// [`AttnLayers::new`] so invalid plans never materialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAttnLayers {
    layers: Vec<usize>,
    kernel_sizes: Vec<(usize, usize)>,
}

impl From<AttnLayers> for RawAttnLayers {
    fn from(attn: AttnLayers) -> Self {
        Self {
            layers: attn.layers.into_iter().collect(),
            kernel_sizes: attn.kernel_sizes.into_iter().collect(),
        }
    }
}

impl TryFrom<RawAttnLayers> for AttnLayers {
    type Error = anyhow::Error;

    fn try_from(raw: RawAttnLayers) -> Result<Self> {
        Self::new(
            raw.layers.into_iter().collect(),
            raw.kernel_sizes.into_iter().collect(),
        )
    }
}

impl AttnLayers {
    pub fn new(layers: BTreeSet<usize>, kernel_sizes: BTreeMap<usize, usize>) -> Result<Self> {
        ensure!(!layers.is_empty(), "attention layer set must not be empty");

        for &depth in &layers {
            let ksize = *kernel_sizes.get(&depth).ok_or_else(|| {
                format_err!("no extractor kernel size configured for attention depth {}", depth)
            })?;
            ensure!(
                ksize % 2 == 1,
                "extractor kernel size must be odd, got {} at depth {}",
                ksize,
                depth
            );
        }

        Ok(Self {
            layers,
            kernel_sizes,
        })
    }

    pub fn contains(&self, depth: usize) -> bool {
        self.layers.contains(&depth)
    }

    pub fn min(&self) -> usize {
        *self.layers.iter().next().unwrap()
    }

    pub fn max(&self) -> usize {
        *self.layers.iter().next_back().unwrap()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn kernel_size(&self, depth: usize) -> Result<usize> {
        self.kernel_sizes
            .get(&depth)
            .copied()
            .ok_or_else(|| format_err!("no extractor kernel size for attention depth {}", depth))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.iter().copied()
    }
}

/// Construction-time hyperparameters for the generator family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub image_nc: usize,
    pub structure_nc: usize,
    pub output_nc: usize,
    pub ngf: usize,
    pub img_f: usize,
    pub layers: usize,
    pub num_blocks: usize,
    pub flow_ngf: usize,
    pub flow_img_f: usize,
    pub encoder_layer: usize,
    pub attn: AttnLayers,
    pub norm: NormKind,
    pub activation: ActivationKind,
    pub use_spect: bool,
    pub use_coord: bool,
    /// Number of foreground candidate groups summed during pose compositing.
    pub fg_groups: usize,
}

impl GeneratorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = json5::from_str(&fs::read_to_string(path)?)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            image_nc,
            structure_nc,
            output_nc,
            ngf,
            img_f,
            layers,
            num_blocks,
            flow_ngf,
            flow_img_f,
            encoder_layer,
            ref attn,
            fg_groups,
            ..
        } = *self;

        ensure!(image_nc > 0 && structure_nc > 0 && output_nc > 0, "channel counts must be positive");
        ensure!(ngf > 0 && flow_ngf > 0, "ngf must be positive");
        ensure!(img_f >= ngf, "img_f {} must be at least ngf {}", img_f, ngf);
        ensure!(
            flow_img_f >= flow_ngf,
            "flow_img_f {} must be at least flow_ngf {}",
            flow_img_f,
            flow_ngf
        );
        ensure!(layers >= 1, "layers must be at least 1");
        ensure!(num_blocks >= 1, "num_blocks must be at least 1");
        ensure!(fg_groups >= 1, "fg_groups must be at least 1");

        ensure!(
            attn.min() >= 1,
            "attention depth 0 is not decodable, got minimum depth {}",
            attn.min()
        );
        ensure!(
            attn.max() < encoder_layer,
            "maximum attention depth {} is unreachable with flow encoder depth {}, heads reach depth {} at most",
            attn.max(),
            encoder_layer,
            encoder_layer - 1
        );
        ensure!(
            attn.max() <= layers,
            "maximum attention depth {} exceeds decoder depth {}",
            attn.max(),
            layers
        );

        Ok(())
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let attn = AttnLayers::new(
            BTreeSet::from([1, 2]),
            BTreeMap::from([(1, 5), (2, 5)]),
        )
        .unwrap();

        Self {
            image_nc: 3,
            structure_nc: 18,
            output_nc: 3,
            ngf: 64,
            img_f: 1024,
            layers: 6,
            num_blocks: 2,
            flow_ngf: 32,
            flow_img_f: 256,
            encoder_layer: 5,
            attn,
            norm: NormKind::Batch,
            activation: ActivationKind::LeakyRelu,
            use_spect: true,
            use_coord: false,
            fg_groups: 3,
        }
    }
}
