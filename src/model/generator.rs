use super::{
    block::BlockInit,
    flow_net::{FlowMaps, FlowNet, FlowNetInit, FlowSources},
    source::{SourceEncoder, SourceEncoderInit},
    target::{TargetDecoder, TargetDecoderInit},
};
use crate::{common::*, config::GeneratorConfig};

/// Frozen, externally trained background inpainting network. Consumed as a
/// pure feature function; never trained or mutated here.
pub trait BackgroundGenerator {
    fn generate(&self, conditioning: &Tensor) -> Result<Tensor>;
}

impl BlockInit {
    fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            norm: config.norm,
            activation: config.activation,
            use_spect: config.use_spect,
            use_coord: config.use_coord,
        }
    }
}

fn source_encoder_init(config: &GeneratorConfig) -> SourceEncoderInit {
    SourceEncoderInit {
        input_channels: config.image_nc,
        ngf: config.ngf,
        img_f: config.img_f,
        layers: config.layers,
        block: BlockInit::from_config(config),
    }
}

fn flow_net_init(
    config: &GeneratorConfig,
    input_channels: usize,
    sources: FlowSources,
    structure_fusion: Option<usize>,
) -> FlowNetInit {
    FlowNetInit {
        input_channels,
        ngf: config.flow_ngf,
        img_f: config.flow_img_f,
        encoder_layer: config.encoder_layer,
        attn: config.attn.clone(),
        sources,
        structure_fusion,
        block: BlockInit::from_config(config),
    }
}

fn target_decoder_init(
    config: &GeneratorConfig,
    num_sources: usize,
    broadcast_stem: Option<usize>,
) -> TargetDecoderInit {
    TargetDecoderInit {
        structure_nc: config.structure_nc,
        output_nc: config.output_nc,
        ngf: config.ngf,
        img_f: config.img_f,
        layers: config.layers,
        num_blocks: config.num_blocks,
        attn: config.attn.clone(),
        num_sources,
        broadcast_stem,
        block: BlockInit::from_config(config),
    }
}

/// Merges masked foreground candidates with the frozen background.
///
/// The generated batch holds `groups` candidate generations per sample laid
/// out group-major; candidates are summed per sample, masked, and added to
/// the masked background.
pub fn composite_foreground(
    generated: &Tensor,
    background: &Tensor,
    target_mask: &Tensor,
    background_mask: &Tensor,
    groups: usize,
) -> Result<Tensor> {
    let (gb, c, h, w) = generated.size4().with_context(|| {
        format!(
            "expect generated shape [B, C, H, W], but get {:?}",
            generated.size()
        )
    })?;
    let groups = groups as i64;
    ensure!(groups >= 1, "groups must be at least 1");
    ensure!(
        gb % groups == 0,
        "generated batch {} is not a multiple of {} candidate groups",
        gb,
        groups
    );
    let n = gb / groups;
    ensure!(
        background.size()[0] == n && target_mask.size()[0] == n && background_mask.size()[0] == n,
        "background and masks must have batch size {}, got {} / {} / {}",
        n,
        background.size()[0],
        target_mask.size()[0],
        background_mask.size()[0]
    );

    let foreground = generated
        .view([groups, n, c, h, w])
        .sum_dim_intlist(&[0], false, Kind::Float);

    Ok(background * background_mask + foreground * target_mask)
}

/// Pose-driven single-frame synthesis.
pub struct PoseGenerator {
    source: SourceEncoder,
    target: TargetDecoder,
    flow_net: FlowNet,
    background: Box<dyn BackgroundGenerator>,
    fg_groups: usize,
}

#[derive(Debug)]
pub struct PoseOutput {
    pub image: Tensor,
    pub maps: FlowMaps,
}

impl PoseGenerator {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        config: &GeneratorConfig,
        background: Box<dyn BackgroundGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.borrow();

        let flow_input_nc = config.image_nc + 2 * config.structure_nc;

        Ok(Self {
            source: source_encoder_init(config).build(path / "source")?,
            target: target_decoder_init(config, 1, None).build(path / "target")?,
            flow_net: flow_net_init(config, flow_input_nc, FlowSources::One, None)
                .build(path / "flow_net")?,
            background,
            fg_groups: config.fg_groups,
        })
    }

    pub fn forward_t(
        &self,
        source: &Tensor,
        source_structure: &Tensor,
        target_structure: &Tensor,
        background_conditioning: &Tensor,
        target_mask: &Tensor,
        background_mask: &Tensor,
        train: bool,
    ) -> Result<PoseOutput> {
        let pyramid = self.source.forward_t(source, train)?;
        let background = self.background.generate(background_conditioning)?;

        let flow_input = Tensor::cat(&[source, source_structure, target_structure], 1);
        let maps = self.flow_net.forward_t(&flow_input, None, train)?;

        let generated = self
            .target
            .forward_t(target_structure, &[&pyramid], &maps, train)?;
        let image = composite_foreground(
            &generated,
            &background,
            target_mask,
            background_mask,
            self.fg_groups,
        )?;

        Ok(PoseOutput { image, maps })
    }
}

/// Recurrent state of the face-video generator: the image and structure fed
/// as the "previous frame" of the next step.
#[derive(Debug)]
pub struct FrameState {
    pub image: Tensor,
    pub structure: Tensor,
}

#[derive(Debug)]
pub struct FaceOutput {
    pub frames: Vec<Tensor>,
    pub maps: Vec<FlowMaps>,
    /// Previous-frame images actually consumed at each step, for
    /// supervision outside this crate.
    pub previous_inputs: Vec<Tensor>,
}

/// Multi-frame face-video synthesis conditioned on a reference frame and the
/// previously generated frame.
#[derive(Debug)]
pub struct FaceGenerator {
    source_previous: SourceEncoder,
    source_reference: SourceEncoder,
    target: TargetDecoder,
    flow_net: FlowNet,
}

impl FaceGenerator {
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, config: &GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let path = path.borrow();

        let flow_input_nc = 2 * config.image_nc + 3 * config.structure_nc;

        Ok(Self {
            source_previous: source_encoder_init(config).build(path / "source_previous")?,
            source_reference: source_encoder_init(config).build(path / "source_reference")?,
            target: target_decoder_init(config, 2, None).build(path / "target")?,
            flow_net: flow_net_init(config, flow_input_nc, FlowSources::Two, None)
                .build(path / "flow_net")?,
        })
    }

    /// `target_structures` has shape `[B, n_frames, structure_nc, H, W]`.
    /// When `previous` is absent the reference seeds the recurrence; each
    /// later step consumes the prior step's generated image.
    pub fn forward_t(
        &self,
        target_structures: &Tensor,
        reference: &Tensor,
        reference_structure: &Tensor,
        previous: Option<FrameState>,
        train: bool,
    ) -> Result<FaceOutput> {
        let size = target_structures.size();
        ensure!(
            size.len() == 5,
            "expect target structures shape [B, T, C, H, W], but get {:?}",
            size
        );
        let n_frames = size[1];

        let mut state = previous.unwrap_or_else(|| FrameState {
            image: reference.shallow_clone(),
            structure: reference_structure.shallow_clone(),
        });

        let mut frames = vec![];
        let mut maps_per_frame = vec![];
        let mut previous_inputs = vec![];

        for t in 0..n_frames {
            let structure = target_structures.select(1, t);
            previous_inputs.push(state.image.shallow_clone());

            let previous_pyramid = self.source_previous.forward_t(&state.image, train)?;
            let reference_pyramid = self.source_reference.forward_t(reference, train)?;

            let flow_input = Tensor::cat(
                &[
                    &structure,
                    &state.image,
                    &state.structure,
                    reference,
                    reference_structure,
                ],
                1,
            );
            let maps = self.flow_net.forward_t(&flow_input, None, train)?;

            let frame = self.target.forward_t(
                &structure,
                &[&previous_pyramid, &reference_pyramid],
                &maps,
                train,
            )?;

            state = FrameState {
                image: frame.shallow_clone(),
                structure,
            };

            frames.push(frame);
            maps_per_frame.push(maps);
        }

        Ok(FaceOutput {
            frames,
            maps: maps_per_frame,
            previous_inputs,
        })
    }
}

#[derive(Debug)]
pub struct MultiViewOutput {
    pub image: Tensor,
    pub maps: FlowMaps,
}

/// Multi-view synthesis from discrete viewpoint encodings. The target
/// structure is spatially broadcast up to the decoder bottleneck, and the
/// viewpoint difference is injected at the flow network's bottleneck.
#[derive(Debug)]
pub struct MultiViewGenerator {
    source: SourceEncoder,
    target: TargetDecoder,
    flow_net: FlowNet,
}

/// Tile factor taking the 1×1 viewpoint encoding to the bottleneck extent.
pub const VIEW_BOTTLENECK_TILE: usize = 8;

impl MultiViewGenerator {
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, config: &GeneratorConfig) -> Result<Self> {
        Self::with_bottleneck_tile(path, config, VIEW_BOTTLENECK_TILE)
    }

    pub fn with_bottleneck_tile<'a>(
        path: impl Borrow<nn::Path<'a>>,
        config: &GeneratorConfig,
        tile: usize,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.borrow();

        Ok(Self {
            source: source_encoder_init(config).build(path / "source")?,
            target: target_decoder_init(config, 1, Some(tile)).build(path / "target")?,
            flow_net: flow_net_init(
                config,
                config.image_nc,
                FlowSources::One,
                Some(config.structure_nc),
            )
            .build(path / "flow_net")?,
        })
    }

    pub fn forward_t(
        &self,
        source: &Tensor,
        source_structure: &Tensor,
        target_structure: &Tensor,
        train: bool,
    ) -> Result<MultiViewOutput> {
        let pyramid = self.source.forward_t(source, train)?;

        let viewpoint_delta = source_structure - target_structure;
        let maps = self
            .flow_net
            .forward_t(source, Some(&viewpoint_delta), train)?;

        let image = self
            .target
            .forward_t(target_structure, &[&pyramid], &maps, train)?;

        Ok(MultiViewOutput { image, maps })
    }
}

/// Flow-network-only facade, used when the correspondence stage is trained
/// in isolation.
#[derive(Debug)]
pub struct FlowNetGenerator {
    flow_net: FlowNet,
}

impl FlowNetGenerator {
    pub fn new<'a>(path: impl Borrow<nn::Path<'a>>, config: &GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let path = path.borrow();
        let flow_input_nc = config.image_nc + 2 * config.structure_nc;

        Ok(Self {
            flow_net: flow_net_init(config, flow_input_nc, FlowSources::One, None)
                .build(path / "flow_net")?,
        })
    }

    pub fn forward_t(
        &self,
        source: &Tensor,
        source_structure: &Tensor,
        target_structure: &Tensor,
        train: bool,
    ) -> Result<FlowMaps> {
        let input = Tensor::cat(&[source, source_structure, target_structure], 1);
        self.flow_net.forward_t(&input, None, train)
    }
}
