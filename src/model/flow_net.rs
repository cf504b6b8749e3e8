use super::{
    block::{BlockInit, EncoderBlock, Jump, ResBlockDecoder, ResBlocks},
    conv::{Conv2D, Conv2DInit},
    misc::channel_mult,
};
use crate::{common::*, config::AttnLayers};

/// Number of independent source streams a flow head predicts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSources {
    One,
    Two,
}

impl FlowSources {
    pub fn count(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

/// Dense correspondence fields and blending masks, one pair per attention
/// layer per source, appended in increasing-resolution order. For two-source
/// heads the previous-frame pair precedes the reference pair.
#[derive(Debug)]
pub struct FlowMaps {
    pub flows: Vec<Tensor>,
    pub masks: Vec<Tensor>,
}

#[derive(Debug, Clone)]
pub struct FlowNetInit {
    pub input_channels: usize,
    pub ngf: usize,
    pub img_f: usize,
    pub encoder_layer: usize,
    pub attn: AttnLayers,
    pub sources: FlowSources,
    /// Structure channel count for multi-view bottleneck fusion.
    pub structure_fusion: Option<usize>,
    pub block: BlockInit,
}

impl FlowNetInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<FlowNet> {
        let path = path.borrow();
        let Self {
            input_channels,
            ngf,
            img_f,
            encoder_layer,
            attn,
            sources,
            structure_fusion,
            block,
        } = self;

        ensure!(encoder_layer >= 2, "flow encoder needs at least two layers");
        ensure!(img_f >= ngf, "img_f must be at least ngf");
        // heads sit at depths attn.min()..=encoder_layer-1
        ensure!(
            attn.min() >= 1 && attn.max() < encoder_layer,
            "attention depths {}..={} do not fit a flow encoder of depth {}, heads reach depth {} at most",
            attn.min(),
            attn.max(),
            encoder_layer,
            encoder_layer - 1
        );
        let decoder_layer = encoder_layer - attn.min();

        let encoders: Vec<_> = (0..encoder_layer)
            .map(|depth| {
                let in_c = if depth == 0 {
                    input_channels
                } else {
                    ngf * channel_mult(depth - 1, ngf, img_f)
                };
                let out_c = ngf * channel_mult(depth, ngf, img_f);
                EncoderBlock::new(path / format!("encoder_{}", depth), block, in_c, out_c)
            })
            .try_collect()?;

        let bottleneck_c = ngf * channel_mult(encoder_layer - 1, ngf, img_f);
        let fusion = structure_fusion
            .map(|structure_nc| {
                ResBlocks::new(
                    path / "fusion",
                    block,
                    1,
                    bottleneck_c + structure_nc,
                    bottleneck_c,
                )
            })
            .transpose()?;

        let stages: Vec<_> = (0..decoder_layer)
            .map(|i| -> Result<_> {
                let in_c = ngf * channel_mult(encoder_layer - 1 - i, ngf, img_f);
                let out_c = ngf * channel_mult(encoder_layer - 2 - i, ngf, img_f);

                let decoder = ResBlockDecoder::new(
                    path / format!("decoder_{}", i),
                    block,
                    in_c,
                    out_c,
                    Some(out_c),
                )?;
                let jump = Jump::new(path / format!("jump_{}", i), block, out_c, out_c)?;

                let head = attn
                    .contains(encoder_layer - 1 - i)
                    .then(|| FlowHead::new(path / format!("head_{}", i), out_c, sources))
                    .transpose()?;

                Ok(FlowStage {
                    decoder,
                    jump,
                    head,
                })
            })
            .try_collect()?;

        Ok(FlowNet {
            encoders,
            fusion,
            stages,
            encoder_layer,
            input_channels: input_channels as i64,
        })
    }
}

#[derive(Debug)]
struct FlowStage {
    decoder: ResBlockDecoder,
    jump: Jump,
    head: Option<FlowHead>,
}

/// Paired flow and mask projections at one attention layer.
#[derive(Debug)]
struct FlowHead {
    flow_conv: Conv2D,
    mask_conv: Conv2D,
    sources: FlowSources,
}

impl FlowHead {
    fn new<'a>(path: impl Borrow<nn::Path<'a>>, in_c: usize, sources: FlowSources) -> Result<Self> {
        let path = path.borrow();
        let flow_conv = Conv2DInit::new(3).build(path / "flow", in_c, 2 * sources.count())?;
        let mask_conv = Conv2DInit::new(3).build(path / "mask", in_c, sources.count())?;

        Ok(Self {
            flow_conv,
            mask_conv,
            sources,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> (Vec<Tensor>, Vec<Tensor>) {
        let flow = self.flow_conv.forward_t(xs, train);
        let mask = self.mask_conv.forward_t(xs, train).sigmoid();

        match self.sources {
            FlowSources::One => (vec![flow], vec![mask]),
            FlowSources::Two => (flow.split(2, 1), mask.split(1, 1)),
        }
    }
}

#[derive(Debug)]
pub struct FlowNet {
    encoders: Vec<EncoderBlock>,
    fusion: Option<ResBlocks>,
    stages: Vec<FlowStage>,
    encoder_layer: usize,
    input_channels: i64,
}

impl FlowNet {
    /// `viewpoint_delta` is required exactly when bottleneck fusion is
    /// configured; it is tiled over the bottleneck's spatial extent.
    pub fn forward_t(
        &self,
        input: &Tensor,
        viewpoint_delta: Option<&Tensor>,
        train: bool,
    ) -> Result<FlowMaps> {
        let Self {
            ref encoders,
            ref fusion,
            ref stages,
            encoder_layer,
            input_channels,
            ..
        } = *self;

        let (_b, in_c, _h, _w) = input
            .size4()
            .with_context(|| format!("expect input shape [B, C, H, W], but get {:?}", input.size()))?;
        ensure!(
            in_c == input_channels,
            "flow network expects {} input channels, got {}",
            input_channels,
            in_c
        );
        ensure!(
            fusion.is_some() == viewpoint_delta.is_some(),
            "viewpoint delta must be supplied exactly when bottleneck fusion is configured"
        );

        let mut skips = Vec::with_capacity(encoder_layer);
        let mut out = input.shallow_clone();
        for encoder in encoders {
            out = encoder.forward_t(&out, train);
            skips.push(out.shallow_clone());
        }

        if let (Some(fusion), Some(delta)) = (fusion, viewpoint_delta) {
            let (_b, _c, h, w) = out.size4()?;
            let delta = delta.repeat(&[1, 1, h, w]);
            out = fusion.forward_t(&Tensor::cat(&[&out, &delta], 1), train);
        }

        let mut flows = vec![];
        let mut masks = vec![];
        for (i, stage) in stages.iter().enumerate() {
            out = stage.decoder.forward_t(&out, train);
            out = out + stage.jump.forward_t(&skips[encoder_layer - i - 2], train);

            if let Some(head) = &stage.head {
                let (mut stage_flows, mut stage_masks) = head.forward_t(&out, train);
                flows.append(&mut stage_flows);
                masks.append(&mut stage_masks);
            }
        }

        Ok(FlowMaps { flows, masks })
    }
}
