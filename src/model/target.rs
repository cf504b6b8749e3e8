use super::{
    block::{BlockInit, EncoderBlock, OutputBlock, ResBlockDecoder, ResBlocks},
    extractor::{ExtractorAttn, ExtractorAttnInit},
    flow_net::FlowMaps,
    misc::channel_mult,
    source::FeaturePyramid,
};
use crate::{common::*, config::AttnLayers};

/// Per-attention-layer tensors recorded by the diagnostic forward.
#[derive(Debug)]
pub struct Diagnostics {
    /// Blended decoder feature after each attention layer.
    pub targets: Vec<Tensor>,
    /// Source pyramid entry consumed at each attention layer.
    pub sources: Vec<Tensor>,
    /// Raw attention weights `[b, k², h, w]` per source.
    pub weights: Vec<Tensor>,
    /// Blending mask per source.
    pub masks: Vec<Tensor>,
}

/// Entry stage of the decoder: encode a full-resolution structure map, or
/// tile a low-resolution viewpoint encoding up to the bottleneck.
#[derive(Debug)]
enum Stem {
    Encoder(Vec<EncoderBlock>),
    Broadcast {
        tile: i64,
        block0: ResBlockDecoder,
        block1: ResBlockDecoder,
    },
}

#[derive(Debug, Clone)]
pub struct TargetDecoderInit {
    pub structure_nc: usize,
    pub output_nc: usize,
    pub ngf: usize,
    pub img_f: usize,
    pub layers: usize,
    pub num_blocks: usize,
    pub attn: AttnLayers,
    pub num_sources: usize,
    /// Tile factor for the multi-view broadcast stem; `None` selects the
    /// structure-encoder stem.
    pub broadcast_stem: Option<usize>,
    pub block: BlockInit,
}

impl TargetDecoderInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<TargetDecoder> {
        let path = path.borrow();
        let Self {
            structure_nc,
            output_nc,
            ngf,
            img_f,
            layers,
            num_blocks,
            attn,
            num_sources,
            broadcast_stem,
            block,
        } = self;

        ensure!(layers >= 1, "target decoder needs at least one layer");
        ensure!(num_blocks >= 1, "num_blocks must be at least 1");
        ensure!(
            (1..=2).contains(&num_sources),
            "only one or two source streams are supported, got {}",
            num_sources
        );
        ensure!(
            attn.max() <= layers,
            "attention depth {} exceeds decoder depth {}",
            attn.max(),
            layers
        );

        let bottleneck_mult = channel_mult(layers - 1, ngf, img_f);
        let stem = match broadcast_stem {
            None => {
                let encoders: Vec<_> = (0..layers)
                    .map(|depth| {
                        let in_c = if depth == 0 {
                            structure_nc
                        } else {
                            ngf * channel_mult(depth - 1, ngf, img_f)
                        };
                        let out_c = ngf * channel_mult(depth, ngf, img_f);
                        EncoderBlock::new(path / format!("stem_{}", depth), block, in_c, out_c)
                    })
                    .try_collect()?;
                Stem::Encoder(encoders)
            }
            Some(tile) => {
                ensure!(tile >= 1, "broadcast tile factor must be positive");
                Stem::Broadcast {
                    tile: tile as i64,
                    block0: ResBlockDecoder::new(path / "stem_0", block, structure_nc, ngf, None)?,
                    block1: ResBlockDecoder::new(
                        path / "stem_1",
                        block,
                        ngf,
                        ngf * bottleneck_mult,
                        None,
                    )?,
                }
            }
        };

        let stages: Vec<_> = (0..layers)
            .map(|i| -> Result<_> {
                let in_mult = if i == 0 {
                    bottleneck_mult
                } else {
                    channel_mult(layers - 1 - i, ngf, img_f)
                };
                let out_mult = if i == layers - 1 {
                    1
                } else {
                    channel_mult(layers - 2 - i, ngf, img_f)
                };
                let in_c = ngf * in_mult;
                let out_c = ngf * out_mult;

                let attns = attn
                    .contains(layers - i)
                    .then(|| -> Result<_> {
                        let kernel_size = attn.kernel_size(layers - i)?;
                        (0..num_sources)
                            .map(|s| {
                                ExtractorAttnInit {
                                    channels: in_c,
                                    kernel_size,
                                    activation: block.activation,
                                    softmax: true,
                                }
                                .build(path / format!("attn_{}_{}", i, s))
                            })
                            .try_collect::<_, Vec<_>, _>()
                    })
                    .transpose()?;

                let res_blocks = (num_blocks > 1)
                    .then(|| {
                        ResBlocks::new(path / format!("res_{}", i), block, num_blocks - 1, in_c, in_c)
                    })
                    .transpose()?;
                let decoder =
                    ResBlockDecoder::new(path / format!("decoder_{}", i), block, in_c, out_c, None)?;

                Ok(DecodeStage {
                    attns,
                    res_blocks,
                    decoder,
                })
            })
            .try_collect()?;

        let out_block = OutputBlock::new(path / "out", block, ngf, output_nc)?;

        Ok(TargetDecoder {
            stem,
            stages,
            out_block,
            attn,
            num_sources,
        })
    }
}

#[derive(Debug)]
struct DecodeStage {
    attns: Option<Vec<ExtractorAttn>>,
    res_blocks: Option<ResBlocks>,
    decoder: ResBlockDecoder,
}

#[derive(Debug)]
pub struct TargetDecoder {
    stem: Stem,
    stages: Vec<DecodeStage>,
    out_block: OutputBlock,
    attn: AttnLayers,
    num_sources: usize,
}

impl TargetDecoder {
    pub fn forward_t(
        &self,
        target_structure: &Tensor,
        pyramids: &[&FeaturePyramid],
        maps: &FlowMaps,
        train: bool,
    ) -> Result<Tensor> {
        let (image, _diag) = self.forward_impl(target_structure, pyramids, maps, train, false)?;
        Ok(image)
    }

    pub fn forward_diagnostic_t(
        &self,
        target_structure: &Tensor,
        pyramids: &[&FeaturePyramid],
        maps: &FlowMaps,
        train: bool,
    ) -> Result<(Tensor, Diagnostics)> {
        let (image, diag) = self.forward_impl(target_structure, pyramids, maps, train, true)?;
        Ok((image, diag.unwrap()))
    }

    fn forward_impl(
        &self,
        target_structure: &Tensor,
        pyramids: &[&FeaturePyramid],
        maps: &FlowMaps,
        train: bool,
        collect: bool,
    ) -> Result<(Tensor, Option<Diagnostics>)> {
        let Self {
            ref stem,
            ref stages,
            ref out_block,
            ref attn,
            num_sources,
            ..
        } = *self;

        ensure!(
            pyramids.len() == num_sources,
            "expected {} source pyramids, got {}",
            num_sources,
            pyramids.len()
        );
        ensure!(
            maps.flows.len() == attn.len() * num_sources
                && maps.masks.len() == maps.flows.len(),
            "expected {} flow/mask pairs, got {} flows and {} masks",
            attn.len() * num_sources,
            maps.flows.len(),
            maps.masks.len()
        );

        let mut out = match stem {
            Stem::Encoder(encoders) => {
                let mut out = target_structure.shallow_clone();
                for encoder in encoders {
                    out = encoder.forward_t(&out, train);
                }
                out
            }
            Stem::Broadcast {
                tile,
                block0,
                block1,
            } => {
                let tiled = broadcast_structure(target_structure, *tile)?;
                let out = block0.forward_t(&tiled, train);
                block1.forward_t(&out, train)
            }
        };

        // flows arrive deepest-first, same as the depth loop
        let mut counter = 0;
        let mut diag = collect.then(|| Diagnostics {
            targets: vec![],
            sources: vec![],
            weights: vec![],
            masks: vec![],
        });

        for (i, stage) in stages.iter().enumerate() {
            if let Some(attns) = &stage.attns {
                let mut blended = Vec::with_capacity(num_sources);

                for (s, (extractor, pyramid)) in izip!(attns, pyramids).enumerate() {
                    let source = pyramid.get(i)?;
                    ensure!(
                        source.size()[1] == out.size()[1],
                        "pyramid entry {} has {} channels, decoder state has {}",
                        i,
                        source.size()[1],
                        out.size()[1]
                    );

                    let index = counter * num_sources + s;
                    let flow = &maps.flows[index];
                    let mask = &maps.masks[index];

                    let (warped, weights) = extractor.forward_ext(source, &out, flow, train)?;
                    blended.push(&out + (warped - &out) * mask);

                    if let Some(diag) = &mut diag {
                        diag.sources.push(source.shallow_clone());
                        diag.weights.push(weights);
                        diag.masks.push(mask.shallow_clone());
                    }
                }

                out = blended
                    .into_iter()
                    .reduce(|acc, xs| acc + xs)
                    .expect("at least one source");
                counter += 1;

                if let Some(diag) = &mut diag {
                    diag.targets.push(out.shallow_clone());
                }
            }

            if let Some(res_blocks) = &stage.res_blocks {
                out = res_blocks.forward_t(&out, train);
            }
            out = stage.decoder.forward_t(&out, train);
        }

        Ok((out_block.forward_t(&out, train), diag))
    }
}

/// Tiles a low-resolution structure encoding over a `tile × tile` spatial
/// extent before the broadcast stem decodes it.
pub fn broadcast_structure(structure: &Tensor, tile: i64) -> Result<Tensor> {
    structure.size4().with_context(|| {
        format!(
            "expect structure shape [B, C, H, W], but get {:?}",
            structure.size()
        )
    })?;
    Ok(structure.repeat(&[1, 1, tile, tile]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ActivationKind, FlowNetInit, FlowSources, NormKind, SourceEncoderInit,
    };

    fn block_init() -> BlockInit {
        BlockInit {
            norm: NormKind::Instance,
            activation: ActivationKind::LeakyRelu,
            use_spect: false,
            use_coord: false,
        }
    }

    fn attn() -> AttnLayers {
        AttnLayers::new(
            BTreeSet::from([1, 2]),
            BTreeMap::from([(1, 3), (2, 3)]),
        )
        .unwrap()
    }

    #[test]
    fn broadcast_replicates_every_value() -> Result<()> {
        let structure = Tensor::rand(&[2, 5, 1, 1], FLOAT_CPU);
        let tiled = broadcast_structure(&structure, 8)?;

        ensure!(tiled.size() == vec![2, 5, 8, 8], "incorrect tiled shape");
        let expected = structure.expand(&[2, 5, 8, 8], false);
        ensure!(
            tiled.allclose(&expected, 0.0, 0.0, false),
            "tiled values must equal the source value at every position"
        );
        Ok(())
    }

    #[test]
    fn decodes_with_matching_flow_net_and_pyramid() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let source_net = SourceEncoderInit {
            input_channels: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            block: block_init(),
        }
        .build(&root / "source")?;

        let flow_net = FlowNetInit {
            input_channels: 3 + 4 + 4,
            ngf: 4,
            img_f: 32,
            encoder_layer: 4,
            attn: attn(),
            sources: FlowSources::One,
            structure_fusion: None,
            block: block_init(),
        }
        .build(&root / "flow")?;

        let target_net = TargetDecoderInit {
            structure_nc: 4,
            output_nc: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            num_blocks: 2,
            attn: attn(),
            num_sources: 1,
            broadcast_stem: None,
            block: block_init(),
        }
        .build(&root / "target")?;

        let source = Tensor::rand(&[2, 3, 32, 32], FLOAT_CPU);
        let source_structure = Tensor::rand(&[2, 4, 32, 32], FLOAT_CPU);
        let target_structure = Tensor::rand(&[2, 4, 32, 32], FLOAT_CPU);

        let pyramid = source_net.forward_t(&source, true)?;
        let input = Tensor::cat(&[&source, &source_structure, &target_structure], 1);
        let maps = flow_net.forward_t(&input, None, true)?;

        let image = target_net.forward_t(&target_structure, &[&pyramid], &maps, true)?;
        ensure!(image.size() == vec![2, 3, 32, 32], "incorrect image shape");
        Ok(())
    }

    #[test]
    fn diagnostics_record_one_entry_per_attention_layer() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let source_net = SourceEncoderInit {
            input_channels: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            block: block_init(),
        }
        .build(&root / "source")?;

        let flow_net = FlowNetInit {
            input_channels: 11,
            ngf: 4,
            img_f: 32,
            encoder_layer: 4,
            attn: attn(),
            sources: FlowSources::One,
            structure_fusion: None,
            block: block_init(),
        }
        .build(&root / "flow")?;

        let target_net = TargetDecoderInit {
            structure_nc: 4,
            output_nc: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            num_blocks: 2,
            attn: attn(),
            num_sources: 1,
            broadcast_stem: None,
            block: block_init(),
        }
        .build(&root / "target")?;

        let source = Tensor::rand(&[1, 3, 32, 32], FLOAT_CPU);
        let structure = Tensor::rand(&[1, 4, 32, 32], FLOAT_CPU);
        let input = Tensor::cat(&[&source, &structure, &structure], 1);

        let pyramid = source_net.forward_t(&source, true)?;
        let maps = flow_net.forward_t(&input, None, true)?;

        let (image, diag) =
            target_net.forward_diagnostic_t(&structure, &[&pyramid], &maps, true)?;
        ensure!(image.size() == vec![1, 3, 32, 32], "incorrect image shape");
        ensure!(diag.targets.len() == 2, "one target entry per attention layer");
        ensure!(diag.weights.len() == 2, "one weight entry per attention layer");
        ensure!(diag.weights[0].size()[1] == 9, "k² attention weights");
        Ok(())
    }

    #[test]
    fn rejects_flow_count_mismatch() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();

        let target_net = TargetDecoderInit {
            structure_nc: 4,
            output_nc: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            num_blocks: 2,
            attn: attn(),
            num_sources: 1,
            broadcast_stem: None,
            block: block_init(),
        }
        .build(&root / "target")?;

        let source_net = SourceEncoderInit {
            input_channels: 3,
            ngf: 4,
            img_f: 32,
            layers: 4,
            block: block_init(),
        }
        .build(&root / "source")?;

        let source = Tensor::rand(&[1, 3, 32, 32], FLOAT_CPU);
        let structure = Tensor::rand(&[1, 4, 32, 32], FLOAT_CPU);
        let pyramid = source_net.forward_t(&source, true)?;

        let maps = FlowMaps {
            flows: vec![Tensor::rand(&[1, 2, 8, 8], FLOAT_CPU)],
            masks: vec![Tensor::rand(&[1, 1, 8, 8], FLOAT_CPU)],
        };

        assert!(target_net
            .forward_t(&structure, &[&pyramid], &maps, true)
            .is_err());
        Ok(())
    }
}
