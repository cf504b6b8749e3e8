use super::{
    block::{BlockInit, EncoderBlock},
    misc::channel_mult,
};
use crate::common::*;

/// Feature maps ordered deepest-first, aligned with decoder traversal:
/// entry `i` is consumed at decoder step `i`.
#[derive(Debug)]
pub struct FeaturePyramid(Vec<Tensor>);

impl FeaturePyramid {
    pub fn get(&self, index: usize) -> Result<&Tensor> {
        self.0
            .get(index)
            .ok_or_else(|| format_err!("pyramid has {} entries, requested {}", self.0.len(), index))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SourceEncoderInit {
    pub input_channels: usize,
    pub ngf: usize,
    pub img_f: usize,
    pub layers: usize,
    pub block: BlockInit,
}

impl SourceEncoderInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<SourceEncoder> {
        let path = path.borrow();
        let Self {
            input_channels,
            ngf,
            img_f,
            layers,
            block,
        } = self;

        ensure!(layers >= 1, "source encoder needs at least one layer");
        ensure!(img_f >= ngf, "img_f must be at least ngf");

        let blocks: Vec<_> = (0..layers)
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

        Ok(SourceEncoder { blocks })
    }
}

#[derive(Debug)]
pub struct SourceEncoder {
    blocks: Vec<EncoderBlock>,
}

impl SourceEncoder {
    pub fn forward_t(&self, source: &Tensor, train: bool) -> Result<FeaturePyramid> {
        source
            .size4()
            .with_context(|| format!("expect source shape [B, C, H, W], but get {:?}", source.size()))?;

        let mut features = vec![source.shallow_clone()];
        let mut out = source.shallow_clone();
        for block in &self.blocks {
            out = block.forward_t(&out, train);
            features.push(out.shallow_clone());
        }

        features.reverse();
        Ok(FeaturePyramid(features))
    }
}
