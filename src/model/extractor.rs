use super::{
    conv::{Conv2D, Conv2DInit},
    misc::ActivationKind,
};
use crate::common::*;

/// Flow-guided local attention.
///
/// Instead of a single bilinear sample per pixel, a k×k neighborhood of the
/// source feature map is gathered around the flow-displaced location and
/// combined by learned similarity to the target feature, which tolerates
/// imprecision in the predicted flow.
#[derive(Debug, Clone)]
pub struct ExtractorAttnInit {
    pub channels: usize,
    pub kernel_size: usize,
    pub activation: ActivationKind,
    pub softmax: bool,
}

impl ExtractorAttnInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<ExtractorAttn> {
        let path = path.borrow();
        let Self {
            channels,
            kernel_size,
            activation,
            softmax,
        } = self;

        ensure!(channels > 0, "channels must be positive");
        ensure!(
            kernel_size % 2 == 1,
            "extractor kernel size must be odd, got {}",
            kernel_size
        );

        let query_conv = Conv2DInit::new(1).build(path / "query_conv", channels, channels)?;
        let key_conv = Conv2DInit::new(1).build(path / "key_conv", channels, channels)?;

        Ok(ExtractorAttn {
            query_conv,
            key_conv,
            channels: channels as i64,
            kernel_size: kernel_size as i64,
            activation,
            softmax,
        })
    }
}

#[derive(Debug)]
pub struct ExtractorAttn {
    query_conv: Conv2D,
    key_conv: Conv2D,
    channels: i64,
    kernel_size: i64,
    activation: ActivationKind,
    softmax: bool,
}

impl ExtractorAttn {
    pub fn forward_t(
        &self,
        source: &Tensor,
        target: &Tensor,
        flow: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (warped, _weights) = self.forward_ext(source, target, flow, train)?;
        Ok(warped)
    }

    /// Returns the warped feature and the raw per-pixel attention weights
    /// `[b, k², h, w]` for inspection.
    pub fn forward_ext(
        &self,
        source: &Tensor,
        target: &Tensor,
        flow: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let Self {
            ref query_conv,
            ref key_conv,
            channels,
            kernel_size,
            activation,
            softmax,
        } = *self;

        let (sb, sc, sh, sw) = source
            .size4()
            .with_context(|| format!("expect source shape [B, C, H, W], but get {:?}", source.size()))?;
        let (tb, tc, th, tw) = target
            .size4()
            .with_context(|| format!("expect target shape [B, C, H, W], but get {:?}", target.size()))?;
        let (fb, fc, fh, fw) = flow
            .size4()
            .with_context(|| format!("expect flow shape [B, 2, H, W], but get {:?}", flow.size()))?;

        ensure!(
            sc == channels && tc == channels,
            "channel mismatch: source {} / target {} vs configured {}",
            sc,
            tc,
            channels
        );
        ensure!(fc == 2, "flow must have 2 channels, got {}", fc);
        ensure!(
            sb == tb && sb == fb,
            "batch mismatch: source {} / target {} / flow {}",
            sb,
            tb,
            fb
        );
        ensure!(
            (fh, fw) == (th, tw),
            "flow resolution {:?} must match target resolution {:?}",
            (fh, fw),
            (th, tw)
        );
        ensure!(
            sh > 1 && sw > 1,
            "source resolution {}x{} is too small to normalize sampling coordinates",
            sh,
            sw
        );
        ensure!(
            kernel_size <= sh.min(sw),
            "kernel size {} exceeds source resolution {}x{}",
            kernel_size,
            sh,
            sw
        );

        let neighbors = sample_neighborhood(source, flow, kernel_size);

        let query = query_conv.forward_t(&activation.apply(target), train);
        let keys = {
            let k2 = kernel_size * kernel_size;
            let flat = neighbors.reshape(&[tb * k2, channels, th, tw]);
            let flat = key_conv.forward_t(&activation.apply(&flat), train);
            flat.reshape(&[tb, k2, channels, th, tw])
        };

        let logits =
            Tensor::einsum("bkchw,bchw->bkhw", &[&keys, &query]) / (channels as f64).sqrt();
        let weights = if softmax {
            logits.softmax(1, Kind::Float)
        } else {
            logits.sigmoid()
        };

        let warped = Tensor::einsum("bkhw,bkchw->bchw", &[&weights, &neighbors]);

        Ok((warped, weights))
    }
}

/// Gathers the k×k source neighborhood around `base + flow` for every target
/// pixel. Output shape `[b, k², c, h, w]`, neighbors in row-major offset
/// order.
fn sample_neighborhood(source: &Tensor, flow: &Tensor, kernel_size: i64) -> Tensor {
    let (_b, _c, sh, sw) = source.size4().unwrap();
    let (b, _two, h, w) = flow.size4().unwrap();
    let device = source.device();
    let radius = kernel_size / 2;

    let ys = Tensor::arange(h, (Kind::Float, device));
    let xs = Tensor::arange(w, (Kind::Float, device));
    let grids = Tensor::meshgrid(&[&ys, &xs]);

    let coord_x = grids[1].unsqueeze(0).expand(&[b, h, w], false) + flow.select(1, 0);
    let coord_y = grids[0].unsqueeze(0).expand(&[b, h, w], false) + flow.select(1, 1);

    let samples: Vec<_> = (-radius..=radius)
        .flat_map(|dy| (-radius..=radius).map(move |dx| (dy, dx)))
        .map(|(dy, dx)| {
            let gx = (&coord_x + dx as f64) * (2.0 / (sw - 1) as f64) - 1.0;
            let gy = (&coord_y + dy as f64) * (2.0 / (sh - 1) as f64) - 1.0;
            let grid = Tensor::stack(&[gx, gy], 3);
            // bilinear sampling with zero padding
            source.grid_sampler(&grid, 0, 0, true)
        })
        .collect();

    Tensor::stack(&samples, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_even_kernel_at_construction() {
        let vs = nn::VarStore::new(Device::Cpu);
        let result = ExtractorAttnInit {
            channels: 4,
            kernel_size: 4,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root());
        assert!(result.is_err());
    }

    #[test]
    fn warped_output_shape() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = ExtractorAttnInit {
            channels: 4,
            kernel_size: 3,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root())?;

        let source = Tensor::rand(&[2, 4, 8, 8], FLOAT_CPU);
        let target = Tensor::rand(&[2, 4, 8, 8], FLOAT_CPU);
        let flow = Tensor::randn(&[2, 2, 8, 8], FLOAT_CPU);

        let warped = attn.forward_t(&source, &target, &flow, true)?;
        ensure!(warped.size() == vec![2, 4, 8, 8], "incorrect output shape");
        Ok(())
    }

    #[test]
    fn softmax_weights_sum_to_one() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = ExtractorAttnInit {
            channels: 4,
            kernel_size: 5,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root())?;

        let source = Tensor::rand(&[1, 4, 10, 10], FLOAT_CPU);
        let target = Tensor::rand(&[1, 4, 10, 10], FLOAT_CPU);
        let flow = Tensor::randn(&[1, 2, 10, 10], FLOAT_CPU);

        let (_warped, weights) = attn.forward_ext(&source, &target, &flow, true)?;
        ensure!(weights.size() == vec![1, 25, 10, 10], "incorrect weight shape");

        let sums = weights.sum_dim_intlist(&[1], false, Kind::Float);
        let ones = Tensor::ones(&[1, 10, 10], FLOAT_CPU);
        ensure!(
            sums.allclose(&ones, 1e-5, 1e-6, false),
            "weights do not sum to one over the neighborhood"
        );
        Ok(())
    }

    #[test]
    fn rejects_channel_mismatch_before_compute() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = ExtractorAttnInit {
            channels: 4,
            kernel_size: 3,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root())?;

        let source = Tensor::rand(&[1, 6, 8, 8], FLOAT_CPU);
        let target = Tensor::rand(&[1, 4, 8, 8], FLOAT_CPU);
        let flow = Tensor::randn(&[1, 2, 8, 8], FLOAT_CPU);

        assert!(attn.forward_t(&source, &target, &flow, true).is_err());
        Ok(())
    }

    #[test]
    fn rejects_one_pixel_source_axis() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = ExtractorAttnInit {
            channels: 4,
            kernel_size: 1,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root())?;

        // sw == 1 would divide by zero when normalizing grid coordinates
        let source = Tensor::rand(&[1, 4, 4, 1], FLOAT_CPU);
        let target = Tensor::rand(&[1, 4, 4, 1], FLOAT_CPU);
        let flow = Tensor::randn(&[1, 2, 4, 1], FLOAT_CPU);

        assert!(attn.forward_t(&source, &target, &flow, true).is_err());
        Ok(())
    }

    #[test]
    fn rejects_oversized_kernel_at_call_time() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = ExtractorAttnInit {
            channels: 4,
            kernel_size: 9,
            activation: ActivationKind::LeakyRelu,
            softmax: true,
        }
        .build(vs.root())?;

        let source = Tensor::rand(&[1, 4, 6, 6], FLOAT_CPU);
        let target = Tensor::rand(&[1, 4, 6, 6], FLOAT_CPU);
        let flow = Tensor::randn(&[1, 2, 6, 6], FLOAT_CPU);

        assert!(attn.forward_t(&source, &target, &flow, true).is_err());
        Ok(())
    }
}
