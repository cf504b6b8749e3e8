use super::{
    conv::{Conv2D, Conv2DInit},
    misc::{ActivationKind, Norm, NormKind, PaddingKind},
};
use crate::common::*;
use tch::nn::Module;

/// Shared construction knobs for the block library.
#[derive(Debug, Clone, Copy)]
pub struct BlockInit {
    pub norm: NormKind,
    pub activation: ActivationKind,
    pub use_spect: bool,
    pub use_coord: bool,
}

impl BlockInit {
    fn conv(&self, ksize: usize) -> Conv2DInit {
        Conv2DInit {
            spectral: self.use_spect,
            coord: self.use_coord,
            ..Conv2DInit::new(ksize)
        }
    }

    fn down_conv(&self) -> Conv2DInit {
        Conv2DInit {
            ksize: 4,
            stride: 2,
            padding: 1,
            ..self.conv(4)
        }
    }

    fn up_conv(&self) -> Conv2DInit {
        Conv2DInit {
            ksize: 3,
            stride: 2,
            padding: 1,
            output_padding: 1,
            transposed: true,
            ..self.conv(3)
        }
    }
}

/// Downsampling encoder stage: norm → act → stride-2 conv → norm → act → conv.
#[derive(Debug)]
pub struct EncoderBlock {
    norm1: Norm,
    conv1: Conv2D,
    norm2: Norm,
    conv2: Conv2D,
    activation: ActivationKind,
}

impl EncoderBlock {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        Ok(Self {
            norm1: init.norm.build(path / "norm1", in_c),
            conv1: init.down_conv().build(path / "conv1", in_c, out_c)?,
            norm2: init.norm.build(path / "norm2", out_c),
            conv2: init.conv(3).build(path / "conv2", out_c, out_c)?,
            activation: init.activation,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self.activation.apply(&self.norm1.forward_t(xs, train));
        let xs = self.conv1.forward_t(&xs, train);
        let xs = self.activation.apply(&self.norm2.forward_t(&xs, train));
        self.conv2.forward_t(&xs, train)
    }
}

/// Channel-mapping residual unit with an optional learned shortcut.
#[derive(Debug)]
pub struct ResBlock {
    norm1: Norm,
    conv1: Conv2D,
    norm2: Norm,
    conv2: Conv2D,
    shortcut: Option<Conv2D>,
    activation: ActivationKind,
}

impl ResBlock {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let hidden_c = in_c.min(out_c);

        let shortcut = (in_c != out_c)
            .then(|| init.conv(1).build(path / "shortcut", in_c, out_c))
            .transpose()?;

        Ok(Self {
            norm1: init.norm.build(path / "norm1", in_c),
            conv1: init.conv(3).build(path / "conv1", in_c, hidden_c)?,
            norm2: init.norm.build(path / "norm2", hidden_c),
            conv2: init.conv(3).build(path / "conv2", hidden_c, out_c)?,
            shortcut,
            activation: init.activation,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let branch = self.activation.apply(&self.norm1.forward_t(xs, train));
        let branch = self.conv1.forward_t(&branch, train);
        let branch = self.activation.apply(&self.norm2.forward_t(&branch, train));
        let branch = self.conv2.forward_t(&branch, train);

        match &self.shortcut {
            Some(conv) => conv.forward_t(xs, train) + branch,
            None => xs + branch,
        }
    }
}

/// N-unit residual stack; the first unit maps channels, the rest preserve.
#[derive(Debug)]
pub struct ResBlocks {
    blocks: Vec<ResBlock>,
}

impl ResBlocks {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        num_blocks: usize,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        ensure!(num_blocks >= 1, "residual stack needs at least one block");
        let path = path.borrow();

        let blocks = (0..num_blocks)
            .map(|index| {
                let block_in = if index == 0 { in_c } else { out_c };
                ResBlock::new(path / format!("block_{}", index), init, block_in, out_c)
            })
            .try_collect()?;

        Ok(Self { blocks })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.blocks
            .iter()
            .fold(xs.shallow_clone(), |xs, block| block.forward_t(&xs, train))
    }
}

/// Upsampling decoder stage with a transposed-conv bypass.
#[derive(Debug)]
pub struct ResBlockDecoder {
    norm1: Norm,
    conv1: Conv2D,
    norm2: Norm,
    conv2: Conv2D,
    bypass: Conv2D,
    activation: ActivationKind,
}

impl ResBlockDecoder {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        in_c: usize,
        out_c: usize,
        hidden_c: Option<usize>,
    ) -> Result<Self> {
        let path = path.borrow();
        let hidden_c = hidden_c.unwrap_or(out_c);

        Ok(Self {
            norm1: init.norm.build(path / "norm1", in_c),
            conv1: init.conv(3).build(path / "conv1", in_c, hidden_c)?,
            norm2: init.norm.build(path / "norm2", hidden_c),
            conv2: init.up_conv().build(path / "conv2", hidden_c, out_c)?,
            bypass: init.up_conv().build(path / "bypass", in_c, out_c)?,
            activation: init.activation,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let branch = self.activation.apply(&self.norm1.forward_t(xs, train));
        let branch = self.conv1.forward_t(&branch, train);
        let branch = self.activation.apply(&self.norm2.forward_t(&branch, train));
        let branch = self.conv2.forward_t(&branch, train);

        self.bypass.forward_t(xs, train) + branch
    }
}

/// Skip-connection projector for the flow network.
#[derive(Debug)]
pub struct Jump {
    conv: Conv2D,
    activation: ActivationKind,
}

impl Jump {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        Ok(Self {
            conv: init.conv(3).build(path / "conv", in_c, out_c)?,
            activation: init.activation,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.conv.forward_t(&self.activation.apply(xs), train)
    }
}

/// Final projection to the photometric output, bounded by tanh.
#[derive(Debug)]
pub struct OutputBlock {
    pad: super::misc::Pad2D,
    conv: Conv2D,
    activation: ActivationKind,
}

impl OutputBlock {
    pub fn new<'a>(
        path: impl Borrow<nn::Path<'a>>,
        init: BlockInit,
        in_c: usize,
        out_c: usize,
    ) -> Result<Self> {
        let path = path.borrow();
        let conv = Conv2DInit {
            padding: 0,
            ..init.conv(3)
        }
        .build(path / "conv", in_c, out_c)?;

        Ok(Self {
            pad: PaddingKind::Reflect.build([1, 1, 1, 1]),
            conv,
            activation: init.activation,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = self.pad.forward(&self.activation.apply(xs));
        self.conv.forward_t(&xs, train).tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() -> BlockInit {
        BlockInit {
            norm: NormKind::Instance,
            activation: ActivationKind::LeakyRelu,
            use_spect: false,
            use_coord: false,
        }
    }

    #[test]
    fn encoder_block_halves_resolution() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = EncoderBlock::new(vs.root(), init(), 3, 8)?;

        let xs = Tensor::rand(&[2, 3, 16, 16], FLOAT_CPU);
        let ys = block.forward_t(&xs, true);
        ensure!(ys.size() == vec![2, 8, 8, 8], "incorrect output shape");
        Ok(())
    }

    #[test]
    fn res_block_preserves_shape() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResBlock::new(vs.root(), init(), 8, 8)?;

        let xs = Tensor::rand(&[2, 8, 8, 8], FLOAT_CPU);
        let ys = block.forward_t(&xs, true);
        ensure!(ys.size() == xs.size(), "incorrect output shape");
        Ok(())
    }

    #[test]
    fn res_blocks_map_channels() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let blocks = ResBlocks::new(vs.root(), init(), 2, 6, 10)?;

        let xs = Tensor::rand(&[2, 6, 8, 8], FLOAT_CPU);
        let ys = blocks.forward_t(&xs, true);
        ensure!(ys.size() == vec![2, 10, 8, 8], "incorrect output shape");
        Ok(())
    }

    #[test]
    fn decoder_block_doubles_resolution() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResBlockDecoder::new(vs.root(), init(), 8, 4, None)?;

        let xs = Tensor::rand(&[2, 8, 8, 8], FLOAT_CPU);
        let ys = block.forward_t(&xs, true);
        ensure!(ys.size() == vec![2, 4, 16, 16], "incorrect output shape");
        Ok(())
    }

    #[test]
    fn output_block_is_bounded() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = OutputBlock::new(vs.root(), init(), 4, 3)?;

        let xs = Tensor::rand(&[2, 4, 8, 8], FLOAT_CPU) * 100.0;
        let ys = block.forward_t(&xs, true);
        ensure!(ys.size() == vec![2, 3, 8, 8], "incorrect output shape");
        ensure!(
            f64::from(ys.max()) <= 1.0 && f64::from(ys.min()) >= -1.0,
            "output escaped tanh bounds"
        );
        Ok(())
    }
}
