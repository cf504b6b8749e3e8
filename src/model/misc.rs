use crate::common::*;

/// Channel-multiplier schedule shared by every encoder and decoder building
/// pass. Keeping one definition guarantees skip/jump channel counts agree.
pub fn channel_mult(depth: usize, ngf: usize, img_f: usize) -> usize {
    (1 << depth).min(img_f / ngf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormKind {
    Batch,
    Instance,
    None,
}

impl NormKind {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>, channels: usize) -> Norm {
        let path = path.borrow();
        let channels = channels as i64;

        match self {
            Self::Batch => Norm::Batch(nn::batch_norm2d(path, channels, Default::default())),
            Self::Instance => Norm::Instance(InstanceNorm {
                ws: path.var("weight", &[channels], nn::Init::Const(1.0)),
                bs: path.var("bias", &[channels], nn::Init::Const(0.0)),
                eps: 1e-5,
            }),
            Self::None => Norm::None,
        }
    }
}

#[derive(Debug)]
pub enum Norm {
    Batch(nn::BatchNorm),
    Instance(InstanceNorm),
    None,
}

impl Norm {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Self::Batch(norm) => norm.forward_t(xs, train),
            Self::Instance(norm) => norm.forward(xs),
            Self::None => xs.shallow_clone(),
        }
    }
}

#[derive(Debug)]
pub struct InstanceNorm {
    ws: Tensor,
    bs: Tensor,
    eps: f64,
}

impl InstanceNorm {
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        Tensor::instance_norm(
            xs,
            Some(&self.ws),
            Some(&self.bs),
            None::<&Tensor>,
            None::<&Tensor>,
            true,
            0.1,
            self.eps,
            false,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    LeakyRelu,
    Selu,
}

impl ActivationKind {
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Self::Relu => xs.relu(),
            Self::LeakyRelu => xs.leaky_relu(),
            Self::Selu => xs.selu(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaddingKind {
    Reflect,
    Replicate,
    Zero,
}

impl PaddingKind {
    pub fn build(self, lrtb: [usize; 4]) -> Pad2D {
        let [l, r, t, b] = lrtb;
        Pad2D {
            kind: self,
            lrtb: [l as i64, r as i64, t as i64, b as i64],
        }
    }
}

#[derive(Debug)]
pub struct Pad2D {
    kind: PaddingKind,
    lrtb: [i64; 4],
}

impl nn::Module for Pad2D {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self.kind {
            PaddingKind::Reflect => xs.reflection_pad2d(&self.lrtb),
            PaddingKind::Replicate => xs.replication_pad2d(&self.lrtb),
            PaddingKind::Zero => {
                let [l, r, t, b] = self.lrtb;
                xs.zero_pad2d(l, r, t, b)
            }
        }
    }
}
