use crate::common::*;

/// 2-D convolution with optional spectral weight normalization, coordinate
/// channel augmentation, and transposed (upsampling) mode.
#[derive(Debug, Clone)]
pub struct Conv2DInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub output_padding: usize,
    pub transposed: bool,
    pub bias: bool,
    pub spectral: bool,
    pub coord: bool,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl Conv2DInit {
    pub fn new(ksize: usize) -> Self {
        Self {
            ksize,
            stride: 1,
            padding: ksize / 2,
            output_padding: 0,
            transposed: false,
            bias: true,
            spectral: false,
            coord: false,
            ws_init: nn::Init::KaimingUniform,
            bs_init: nn::Init::Const(0.0),
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_c: usize,
        out_c: usize,
    ) -> Result<Conv2D> {
        let path = path.borrow();
        let Self {
            ksize,
            stride,
            padding,
            output_padding,
            transposed,
            bias,
            spectral,
            coord,
            ws_init,
            bs_init,
        } = self;

        ensure!(ksize > 0, "kernel size must be positive");
        ensure!(stride > 0, "stride must be positive");
        ensure!(in_c > 0 && out_c > 0, "channel counts must be positive");
        ensure!(
            output_padding < stride,
            "output padding {} must be smaller than stride {}",
            output_padding,
            stride
        );

        let in_c = (in_c + if coord { 2 } else { 0 }) as i64;
        let out_c = out_c as i64;
        let ksize = ksize as i64;

        let weight_size = if transposed {
            vec![in_c, out_c, ksize, ksize]
        } else {
            vec![out_c, in_c, ksize, ksize]
        };
        let weight = path.var("weight", &weight_size, ws_init);
        let bias = bias.then(|| path.var("bias", &[out_c], bs_init));

        let power_iter = spectral.then(|| {
            let u = path.randn("u", &[weight_size[0]], 0.0, 1.0);
            let _ = u.set_requires_grad(false);
            u
        });

        Ok(Conv2D {
            weight,
            bias,
            power_iter,
            stride: stride as i64,
            padding: padding as i64,
            output_padding: output_padding as i64,
            transposed,
            coord,
        })
    }
}

#[derive(Debug)]
pub struct Conv2D {
    weight: Tensor,
    bias: Option<Tensor>,
    power_iter: Option<Tensor>,
    stride: i64,
    padding: i64,
    output_padding: i64,
    transposed: bool,
    coord: bool,
}

impl Conv2D {
    /// Weight divided by its dominant singular value when spectral
    /// normalization is enabled. The power-iteration buffer advances only in
    /// training mode so evaluation forwards stay deterministic.
    fn effective_weight(&self, train: bool) -> Tensor {
        let Self {
            ref weight,
            ref power_iter,
            ..
        } = *self;

        match power_iter {
            Some(u) => {
                let rows = weight.size()[0];
                let w_mat = weight.view([rows, -1]);

                if train {
                    tch::no_grad(|| {
                        let v = w_mat.transpose(0, 1).mv(u);
                        let v = &v / &(v.norm() + 1e-12);
                        let u_new = w_mat.mv(&v);
                        let u_new = &u_new / &(u_new.norm() + 1e-12);
                        // shares storage with the registered buffer
                        let mut u_buf = u.shallow_clone();
                        u_buf.copy_(&u_new);
                    });
                }

                let v = tch::no_grad(|| {
                    let v = w_mat.transpose(0, 1).mv(u);
                    &v / &(v.norm() + 1e-12)
                });
                let sigma = u.dot(&w_mat.mv(&v));
                weight / sigma
            }
            None => weight.shallow_clone(),
        }
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let Self {
            ref bias,
            stride,
            padding,
            output_padding,
            transposed,
            coord,
            ..
        } = *self;

        let input = if coord {
            let (b, _c, h, w) = input.size4().unwrap();
            Tensor::cat(&[input, &coord_grid(b, h, w, input.device())], 1)
        } else {
            input.shallow_clone()
        };

        input.convolution(
            &self.effective_weight(train),
            bias.as_ref(),
            &[stride, stride],
            &[padding, padding],
            &[1, 1],
            transposed,
            &[output_padding, output_padding],
            1,
        )
    }
}

/// Two normalized coordinate channels in [-1, 1], x first then y.
fn coord_grid(batch: i64, height: i64, width: i64, device: Device) -> Tensor {
    let ys = Tensor::linspace(-1.0, 1.0, height, (Kind::Float, device));
    let xs = Tensor::linspace(-1.0, 1.0, width, (Kind::Float, device));
    let grids = Tensor::meshgrid(&[&ys, &xs]);
    Tensor::stack(&[&grids[1], &grids[0]], 0)
        .unsqueeze(0)
        .expand(&[batch, 2, height, width], false)
}
