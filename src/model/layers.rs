use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, LeakyRelu,
        LeakyReluConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// A single step of the generator's layer stack.
///
/// Training-only behaviour (batch statistics, dropout) is selected by the backend:
/// autodiff backends train, inner backends (`Module::valid`) infer.
pub trait Stage<B: Backend> {
    fn apply(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Shared settings for every stage of the generator.
#[derive(Clone, Copy, Debug)]
pub struct StageOptions {
    pub kernel_size: usize,
    pub init_std: f64,
}

impl StageOptions {
    fn initializer(&self) -> Initializer {
        Initializer::Normal {
            mean: 0.0,
            std: self.init_std,
        }
    }
}

// Keras BatchNormalization defaults, expressed in burn's momentum convention.
fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_momentum(0.01)
        .with_epsilon(1e-3)
        .init(device)
}

/// Strided convolution, optional batch norm, leaky ReLU. Halves height and width.
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    bn: Option<BatchNorm<B, 2>>,
    lrelu: LeakyRelu,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(
        channels: [usize; 2],
        batch_norm_enabled: bool,
        negative_slope: f64,
        options: StageOptions,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, [options.kernel_size, options.kernel_size])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(options.initializer())
            .init(device);
        let bn = batch_norm_enabled.then(|| batch_norm(channels[1], device));
        let lrelu = LeakyReluConfig::new()
            .with_negative_slope(negative_slope)
            .init();

        Self { conv, bn, lrelu }
    }
}

impl<B: Backend> Stage<B> for EncoderBlock<B> {
    fn apply(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = match &self.bn {
            Some(bn) => bn.forward(output),
            None => output,
        };
        self.lrelu.forward(output)
    }
}

/// Transposed convolution, batch norm, optional dropout, ReLU. Doubles height and width.
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    conv_t: ConvTranspose2d<B>,
    bn: BatchNorm<B, 2>,
    dropout: Option<Dropout>,
    relu: Relu,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(
        channels: [usize; 2],
        dropout: Option<f64>,
        options: StageOptions,
        device: &B::Device,
    ) -> Self {
        let conv_t = ConvTranspose2dConfig::new(channels, [options.kernel_size, options.kernel_size])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_initializer(options.initializer())
            .init(device);
        let bn = batch_norm(channels[1], device);
        let dropout = dropout.map(|prob| DropoutConfig::new(prob).init());
        let relu = Relu::new();

        Self {
            conv_t,
            bn,
            dropout,
            relu,
        }
    }

    pub fn has_dropout(&self) -> bool {
        self.dropout.is_some()
    }
}

impl<B: Backend> Stage<B> for DecoderBlock<B> {
    fn apply(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv_t.forward(input);
        let output = self.bn.forward(output);
        let output = match &self.dropout {
            Some(dropout) => dropout.forward(output),
            None => output,
        };
        self.relu.forward(output)
    }
}

/// Final projection of the generator: transposed convolution bounded by `tanh`.
#[derive(Module, Debug)]
pub struct OutputBlock<B: Backend> {
    conv_t: ConvTranspose2d<B>,
}

impl<B: Backend> OutputBlock<B> {
    pub fn new(channels: [usize; 2], options: StageOptions, device: &B::Device) -> Self {
        let conv_t = ConvTranspose2dConfig::new(channels, [options.kernel_size, options.kernel_size])
            .with_stride([2, 2])
            .with_padding([1, 1])
            .with_initializer(options.initializer())
            .init(device);

        Self { conv_t }
    }
}

impl<B: Backend> Stage<B> for OutputBlock<B> {
    fn apply(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        burn::tensor::activation::tanh(self.conv_t.forward(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::{module::AutodiffModule, tensor::Distribution};

    const OPTIONS: StageOptions = StageOptions {
        kernel_size: 4,
        init_std: 0.02,
    };

    fn values<B: Backend>(tensor: Tensor<B, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn encoder_halves_spatial_dims() {
        let device = Default::default();
        let block = EncoderBlock::<TestBackend>::new([1, 8], false, 0.3, OPTIONS, &device);
        let input = Tensor::random([2, 1, 16, 16], Distribution::Normal(0.0, 1.0), &device);

        assert_eq!(block.apply(input).dims(), [2, 8, 8, 8]);
    }

    #[test]
    fn encoder_keeps_leaky_negative_side() {
        let device = Default::default();
        let block = EncoderBlock::<TestBackend>::new([1, 8], false, 0.3, OPTIONS, &device);
        let input = Tensor::random([1, 1, 16, 16], Distribution::Normal(0.0, 1.0), &device);

        let output = values(block.apply(input));

        assert!(output.iter().any(|v| *v < 0.0));
    }

    #[test]
    fn decoder_doubles_spatial_dims() {
        let device = Default::default();
        let block = DecoderBlock::<TestBackend>::new([8, 4], Some(0.5), OPTIONS, &device);
        let input = Tensor::random([2, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let output = block.apply(input);

        assert_eq!(output.dims(), [2, 4, 8, 8]);
        assert!(values(output).iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn dropout_is_inert_in_inference() {
        let device = Default::default();
        let block = DecoderBlock::<TestBackend>::new([8, 16], Some(0.5), OPTIONS, &device);
        let input = Tensor::random([2, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let first = values(block.apply(input.clone()));
        let second = values(block.apply(input));

        assert!(block.has_dropout());
        assert_eq!(first, second);
    }

    #[test]
    fn dropout_is_active_in_training() {
        let device = Default::default();
        let block = DecoderBlock::<TestAutodiffBackend>::new([8, 64], Some(0.5), OPTIONS, &device);
        let input = Tensor::random([2, 8, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        let first = values(block.apply(input.clone()));
        let second = values(block.apply(input));

        assert_ne!(first, second);
    }

    #[test]
    fn running_statistics_only_move_in_training() {
        let device = Default::default();
        let block = EncoderBlock::<TestAutodiffBackend>::new([1, 4], true, 0.3, OPTIONS, &device);
        let sample = Tensor::<TestBackend, 4>::random(
            [1, 1, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let before = values(block.valid().apply(sample.clone()));
        let again = values(block.valid().apply(sample.clone()));
        assert_eq!(before, again);

        let batch = Tensor::random([4, 1, 8, 8], Distribution::Normal(3.0, 2.0), &device);
        let _ = block.apply(batch);
        let after = values(block.valid().apply(sample));

        assert_ne!(before, after);
    }

    #[test]
    fn output_block_is_bounded() {
        let device = Default::default();
        let block = OutputBlock::<TestBackend>::new([8, 2], OPTIONS, &device);
        let input = Tensor::random([1, 8, 4, 4], Distribution::Normal(0.0, 50.0), &device);

        let output = block.apply(input);

        assert_eq!(output.dims(), [1, 2, 8, 8]);
        assert!(values(output).iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
