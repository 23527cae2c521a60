use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::BinaryCrossEntropyLossConfig,
        BatchNorm, BatchNormConfig, Initializer, LeakyRelu, LeakyReluConfig, PaddingConfig2d,
    },
    prelude::*,
};

/// Convolution, batch norm, leaky ReLU.
#[derive(Module, Debug)]
pub struct DiscBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    lrelu: LeakyRelu,
}

impl<B: Backend> DiscBlock<B> {
    fn new(channels: [usize; 2], stride: usize, config: &DiscriminatorConfig, device: &B::Device) -> Self {
        let conv = config.conv(channels, stride).init(device);
        let bn = BatchNormConfig::new(channels[1])
            .with_momentum(0.01)
            .with_epsilon(1e-3)
            .init(device);
        let lrelu = LeakyReluConfig::new()
            .with_negative_slope(config.negative_slope)
            .init();

        Self { conv, bn, lrelu }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let output = self.conv.forward(input);
        let output = self.bn.forward(output);
        self.lrelu.forward(output)
    }
}

/// Conditional PatchGAN: scores (luminance, chroma) pairs patch by patch.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    pub(crate) in_layer: Conv2d<B>,
    disc_layer_1: DiscBlock<B>,
    disc_layer_2: DiscBlock<B>,
    disc_layer_3: DiscBlock<B>,
    pub(crate) out_layer: Conv2d<B>,
    lrelu: LeakyRelu,
}

impl<B: Backend> Discriminator<B> {
    /// Logit map `[batch, 1, h, w]`; positive logits mean "real".
    pub fn forward(&self, condition: Tensor<B, 4>, chroma: Tensor<B, 4>) -> Tensor<B, 4> {
        let input = Tensor::cat(vec![condition, chroma], 1);

        let output = self.in_layer.forward(input);
        let output = self.lrelu.forward(output);

        let output = self.disc_layer_1.forward(output);
        let output = self.disc_layer_2.forward(output);
        let output = self.disc_layer_3.forward(output);

        self.out_layer.forward(output)
    }

    /// Real pairs are pushed towards label 1, generated pairs towards label 0.
    pub fn loss(&self, d_real: Tensor<B, 4>, d_fake: Tensor<B, 4>) -> Tensor<B, 1> {
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&d_real.device());

        let real_targets = d_real.ones_like().int();
        let real_loss = bce.forward(d_real, real_targets);

        let fake_targets = d_fake.zeros_like().int();
        let fake_loss = bce.forward(d_fake, fake_targets);

        real_loss + fake_loss
    }
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    #[config(default = 64)]
    pub base_filters: usize,
    /// Channels of the conditioning input plus channels of the scored chroma.
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 0.2)]
    pub negative_slope: f64,
    #[config(default = 0.02)]
    pub init_std: f64,
}

impl DiscriminatorConfig {
    fn conv(&self, channels: [usize; 2], stride: usize) -> Conv2dConfig {
        Conv2dConfig::new(channels, [4, 4])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(Initializer::Normal {
                mean: 0.0,
                std: self.init_std,
            })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let base = self.base_filters;

        let in_layer = self.conv([self.in_channels, base], 2).init(device);
        let disc_layer_1 = DiscBlock::new([base, base * 2], 2, self, device);
        let disc_layer_2 = DiscBlock::new([base * 2, base * 4], 2, self, device);
        let disc_layer_3 = DiscBlock::new([base * 4, base * 8], 1, self, device);
        let out_layer = self.conv([base * 8, 1], 1).init(device);
        let lrelu = LeakyReluConfig::new()
            .with_negative_slope(self.negative_slope)
            .init();

        Discriminator {
            in_layer,
            disc_layer_1,
            disc_layer_2,
            disc_layer_3,
            out_layer,
            lrelu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    #[test]
    fn scores_patches() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new()
            .with_base_filters(8)
            .init::<TestBackend>(&device);
        let condition = Tensor::random([2, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let chroma = Tensor::random([2, 2, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);

        let scores = discriminator.forward(condition, chroma);

        assert_eq!(scores.dims(), [2, 1, 30, 30]);
    }

    #[test]
    fn loss_rewards_correct_labels() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new()
            .with_base_filters(4)
            .init::<TestBackend>(&device);
        let confident_real = Tensor::<TestBackend, 4>::full([1, 1, 4, 4], 8.0, &device);
        let confident_fake = Tensor::<TestBackend, 4>::full([1, 1, 4, 4], -8.0, &device);

        let good = discriminator
            .loss(confident_real.clone(), confident_fake.clone())
            .into_scalar();
        let bad = discriminator.loss(confident_fake, confident_real).into_scalar();

        assert!(good < 0.01, "good = {good}");
        assert!(bad > 10.0, "bad = {bad}");
    }
}
