use burn::{
    module::Module,
    nn::loss::BinaryCrossEntropyLossConfig,
    prelude::*,
};

use crate::model::layers::{DecoderBlock, EncoderBlock, OutputBlock, Stage, StageOptions};

/// U-Net generator: luminance in, two chrominance channels out.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    pub(crate) encoders: Vec<EncoderBlock<B>>,
    decoders: Vec<DecoderBlock<B>>,
    output: OutputBlock<B>,
}

/// Losses produced by [`Generator::loss`].
#[derive(Clone, Debug)]
pub struct GeneratorLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub adversarial: Tensor<B, 1>,
}

impl<B: Backend> Generator<B> {
    /// Predict `[a, b]` from a batch whose first channel is luminance.
    ///
    /// Any channels after the first are ignored, so the normalized `[L, a, b]`
    /// ground truth can be passed as is.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let encoded = self.encode(input.narrow(1, 0, 1));
        self.decode(encoded)
    }

    /// Run the luminance channel through every encoder stage, keeping each output.
    pub fn encode(&self, luminance: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut outputs: Vec<Tensor<B, 4>> = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let input = outputs.last().cloned().unwrap_or_else(|| luminance.clone());
            outputs.push(encoder.apply(input));
        }
        outputs
    }

    fn decode(&self, encoded: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        self.decode_with(encoded, |_, _| {})
    }

    /// Decode, passing each stage's (concatenated) input to `inspect` first.
    ///
    /// The output projection is the last stage, numbered `decoders.len()`.
    fn decode_with<F>(&self, encoded: Vec<Tensor<B, 4>>, mut inspect: F) -> Tensor<B, 4>
    where
        F: FnMut(usize, &Tensor<B, 4>),
    {
        let depth = encoded.len();
        let mut output = encoded[depth - 1].clone();

        for (stage, decoder) in self.decoders.iter().enumerate() {
            let input = match skip_source(depth, stage) {
                Some(skip) => Tensor::cat(vec![output, encoded[skip].clone()], 1),
                None => output,
            };
            inspect(stage, &input);
            output = decoder.apply(input);
        }

        // the output projection pairs with the first encoder stage
        let input = Tensor::cat(vec![output, encoded[0].clone()], 1);
        inspect(self.decoders.len(), &input);
        self.output.apply(input)
    }

    /// Adversarial plus weighted L1 loss.
    ///
    /// `d_fake` are discriminator logits for the generated pair; the generator
    /// is rewarded when they are classified as real.
    pub fn loss(
        &self,
        fake: Tensor<B, 4>,
        d_fake: Tensor<B, 4>,
        real: Tensor<B, 4>,
        l1_weight: f64,
    ) -> GeneratorLoss<B> {
        let bce = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&d_fake.device());
        let targets = d_fake.ones_like().int();
        let adversarial = bce.forward(d_fake, targets);

        let reconstruction = reconstruction_loss(fake, real);
        let total = adversarial.clone() + reconstruction.clone().mul_scalar(l1_weight);

        GeneratorLoss {
            total,
            reconstruction,
            adversarial,
        }
    }
}

/// Mean absolute difference between predicted and true chroma.
pub fn reconstruction_loss<B: Backend>(fake: Tensor<B, 4>, real: Tensor<B, 4>) -> Tensor<B, 1> {
    (fake - real).abs().mean()
}

/// Encoder stage whose output is concatenated into decoder stage `stage`.
///
/// Stages are numbered over the decoders followed by the output projection, so a
/// generator of depth `d` has stages `0..d`. Stage 0 reads the bottleneck directly.
pub fn skip_source(depth: usize, stage: usize) -> Option<usize> {
    match stage {
        0 => None,
        s if s < depth => Some(depth - 1 - s),
        _ => None,
    }
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    #[config(default = 64)]
    pub base_filters: usize,
    /// Number of encoder stages; each halves the resolution.
    #[config(default = 8)]
    pub depth: usize,
    #[config(default = 4)]
    pub kernel_size: usize,
    #[config(default = 0.3)]
    pub negative_slope: f64,
    /// Leading decoder stages that use dropout.
    #[config(default = 3)]
    pub dropout_stages: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    #[config(default = 2)]
    pub out_channels: usize,
    #[config(default = 0.02)]
    pub init_std: f64,
}

impl GeneratorConfig {
    /// Output widths of the encoder stages: doubling from `base_filters`, capped at 8x.
    pub fn encoder_filters(&self) -> Vec<usize> {
        (0..self.depth)
            .map(|i| self.base_filters << i.min(3))
            .collect()
    }

    /// Output widths of the decoder stages, mirroring the encoder.
    pub fn decoder_filters(&self) -> Vec<usize> {
        let encoders = self.encoder_filters();
        encoders[..self.depth - 1].iter().rev().copied().collect()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        assert!(self.depth >= 2, "generator depth must be at least 2");
        let options = StageOptions {
            kernel_size: self.kernel_size,
            init_std: self.init_std,
        };
        let enc = self.encoder_filters();
        let dec = self.decoder_filters();

        let encoders = enc
            .iter()
            .enumerate()
            .map(|(i, &filters)| {
                let in_channels = if i == 0 { 1 } else { enc[i - 1] };
                EncoderBlock::new(
                    [in_channels, filters],
                    i != 0,
                    self.negative_slope,
                    options,
                    device,
                )
            })
            .collect();

        let decoders = dec
            .iter()
            .enumerate()
            .map(|(i, &filters)| {
                let in_channels = match skip_source(self.depth, i) {
                    Some(skip) => dec[i - 1] + enc[skip],
                    None => enc[self.depth - 1],
                };
                let dropout = (i < self.dropout_stages).then_some(self.dropout);
                DecoderBlock::new([in_channels, filters], dropout, options, device)
            })
            .collect();

        let output = OutputBlock::new(
            [dec[self.depth - 2] + enc[0], self.out_channels],
            options,
            device,
        );

        Generator {
            encoders,
            decoders,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::Distribution;

    fn slim() -> GeneratorConfig {
        GeneratorConfig::new().with_base_filters(4)
    }

    #[test]
    fn default_widths() {
        let config = GeneratorConfig::new();

        assert_eq!(
            config.encoder_filters(),
            vec![64, 128, 256, 512, 512, 512, 512, 512]
        );
        assert_eq!(
            config.decoder_filters(),
            vec![512, 512, 512, 512, 256, 128, 64]
        );
    }

    #[test]
    fn deepest_encoder_output_is_one_by_one() {
        let device = Default::default();
        let generator = GeneratorConfig::new().init::<TestBackend>(&device);

        for batch in [1, 2] {
            let input = Tensor::random(
                [batch, 1, 256, 256],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );
            let encoded = generator.encode(input);

            assert_eq!(encoded.len(), 8);
            assert_eq!(encoded[7].dims(), [batch, 512, 1, 1]);
        }
    }

    #[test]
    fn skip_connections_are_symmetric() {
        assert_eq!(skip_source(8, 0), None);
        for stage in 1..8 {
            assert_eq!(skip_source(8, stage), Some(7 - stage));
        }
    }

    #[test]
    fn skip_concatenations_line_up() {
        let device = Default::default();
        let config = slim();
        let generator = config.init::<TestBackend>(&device);
        let input = Tensor::random([1, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let encoded = generator.encode(input);
        let expected_dims: Vec<[usize; 4]> = encoded.iter().map(|t| t.dims()).collect();

        let mut inputs = Vec::new();
        let output = generator.decode_with(encoded, |stage, input| inputs.push((stage, input.dims())));

        // stage s joins encoder 7 - s: decoder width plus encoder width, at the encoder's size
        let enc = config.encoder_filters();
        let dec = config.decoder_filters();
        assert_eq!(inputs.len(), 8);
        assert_eq!(inputs[0], (0, expected_dims[7]));
        for (stage, dims) in inputs.iter().skip(1) {
            let [_, _, h, w] = expected_dims[7 - stage];
            assert_eq!(
                *dims,
                [1, dec[stage - 1] + enc[7 - stage], h, w],
                "stage {stage}"
            );
        }
        assert_eq!(output.dims(), [1, 2, 256, 256]);
    }

    #[test]
    fn dropout_only_in_leading_decoders() {
        let device = Default::default();
        let generator = slim().init::<TestBackend>(&device);

        let flags: Vec<bool> = generator.decoders.iter().map(|d| d.has_dropout()).collect();

        assert_eq!(flags, vec![true, true, true, false, false, false, false]);
    }

    #[test]
    fn output_is_bounded_chroma() {
        let device = Default::default();
        let generator = slim().init::<TestBackend>(&device);

        for _ in 0..3 {
            let input = Tensor::random([2, 3, 256, 256], Distribution::Normal(0.0, 5.0), &device);
            let output = generator.forward(input);

            assert_eq!(output.dims(), [2, 2, 256, 256]);
            let values = output.into_data().to_vec::<f32>().unwrap();
            assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn forward_ignores_chroma_channels() {
        let device = Default::default();
        let generator = slim().init::<TestBackend>(&device);
        let luminance = Tensor::random([1, 1, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let chroma_a = Tensor::random([1, 2, 256, 256], Distribution::Uniform(-1.0, 1.0), &device);
        let chroma_b = Tensor::zeros([1, 2, 256, 256], &device);

        let a = generator.forward(Tensor::cat(vec![luminance.clone(), chroma_a], 1));
        let b = generator.forward(Tensor::cat(vec![luminance, chroma_b], 1));

        assert_eq!(
            a.into_data().to_vec::<f32>().unwrap(),
            b.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn reconstruction_loss_is_zero_only_for_identical_chroma() {
        let device = Default::default();
        let real = Tensor::<TestBackend, 4>::random(
            [2, 2, 8, 8],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let same = reconstruction_loss(real.clone(), real.clone()).into_scalar();
        let perturbed = reconstruction_loss(real.clone().add_scalar(0.1), real).into_scalar();

        assert_eq!(same, 0.0);
        assert!(perturbed > 0.0);
        assert!((perturbed - 0.1).abs() < 1e-4);
    }

    #[test]
    fn total_loss_weights_reconstruction() {
        let device = Default::default();
        let generator = slim().init::<TestBackend>(&device);
        let real = Tensor::<TestBackend, 4>::zeros([1, 2, 4, 4], &device);
        let fake = real.clone().add_scalar(0.5);
        let d_fake = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);

        let loss = generator.loss(fake, d_fake, real, 100.0);
        let total = loss.total.into_scalar();
        let reconstruction = loss.reconstruction.into_scalar();
        let adversarial = loss.adversarial.into_scalar();

        // BCE of a zero logit against a positive label is ln 2
        assert!((adversarial - std::f32::consts::LN_2).abs() < 1e-4);
        assert!((reconstruction - 0.5).abs() < 1e-6);
        assert!((total - (adversarial + 100.0 * reconstruction)).abs() < 1e-3);
    }
}
