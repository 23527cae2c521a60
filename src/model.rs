pub mod discriminator;
pub mod generator;
pub mod layers;

use burn::{module::Module, prelude::*};

use crate::model::{
    discriminator::{Discriminator, DiscriminatorConfig},
    generator::{Generator, GeneratorConfig},
};

#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = "GeneratorConfig::new()")]
    pub generator_config: GeneratorConfig,
    #[config(default = "DiscriminatorConfig::new()")]
    pub discriminator_config: DiscriminatorConfig,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let generator = self.generator_config.init(device);
        let discriminator = self.discriminator_config.init(device);

        Model {
            generator,
            discriminator,
        }
    }

    /// Smallest image side that survives every encoder halving.
    pub fn min_image_size(&self) -> usize {
        1 << self.generator_config.depth
    }
}
