//! # colorgan
//!
//! Automatic colorization with a pix2pix-style conditional GAN built on burn.
//!
//! A U-Net [`Generator`](model::generator::Generator) predicts the a\*b\* chroma of a
//! CIE Lab image from its luminance, while a PatchGAN
//! [`Discriminator`](model::discriminator::Discriminator) judges (luminance, chroma)
//! pairs. [`training`] drives both networks, each with its own optimizer.

pub mod color;
pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

pub use error::{Error, Result};

use crate::model::generator::{Generator, GeneratorConfig};
use burn::{
    backend::NdArray,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::Device,
};
use image::{DynamicImage, RgbImage};
use wasm_bindgen::prelude::*;

type MyBackend = NdArray<f32>;

#[cfg(test)]
pub(crate) type TestBackend = NdArray<f32>;
#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;

const IMAGE_SIZE: u32 = 256;

/// Browser-facing colorizer running the generator on the CPU backend.
#[wasm_bindgen]
pub struct Colorizer {
    generator: Generator<MyBackend>,
    device: Device<MyBackend>,
}

impl Default for Colorizer {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
impl Colorizer {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        let device = Default::default();
        let generator = GeneratorConfig::new().init(&device);

        Self { generator, device }
    }

    /// Build a colorizer from a generator record saved by the training binary.
    #[wasm_bindgen(js_name = withWeights)]
    pub fn with_weights(weights: Vec<u8>) -> std::result::Result<Colorizer, JsValue> {
        let Colorizer { generator, device } = Self::new();
        let record = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
            .load(weights, &device)
            .map_err(|err| JsValue::from_str(&err.to_string()))?;

        Ok(Self {
            generator: generator.load_record(record),
            device,
        })
    }

    /// Colorize interleaved RGB pixels in `[0, 255]`; returns the same layout.
    #[wasm_bindgen]
    pub fn colorize(
        &self,
        image: Vec<f32>,
        width: u32,
        height: u32,
    ) -> std::result::Result<Vec<f32>, JsValue> {
        let bytes = image
            .into_iter()
            .map(|c| c.clamp(0.0, 255.0) as u8)
            .collect::<Vec<_>>();
        let rgb = RgbImage::from_raw(width, height, bytes)
            .ok_or_else(|| JsValue::from_str("pixel buffer does not match width x height x 3"))?;

        let colorized = utils::colorize_image(
            &self.generator,
            &DynamicImage::ImageRgb8(rgb),
            IMAGE_SIZE,
            &self.device,
        )
        .map_err(|err| JsValue::from_str(&err.to_string()))?;

        Ok(colorized.into_raw().into_iter().map(f32::from).collect())
    }
}
