use burn::{prelude::*, tensor::TensorData};
use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use std::path::{Path, PathBuf};

use crate::{
    color::{denorm_imgs, norm_imgs},
    data::ImageItem,
    error::{Error, Result},
    model::generator::Generator,
};

/// Receives generator samples taken during training.
pub trait DiagnosticExporter {
    /// `images` is the normalized `[L, a, b]` batch and `generated` the predicted `[a, b]`.
    fn export<B: Backend>(
        &self,
        epoch: usize,
        batch: usize,
        images: Tensor<B, 4>,
        generated: Tensor<B, 4>,
    ) -> Result<()>;
}

/// Writes one comparison strip per sample as `epoch{E}-batch{I}.png`.
#[derive(Debug, Clone)]
pub struct ExampleWriter {
    out_dir: PathBuf,
}

impl ExampleWriter {
    pub fn new<P: AsRef<Path>>(out_dir: P) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, epoch: usize, batch: usize) -> PathBuf {
        self.out_dir.join(format!("epoch{epoch}-batch{batch}.png"))
    }
}

impl DiagnosticExporter for ExampleWriter {
    fn export<B: Backend>(
        &self,
        epoch: usize,
        batch: usize,
        images: Tensor<B, 4>,
        generated: Tensor<B, 4>,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir)?;
        let strip = tensor_to_image(compose_example(images, generated))?;

        let path = self.path_for(epoch, batch);
        strip.save(&path).map_err(|source| Error::ImageSave {
            path: path.clone(),
            source,
        })?;
        tracing::debug!("wrote sample {}", path.display());

        Ok(())
    }
}

/// Side-by-side panels for the first batch item, as display-range RGB `[3, H, 5 * W]`:
/// luminance only, ground truth, luminance with generated chroma, generated chroma
/// only, ground-truth chroma only.
pub fn compose_example<B: Backend>(images: Tensor<B, 4>, generated: Tensor<B, 4>) -> Tensor<B, 3> {
    let item = images.narrow(0, 0, 1);
    let generated = generated.narrow(0, 0, 1);

    let luminance = item.clone().narrow(1, 0, 1);
    let chroma = item.clone().narrow(1, 1, 2);
    let no_luminance = luminance.zeros_like();
    let no_chroma = chroma.zeros_like();

    let panels = vec![
        Tensor::cat(vec![luminance.clone(), no_chroma], 1),
        item,
        Tensor::cat(vec![luminance, generated.clone()], 1),
        Tensor::cat(vec![no_luminance.clone(), generated], 1),
        Tensor::cat(vec![no_luminance, chroma], 1),
    ];

    denorm_imgs(Tensor::cat(panels, 3)).squeeze(0)
}

/// Convert a `[3, H, W]` tensor in `[0, 1]` to an 8-bit image.
pub fn tensor_to_image<B: Backend>(image: Tensor<B, 3>) -> Result<RgbImage> {
    let [_, height, width] = image.dims();
    let values = image
        .into_data()
        .to_vec::<f32>()
        .map_err(|err| Error::TensorData(format!("{err:?}")))?;
    let plane = height * width;

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let offset = y as usize * width + x as usize;
        Rgb([0, 1, 2].map(|c| to_u8(values[c * plane + offset])))
    }))
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Colorize one image with a trained generator.
///
/// The luminance of `image` is kept; chroma comes from the generator. The image is
/// processed at `size` x `size` and scaled back to its original dimensions.
pub fn colorize_image<B: Backend>(
    generator: &Generator<B>,
    image: &DynamicImage,
    size: u32,
    device: &B::Device,
) -> Result<RgbImage> {
    let (width, height) = (image.width(), image.height());
    let resized = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let item = ImageItem::from_rgb(&resized);

    let rgb = Tensor::<B, 3>::from_data(TensorData::new(item.pixels, [3, item.size, item.size]), device)
        .unsqueeze::<4>();
    let lab = norm_imgs(rgb);
    let chroma = generator.forward(lab.clone());
    let colorized = Tensor::cat(vec![lab.narrow(1, 0, 1), chroma], 1);

    let output = tensor_to_image(denorm_imgs(colorized).squeeze(0))?;
    Ok(DynamicImage::ImageRgb8(output)
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8())
}
