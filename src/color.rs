//! Conversion between display-range RGB batches and the normalized Lab
//! representation the networks train on.
//!
//! Both directions operate on `[batch, 3, height, width]` tensors. Display range is
//! sRGB in `[0, 1]`; training range is `[L / 50 - 1, a / 128, b / 128]`, so every
//! channel lies in `[-1, 1]`.

use burn::prelude::*;

// D65 reference white
const XN: f32 = 0.950_456;
const ZN: f32 = 1.088_754;

const RGB_TO_XYZ: [[f32; 3]; 3] = [
    [0.412_453, 0.357_580, 0.180_423],
    [0.212_671, 0.715_160, 0.072_169],
    [0.019_334, 0.119_193, 0.950_227],
];

const XYZ_TO_RGB: [[f32; 3]; 3] = [
    [3.240_479, -1.537_150, -0.498_535],
    [-0.969_256, 1.875_992, 0.041_556],
    [0.055_648, -0.204_043, 1.057_311],
];

const LAB_EPSILON: f32 = 0.008_856;
const LAB_KAPPA: f32 = 7.787;
const LAB_OFFSET: f32 = 16.0 / 116.0;

const L_SCALE: f32 = 50.0;
const AB_SCALE: f32 = 128.0;

/// Map an RGB batch in `[0, 1]` to normalized Lab in `[-1, 1]`.
pub fn norm_imgs<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let [r, g, b] = split_channels(images.clamp(0.0, 1.0));
    let [r, g, b] = [srgb_to_linear(r), srgb_to_linear(g), srgb_to_linear(b)];
    let [x, y, z] = mix(&RGB_TO_XYZ, [r, g, b]);

    let fx = lab_f(x.div_scalar(XN));
    let fy = lab_f(y);
    let fz = lab_f(z.div_scalar(ZN));

    let l = fy.clone().mul_scalar(116.0).sub_scalar(16.0);
    let a = (fx - fy.clone()).mul_scalar(500.0);
    let b = (fy - fz).mul_scalar(200.0);

    Tensor::cat(
        vec![
            l.div_scalar(L_SCALE).sub_scalar(1.0),
            a.div_scalar(AB_SCALE),
            b.div_scalar(AB_SCALE),
        ],
        1,
    )
}

/// Inverse of [`norm_imgs`]: normalized Lab back to RGB in `[0, 1]`.
pub fn denorm_imgs<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let [l, a, b] = split_channels(images);
    let l = l.add_scalar(1.0).mul_scalar(L_SCALE);
    let a = a.mul_scalar(AB_SCALE);
    let b = b.mul_scalar(AB_SCALE);

    let fy = l.add_scalar(16.0).div_scalar(116.0);
    let fx = a.div_scalar(500.0) + fy.clone();
    let fz = fy.clone() - b.div_scalar(200.0);

    let x = lab_f_inv(fx).mul_scalar(XN);
    let y = lab_f_inv(fy);
    let z = lab_f_inv(fz).mul_scalar(ZN);

    let [r, g, b] = mix(&XYZ_TO_RGB, [x, y, z]);
    let rgb = Tensor::cat(vec![linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b)], 1);

    rgb.clamp(0.0, 1.0)
}

fn split_channels<B: Backend>(images: Tensor<B, 4>) -> [Tensor<B, 4>; 3] {
    let [_, channels, _, _] = images.dims();
    assert_eq!(channels, 3, "expected a 3-channel batch, got {channels} channels");

    [
        images.clone().narrow(1, 0, 1),
        images.clone().narrow(1, 1, 1),
        images.narrow(1, 2, 1),
    ]
}

fn mix<B: Backend>(matrix: &[[f32; 3]; 3], channels: [Tensor<B, 4>; 3]) -> [Tensor<B, 4>; 3] {
    matrix.map(|row| {
        channels[0].clone().mul_scalar(row[0])
            + channels[1].clone().mul_scalar(row[1])
            + channels[2].clone().mul_scalar(row[2])
    })
}

fn srgb_to_linear<B: Backend>(c: Tensor<B, 4>) -> Tensor<B, 4> {
    let low = c.clone().lower_equal_elem(0.040_45);
    let linear = c.clone().div_scalar(12.92);
    let curved = c.add_scalar(0.055).div_scalar(1.055).powf_scalar(2.4);

    curved.mask_where(low, linear)
}

fn linear_to_srgb<B: Backend>(c: Tensor<B, 4>) -> Tensor<B, 4> {
    let c = c.clamp_min(0.0);
    let low = c.clone().lower_equal_elem(0.003_130_8);
    let linear = c.clone().mul_scalar(12.92);
    let curved = c
        .powf_scalar(1.0 / 2.4)
        .mul_scalar(1.055)
        .sub_scalar(0.055);

    curved.mask_where(low, linear)
}

fn lab_f<B: Backend>(t: Tensor<B, 4>) -> Tensor<B, 4> {
    let t = t.clamp_min(0.0);
    let low = t.clone().lower_equal_elem(LAB_EPSILON);
    let linear = t.clone().mul_scalar(LAB_KAPPA).add_scalar(LAB_OFFSET);

    t.powf_scalar(1.0 / 3.0).mask_where(low, linear)
}

fn lab_f_inv<B: Backend>(f: Tensor<B, 4>) -> Tensor<B, 4> {
    // cube root of LAB_EPSILON
    let low = f.clone().lower_equal_elem(0.206_893);
    let linear = f.clone().sub_scalar(LAB_OFFSET).div_scalar(LAB_KAPPA);
    let cubed = f.clone() * f.clone() * f;

    cubed.mask_where(low, linear)
}
