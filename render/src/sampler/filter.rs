//! Reconstruction filter kernels.

use crate::math::PI;
use crate::options::Filter;

/// Weight of a sample at offset `(dx, dy)` from the pixel center for a
/// filter of the given width.
pub fn filter_weight(filter: Filter, dx: f32, dy: f32, size: f32) -> f32 {
    let radius = (size * 0.5).max(1.0e-4);
    if dx.abs() > radius || dy.abs() > radius {
        return 0.0;
    }
    match filter {
        Filter::Box => 1.0,
        Filter::Triangle => triangle(dx, radius) * triangle(dy, radius),
        Filter::CatmullRom => catmull_rom(dx / radius * 2.0) * catmull_rom(dy / radius * 2.0),
        Filter::Gaussian => gaussian(dx, radius) * gaussian(dy, radius),
        Filter::Sinc => sinc(dx / radius * 2.0) * sinc(dy / radius * 2.0),
    }
}

fn triangle(x: f32, radius: f32) -> f32 {
    (1.0 - x.abs() / radius).max(0.0)
}

fn catmull_rom(x: f32) -> f32 {
    let x = x.abs();
    if x < 1.0 {
        1.5 * x * x * x - 2.5 * x * x + 1.0
    } else if x < 2.0 {
        -0.5 * x * x * x + 2.5 * x * x - 4.0 * x + 2.0
    } else {
        0.0
    }
}

fn gaussian(x: f32, radius: f32) -> f32 {
    let alpha = 2.0;
    let e = (-alpha * x * x).exp();
    let edge = (-alpha * radius * radius).exp();
    (e - edge).max(0.0)
}

fn sinc(x: f32) -> f32 {
    let x = x.abs() * PI;
    if x < 1.0e-5 {
        1.0
    } else {
        x.sin() / x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_filter_is_flat_inside() {
        assert_eq!(filter_weight(Filter::Box, 0.2, -0.3, 1.0), 1.0);
        assert_eq!(filter_weight(Filter::Box, 0.6, 0.0, 1.0), 0.0);
    }

    #[test]
    fn kernels_peak_at_center() {
        for f in [
            Filter::Triangle,
            Filter::CatmullRom,
            Filter::Gaussian,
            Filter::Sinc,
        ]
        .iter()
        {
            let center = filter_weight(*f, 0.0, 0.0, 2.0);
            let off = filter_weight(*f, 0.7, 0.3, 2.0);
            assert!(center >= off, "{:?} does not peak at center", f);
        }
    }
}
