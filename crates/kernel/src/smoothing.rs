//! Wendland C2 smoothing kernel used by the surface density field.
//!
//! The WGSL surface kernels carry a line-for-line copy of these two
//! functions; the CPU backend calls them directly.

use std::f32::consts::PI;

/// Normalization constant for the 3D Wendland C2 kernel with support 2h.
const WENDLAND_C2_NORM_3D: f32 = 21.0 / (16.0 * PI);

/// Wendland C2 smoothing kernel in 3D.
///
/// ```text
/// W(r, h) = (21 / (16 pi h^3)) * (1 - q/2)^4 * (1 + 2q)   for q = r/h <= 2
/// W(r, h) = 0                                                for q > 2
/// ```
pub fn wendland_c2(r: f32, h: f32) -> f32 {
    let q = r / h;
    if q >= 2.0 {
        return 0.0;
    }
    let t = 1.0 - 0.5 * q;
    let t2 = t * t;
    WENDLAND_C2_NORM_3D / (h * h * h) * t2 * t2 * (1.0 + 2.0 * q)
}

/// Gradient of [`wendland_c2`] with respect to the evaluation point, given
/// the displacement `d` from the particle to the point and `r = |d|`.
pub fn wendland_c2_gradient(d: [f32; 3], r: f32, h: f32) -> [f32; 3] {
    let q = r / h;
    if q >= 2.0 || r < 1.0e-12 {
        return [0.0; 3];
    }
    let t = 1.0 - 0.5 * q;
    let dw_dr = WENDLAND_C2_NORM_3D / (h * h * h * h) * (-5.0 * q) * t * t * t;
    let s = dw_dr / r;
    [d[0] * s, d[1] * s, d[2] * s]
}

/// Density field parameters of the surface extraction grid.
///
/// `radius` is the kernel support, so the smoothing length is `radius / 2`.
/// Contributions are scaled by `scale * h^3` so that a particle sitting on
/// the evaluation point contributes `scale * 21 / (16 pi)` regardless of the
/// grid resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityField {
    /// Kernel support radius.
    pub radius: f32,
    /// Per-particle weight.
    pub scale: f32,
}

impl DensityField {
    /// Smoothing length.
    pub fn h(&self) -> f32 {
        0.5 * self.radius
    }

    fn weight(&self) -> f32 {
        let h = self.h();
        self.scale * h * h * h
    }

    /// Density contribution of a particle at distance `r`.
    pub fn density(&self, r: f32) -> f32 {
        self.weight() * wendland_c2(r, self.h())
    }

    /// Density gradient contribution of a particle displaced by `d`.
    pub fn gradient(&self, d: [f32; 3], r: f32) -> [f32; 3] {
        let w = self.weight();
        let g = wendland_c2_gradient(d, r, self.h());
        [g[0] * w, g[1] * w, g[2] * w]
    }
}

/// Turn an accumulated density and gradient into `[nx, ny, nz, offset]`.
///
/// The normal points down the gradient (out of the fluid). The offset moves
/// the vertex along the normal to where the linearized field crosses
/// `isovalue`, clamped to half a cell.
pub fn surface_normal(density: f32, gradient: [f32; 3], isovalue: f32, resolution: f32) -> [f32; 4] {
    let len = (gradient[0] * gradient[0] + gradient[1] * gradient[1] + gradient[2] * gradient[2]).sqrt();
    if len < 1.0e-12 {
        return [0.0; 4];
    }
    let half = 0.5 * resolution;
    let offset = ((density - isovalue) / len).clamp(-half, half);
    [-gradient[0] / len, -gradient[1] / len, -gradient[2] / len, offset]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_zero_outside_support() {
        assert_eq!(wendland_c2(0.2, 0.1), 0.0);
        assert_eq!(wendland_c2_gradient([0.5, 0.0, 0.0], 0.5, 0.1), [0.0; 3]);
        assert_eq!(wendland_c2_gradient([0.0; 3], 0.0, 0.1), [0.0; 3]);
    }

    #[test]
    fn gradient_points_toward_the_particle() {
        // Evaluation point to the +x side of the particle: density falls with x.
        let g = wendland_c2_gradient([0.1, 0.0, 0.0], 0.1, 0.1);
        assert!(g[0] < 0.0);
        assert!(g[1].abs() < 1.0e-10 && g[2].abs() < 1.0e-10);
    }

    #[test]
    fn kernel_normalization_numerical() {
        let h = 0.1_f32;
        let n = 80;
        let half_extent = 2.0 * h;
        let cell = 2.0 * half_extent / n as f32;
        let dv = (cell * cell * cell) as f64;
        let mut integral = 0.0_f64;
        for ix in 0..n {
            let x = -half_extent + (ix as f32 + 0.5) * cell;
            for iy in 0..n {
                let y = -half_extent + (iy as f32 + 0.5) * cell;
                for iz in 0..n {
                    let z = -half_extent + (iz as f32 + 0.5) * cell;
                    integral += wendland_c2((x * x + y * y + z * z).sqrt(), h) as f64 * dv;
                }
            }
        }
        assert!((integral - 1.0).abs() < 0.02, "kernel integral = {integral}");
    }

    #[test]
    fn field_peak_is_resolution_independent() {
        let a = DensityField { radius: 0.2, scale: 1.0 };
        let b = DensityField { radius: 2.0, scale: 1.0 };
        assert!((a.density(0.0) - b.density(0.0)).abs() < 1.0e-5);
    }

    #[test]
    fn normal_is_unit_and_offset_clamped() {
        let n = surface_normal(10.0, [0.0, -2.0, 0.0], 0.5, 0.1);
        assert!((n[1] - 1.0).abs() < 1.0e-6);
        assert_eq!(n[3], 0.05);
        assert_eq!(surface_normal(1.0, [0.0; 3], 0.5, 0.1), [0.0; 4]);
    }
}
