//! Conic and ellipse math: geometric parameters, least-squares fitting,
//! and the minimal 5-point solve used by the RANSAC detectors.

use nalgebra::{DMatrix, Matrix3, Matrix6, Vector3, Vector6};

/// Geometric ellipse: center, semi-axes, rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    /// Center x in pixels.
    pub cx: f64,
    /// Center y in pixels.
    pub cy: f64,
    /// Semi-major axis length.
    pub a: f64,
    /// Semi-minor axis length.
    pub b: f64,
    /// Rotation of the major axis from +x, radians, normalized to (−π/2, π/2].
    pub angle: f64,
}

/// General conic A x² + B xy + C y² + D x + E y + F = 0, stored as
/// `[A, B, C, D, E, F]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConicCoeffs(pub [f64; 6]);

impl Ellipse {
    /// Positive, finite geometry.
    pub fn is_valid(&self) -> bool {
        self.a > 0.0
            && self.b > 0.0
            && self.a.is_finite()
            && self.b.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.angle.is_finite()
    }

    /// Aspect ratio ≥ 1.
    pub fn aspect_ratio(&self) -> f64 {
        if self.a >= self.b {
            self.a / self.b
        } else {
            self.b / self.a
        }
    }

    /// Convert to conic coefficients.
    pub fn to_conic(self) -> ConicCoeffs {
        let (sin_t, cos_t) = self.angle.sin_cos();
        let a2 = self.a * self.a;
        let b2 = self.b * self.b;

        let ca = cos_t * cos_t / a2 + sin_t * sin_t / b2;
        let cb = 2.0 * cos_t * sin_t * (1.0 / a2 - 1.0 / b2);
        let cc = sin_t * sin_t / a2 + cos_t * cos_t / b2;
        let cd = -2.0 * ca * self.cx - cb * self.cy;
        let ce = -cb * self.cx - 2.0 * cc * self.cy;
        let cf = ca * self.cx * self.cx + cb * self.cx * self.cy + cc * self.cy * self.cy - 1.0;

        ConicCoeffs([ca, cb, cc, cd, ce, cf])
    }

    /// Sample `n` boundary points, evenly spaced in parametric angle.
    pub fn sample_points(&self, n: usize) -> Vec<[f64; 2]> {
        let (sin_t, cos_t) = self.angle.sin_cos();
        (0..n)
            .map(|i| {
                let t = 2.0 * std::f64::consts::PI * (i as f64) / (n as f64);
                let px = self.a * t.cos();
                let py = self.b * t.sin();
                [
                    self.cx + cos_t * px - sin_t * py,
                    self.cy + sin_t * px + cos_t * py,
                ]
            })
            .collect()
    }

    /// First-order geometric distance from `(x, y)` to the boundary:
    /// algebraic distance over gradient magnitude.
    pub fn boundary_distance(&self, x: f64, y: f64) -> f64 {
        let c = self.to_conic();
        let alg = c.algebraic_distance(x, y);
        let [gx, gy] = c.gradient(x, y);
        let grad_sq = gx * gx + gy * gy;
        if grad_sq < 1e-30 {
            return alg.abs();
        }
        alg.abs() / grad_sq.sqrt()
    }
}

impl ConicCoeffs {
    /// Algebraic distance of `(x, y)` to the conic.
    pub fn algebraic_distance(&self, x: f64, y: f64) -> f64 {
        let [a, b, c, d, e, f] = self.0;
        a * x * x + b * x * y + c * y * y + d * x + e * y + f
    }

    /// Gradient of the algebraic distance at `(x, y)`.
    pub fn gradient(&self, x: f64, y: f64) -> [f64; 2] {
        let [a, b, c, d, e, _] = self.0;
        [2.0 * a * x + b * y + d, b * x + 2.0 * c * y + e]
    }

    /// Discriminant test B² − 4AC < 0.
    pub fn is_ellipse(&self) -> bool {
        let [a, b, c, ..] = self.0;
        b * b - 4.0 * a * c < 0.0
    }

    /// Recover geometric parameters; `None` when the conic is not a proper
    /// finite ellipse.
    pub fn to_ellipse(self) -> Option<Ellipse> {
        let [a, b, c, d, e, f] = self.0;

        let disc = b * b - 4.0 * a * c;
        if disc >= 0.0 {
            return None;
        }

        // Center from the gradient-zero system.
        let denom = -disc; // > 0
        let cx = (b * e - 2.0 * c * d) / denom;
        let cy = (b * d - 2.0 * a * e) / denom;

        let angle = if (a - c).abs() < 1e-15 {
            if b > 0.0 {
                std::f64::consts::FRAC_PI_4
            } else if b < 0.0 {
                -std::f64::consts::FRAC_PI_4
            } else {
                0.0
            }
        } else {
            0.5 * b.atan2(a - c)
        };

        // Semi-axes from the eigenvalues of the quadratic part.
        let sum = a + c;
        let diff = ((a - c).powi(2) + b * b).sqrt();
        let lambda1 = (sum + diff) / 2.0;
        let lambda2 = (sum - diff) / 2.0;

        let f_center = a * cx * cx + b * cx * cy + c * cy * cy + d * cx + e * cy + f;
        if f_center.abs() < 1e-15 {
            return None;
        }

        let a_sq = -f_center / lambda1;
        let b_sq = -f_center / lambda2;
        if a_sq <= 0.0 || b_sq <= 0.0 || !a_sq.is_finite() || !b_sq.is_finite() {
            return None;
        }

        let (mut semi_a, mut semi_b) = (a_sq.sqrt(), b_sq.sqrt());
        let mut angle = angle;
        if semi_a < semi_b {
            std::mem::swap(&mut semi_a, &mut semi_b);
            angle += std::f64::consts::FRAC_PI_2;
        }

        let out = Ellipse {
            cx,
            cy,
            a: semi_a,
            b: semi_b,
            angle: normalize_angle(angle),
        };
        out.is_valid().then_some(out)
    }
}

/// Normalize an angle to (−π/2, π/2].
pub fn normalize_angle(mut angle: f64) -> f64 {
    let pi = std::f64::consts::PI;
    while angle > pi / 2.0 {
        angle -= pi;
    }
    while angle <= -pi / 2.0 {
        angle += pi;
    }
    angle
}

/// Fit an ellipse to `points` by the direct least-squares method
/// (constrained eigenproblem forcing B² − 4AC < 0).
///
/// Requires at least 6 points; the result is validated to be a proper
/// ellipse. This is the workhorse behind every curve fit in the detectors.
pub fn fit_ellipse_lsq(points: &[[f64; 2]]) -> Option<Ellipse> {
    let n = points.len();
    if n < 6 {
        return None;
    }

    let (mean_x, mean_y, scale) = normalization_params(points);

    let mut d = DMatrix::<f64>::zeros(n, 6);
    for (i, &[px, py]) in points.iter().enumerate() {
        let x = (px - mean_x) * scale;
        let y = (py - mean_y) * scale;
        d[(i, 0)] = x * x;
        d[(i, 1)] = x * y;
        d[(i, 2)] = y * y;
        d[(i, 3)] = x;
        d[(i, 4)] = y;
        d[(i, 5)] = 1.0;
    }

    let s = d.transpose() * &d;
    let s11 = s.fixed_view::<3, 3>(0, 0).into_owned();
    let s12 = s.fixed_view::<3, 3>(0, 3).into_owned();
    let s22 = s.fixed_view::<3, 3>(3, 3).into_owned();

    // Ellipse constraint matrix.
    let c1 = Matrix3::new(0.0, 0.0, 2.0, 0.0, -1.0, 0.0, 2.0, 0.0, 0.0);

    let s22_inv = s22.try_inverse()?;
    let m = s11 - s12 * s22_inv * s12.transpose();
    let system = c1.try_inverse()? * m;

    let a1 = constrained_eigvec_3x3(&system)?;
    let a2 = -s22_inv * s12.transpose() * a1;

    let coeffs = denormalize_conic(
        &Vector6::new(a1[0], a1[1], a1[2], a2[0], a2[1], a2[2]),
        mean_x,
        mean_y,
        scale,
    );

    let conic = ConicCoeffs(coeffs);
    if !conic.is_ellipse() {
        return None;
    }
    conic.to_ellipse()
}

/// Solve the 6-parameter conic through exactly 5 points via the SVD
/// null-space of the padded design matrix. Used inside RANSAC loops where
/// minimal samples are drawn; the caller validates the resulting ellipse.
pub fn fit_conic_minimal(points: &[[f64; 2]; 5]) -> Option<ConicCoeffs> {
    let mut m = Matrix6::<f64>::zeros();
    for (i, &[x, y]) in points.iter().enumerate() {
        m[(i, 0)] = x * x;
        m[(i, 1)] = x * y;
        m[(i, 2)] = y * y;
        m[(i, 3)] = x;
        m[(i, 4)] = y;
        m[(i, 5)] = 1.0;
    }
    // Sixth row stays zero; the smallest singular vector spans the
    // one-dimensional null space of the five constraints.
    let svd = m.svd(false, true);
    let v_t = svd.v_t?;
    let mut min_idx = 0;
    for i in 1..6 {
        if svd.singular_values[i] < svd.singular_values[min_idx] {
            min_idx = i;
        }
    }
    let row = v_t.row(min_idx);
    let coeffs = [row[0], row[1], row[2], row[3], row[4], row[5]];
    if coeffs.iter().any(|c| !c.is_finite()) {
        return None;
    }
    Some(ConicCoeffs(coeffs))
}

/// Centroid and isotropic scale bringing the mean point distance to √2.
pub fn normalization_params(points: &[[f64; 2]]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let mean_x: f64 = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let mean_y: f64 = points.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist: f64 = points
        .iter()
        .map(|p| ((p[0] - mean_x).powi(2) + (p[1] - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    (mean_x, mean_y, scale)
}

/// Undo the normalization substitution x' = s(x − mx), y' = s(y − my) on
/// conic coefficients fitted in normalized coordinates.
fn denormalize_conic(c: &Vector6<f64>, mx: f64, my: f64, s: f64) -> [f64; 6] {
    let [a_, b_, c_, d_, e_, f_] = [c[0], c[1], c[2], c[3], c[4], c[5]];
    let s2 = s * s;

    let a = a_ * s2;
    let b = b_ * s2;
    let c = c_ * s2;
    let d = -2.0 * a_ * s2 * mx - b_ * s2 * my + d_ * s;
    let e = -b_ * s2 * mx - 2.0 * c_ * s2 * my + e_ * s;
    let f =
        a_ * s2 * mx * mx + b_ * s2 * mx * my + c_ * s2 * my * my - d_ * s * mx - e_ * s * my + f_;

    [a, b, c, d, e, f]
}

/// Eigenvector of the (non-symmetric) reduced 3×3 system satisfying the
/// ellipse constraint 4 v₀ v₂ − v₁² > 0: characteristic cubic for the
/// eigenvalues, adjugate null vectors for the eigenvectors.
fn constrained_eigvec_3x3(system: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let a = system;
    let tr = a[(0, 0)] + a[(1, 1)] + a[(2, 2)];
    let minor_sum = a[(0, 0)] * a[(1, 1)] - a[(0, 1)] * a[(1, 0)] + a[(0, 0)] * a[(2, 2)]
        - a[(0, 2)] * a[(2, 0)]
        + a[(1, 1)] * a[(2, 2)]
        - a[(1, 2)] * a[(2, 1)];
    let det = a.determinant();

    let mut best: Option<Vector3<f64>> = None;
    let mut best_ev = f64::MAX;
    for ev in cubic_real_roots(1.0, -tr, minor_sum, -det) {
        let shifted = system - Matrix3::identity() * ev;
        let Some(v) = adjugate_null_vector(&shifted) else {
            continue;
        };
        if 4.0 * v[0] * v[2] - v[1] * v[1] > 0.0 && ev.abs() < best_ev {
            best_ev = ev.abs();
            best = Some(v);
        }
    }
    best
}

/// Null vector of a rank-deficient 3×3 matrix from the largest-norm row of
/// its adjugate.
fn adjugate_null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let rows = [
        Vector3::new(
            m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
            -(m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)]),
            m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
        ),
        Vector3::new(
            -(m[(0, 1)] * m[(2, 2)] - m[(0, 2)] * m[(2, 1)]),
            m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
            -(m[(0, 0)] * m[(2, 1)] - m[(0, 1)] * m[(2, 0)]),
        ),
        Vector3::new(
            m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
            -(m[(0, 0)] * m[(1, 2)] - m[(0, 2)] * m[(1, 0)]),
            m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        ),
    ];

    let mut best = &rows[0];
    let mut best_norm = best.norm_squared();
    for r in &rows[1..] {
        let n = r.norm_squared();
        if n > best_norm {
            best = r;
            best_norm = n;
        }
    }
    if best_norm < 1e-30 {
        return None;
    }
    Some(best / best_norm.sqrt())
}

/// Real roots of a x³ + b x² + c x + d = 0 (one or three).
fn cubic_real_roots(a: f64, b: f64, c: f64, d: f64) -> Vec<f64> {
    let a_inv = 1.0 / a;
    let b_ = b * a_inv;
    let c_ = c * a_inv;
    let d_ = d * a_inv;

    let p = c_ - b_ * b_ / 3.0;
    let q = 2.0 * b_ * b_ * b_ / 27.0 - b_ * c_ / 3.0 + d_;
    let disc = -4.0 * p * p * p - 27.0 * q * q;
    let shift = -b_ / 3.0;

    if disc >= 0.0 {
        let r = (-p / 3.0).sqrt();
        let cos_arg = if r.abs() < 1e-15 {
            0.0
        } else {
            (-q / (2.0 * r * r * r)).clamp(-1.0, 1.0)
        };
        let theta = cos_arg.acos();
        let two_r = 2.0 * r;
        vec![
            two_r * (theta / 3.0).cos() + shift,
            two_r * ((theta + 2.0 * std::f64::consts::PI) / 3.0).cos() + shift,
            two_r * ((theta + 4.0 * std::f64::consts::PI) / 3.0).cos() + shift,
        ]
    } else {
        let sqrt_disc = (q * q / 4.0 + p * p * p / 27.0).sqrt();
        let u = (-q / 2.0 + sqrt_disc).cbrt();
        let v = (-q / 2.0 - sqrt_disc).cbrt();
        vec![u + v + shift]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::prelude::*;

    fn make_test_ellipse() -> Ellipse {
        Ellipse {
            cx: 100.0,
            cy: 80.0,
            a: 30.0,
            b: 15.0,
            angle: 0.3,
        }
    }

    #[test]
    fn ellipse_conic_roundtrip() {
        let e = make_test_ellipse();
        let c = e.to_conic();
        assert!(c.is_ellipse());
        let e2 = c.to_ellipse().expect("roundtrip");
        assert_relative_eq!(e.cx, e2.cx, epsilon = 1e-10);
        assert_relative_eq!(e.cy, e2.cy, epsilon = 1e-10);
        assert_relative_eq!(e.a, e2.a, epsilon = 1e-10);
        assert_relative_eq!(e.b, e2.b, epsilon = 1e-10);
        assert_relative_eq!(e.angle, e2.angle, epsilon = 1e-10);
    }

    #[test]
    fn algebraic_distance_vanishes_on_boundary() {
        let e = make_test_ellipse();
        let c = e.to_conic();
        for &[x, y] in &e.sample_points(64) {
            assert!(c.algebraic_distance(x, y).abs() < 1e-10);
        }
    }

    #[test]
    fn lsq_fit_recovers_exact_points() {
        let e = make_test_ellipse();
        let fitted = fit_ellipse_lsq(&e.sample_points(50)).expect("fit");
        assert_relative_eq!(fitted.cx, e.cx, epsilon = 1e-6);
        assert_relative_eq!(fitted.cy, e.cy, epsilon = 1e-6);
        assert_relative_eq!(fitted.a, e.a, epsilon = 1e-6);
        assert_relative_eq!(fitted.b, e.b, epsilon = 1e-6);
        assert_relative_eq!(fitted.angle, e.angle, epsilon = 1e-6);
    }

    #[test]
    fn lsq_fit_tolerates_noise() {
        let e = make_test_ellipse();
        let mut pts = e.sample_points(200);
        let mut rng = StdRng::seed_from_u64(123);
        for p in &mut pts {
            p[0] += rng.gen::<f64>() - 0.5;
            p[1] += rng.gen::<f64>() - 0.5;
        }
        let fitted = fit_ellipse_lsq(&pts).expect("fit with noise");
        assert_relative_eq!(fitted.cx, e.cx, epsilon = 1.0);
        assert_relative_eq!(fitted.cy, e.cy, epsilon = 1.0);
        assert_relative_eq!(fitted.a, e.a, epsilon = 2.0);
        assert_relative_eq!(fitted.b, e.b, epsilon = 2.0);
    }

    #[test]
    fn lsq_fit_rejects_degenerate_inputs() {
        assert!(fit_ellipse_lsq(&[[1.0, 2.0], [3.0, 4.0]]).is_none());
        let line: Vec<[f64; 2]> = (0..8).map(|i| [i as f64, 2.0 * i as f64]).collect();
        assert!(fit_ellipse_lsq(&line).is_none());
        let dup = vec![[5.0, 5.0]; 12];
        assert!(fit_ellipse_lsq(&dup).is_none());
        assert!(fit_ellipse_lsq(&[]).is_none());
    }

    #[test]
    fn minimal_fit_through_five_points() {
        let e = make_test_ellipse();
        let pts = e.sample_points(5);
        let sample = [pts[0], pts[1], pts[2], pts[3], pts[4]];
        let conic = fit_conic_minimal(&sample).expect("minimal fit");
        // All five constraint points satisfy the conic.
        for &[x, y] in &sample {
            let scale: f64 = conic.0.iter().map(|c| c * c).sum::<f64>().sqrt();
            assert!(conic.algebraic_distance(x, y).abs() / scale < 1e-6);
        }
        let fitted = conic.to_ellipse().expect("ellipse from minimal fit");
        assert_relative_eq!(fitted.cx, e.cx, epsilon = 1e-5);
        assert_relative_eq!(fitted.cy, e.cy, epsilon = 1e-5);
    }

    #[test]
    fn minimal_fit_collinear_is_not_ellipse() {
        let sample = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
        if let Some(conic) = fit_conic_minimal(&sample) {
            assert!(conic.to_ellipse().is_none());
        }
    }

    #[test]
    fn boundary_distance_scales_like_pixels() {
        let e = Ellipse {
            cx: 50.0,
            cy: 50.0,
            a: 20.0,
            b: 20.0,
            angle: 0.0,
        };
        // A point 2 px outside a circle is ~2 px from the boundary.
        let d = e.boundary_distance(72.0, 50.0);
        assert!((d - 2.0).abs() < 0.2, "got {}", d);
    }

    #[test]
    fn fit_various_orientations() {
        for (i, e) in [
            Ellipse {
                cx: 50.0,
                cy: 50.0,
                a: 40.0,
                b: 10.0,
                angle: 0.0,
            },
            Ellipse {
                cx: 200.0,
                cy: 150.0,
                a: 25.0,
                b: 24.0,
                angle: 1.0,
            },
            Ellipse {
                cx: 300.0,
                cy: 100.0,
                a: 50.0,
                b: 20.0,
                angle: -0.7,
            },
        ]
        .iter()
        .enumerate()
        {
            let fitted = fit_ellipse_lsq(&e.sample_points(100))
                .unwrap_or_else(|| panic!("fit {} should succeed", i));
            assert_relative_eq!(fitted.cx, e.cx, epsilon = 1e-4);
            assert_relative_eq!(fitted.cy, e.cy, epsilon = 1e-4);
            assert_relative_eq!(fitted.a, e.a, epsilon = 1e-4);
            assert_relative_eq!(fitted.b, e.b, epsilon = 1e-4);
        }
    }
}
