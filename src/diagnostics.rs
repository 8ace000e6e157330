//! Turbulence diagnostics over reconstructed physical fields.
//!
//! Everything here is a pure function of completed fields: PDFs of
//! standardized signals, the joint R-Q PDF, the shell-binned energy
//! spectrum and pointwise invariants of the velocity-gradient tensor.
//! [`DiagnosticsReport`] bundles them for an original/reconstructed pair
//! and is written as JSON.

use std::path::Path;

use candle_core::{DType, Tensor};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::DiagnosticsConfig;
use crate::error::{Result, TurbcastError};
use crate::spectral::{rfft3, spectral_derivative_3d, wavenumbers};

/// Histogram of a standardized signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdf1d {
    /// Bin centers in units of standard deviation.
    pub x: Vec<f64>,
    /// `log10` of the probability density per bin.
    pub log_density: Vec<f64>,
}

/// Joint histogram over a shared square bin grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdf2d {
    /// Meshgrid of X bin centers, `[ny][nx]`.
    pub x: Vec<Vec<f64>>,
    /// Meshgrid of Y bin centers, `[ny][nx]`.
    pub y: Vec<Vec<f64>>,
    /// Density, one row per Y bin.
    pub density: Vec<Vec<f64>>,
}

/// Pointwise velocity-gradient invariants, each `grid_size³` long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VgStatistics {
    /// `A_ii`
    pub trace: Vec<f64>,
    /// `-tr(A²)/2`
    pub q: Vec<f64>,
    /// `-tr(A³)/3`
    pub r: Vec<f64>,
    /// `S_ij S_ij`
    pub sijsij: Vec<f64>,
    /// `Ω_ij Ω_ij`
    pub rijrij: Vec<f64>,
    /// `ω_i S_ij ω_j`
    pub vortex_stretching: Vec<f64>,
    /// `S_ij S_kj S_ji`
    pub sijskjsji: Vec<f64>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 1D PDF of the standardized signal with `num_bins` equal-width bins.
///
/// Empty bins take the smallest non-empty density so `log10` stays finite.
pub fn compute_1d_pdf(signal: &[f64], num_bins: usize) -> Result<Pdf1d> {
    if signal.is_empty() {
        return Err(TurbcastError::data("cannot build a PDF of an empty signal"));
    }
    if num_bins == 0 {
        return Err(TurbcastError::configuration("num_bins must be > 0"));
    }

    let mu = mean(signal);
    let var = signal.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / signal.len() as f64;
    let std = var.sqrt();
    if std == 0.0 || !std.is_finite() {
        return Err(TurbcastError::data("signal has zero or non-finite variance"));
    }
    let standardized: Vec<f64> = signal.iter().map(|v| (v - mu) / std).collect();

    let (mut lo, mut hi) = standardized
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / num_bins as f64;

    let mut counts = vec![0usize; num_bins];
    for v in &standardized {
        let bin = (((v - lo) / width) as usize).min(num_bins - 1);
        counts[bin] += 1;
    }

    let norm = standardized.len() as f64 * width;
    let mut density: Vec<f64> = counts.iter().map(|&c| c as f64 / norm).collect();
    let floor = density
        .iter()
        .copied()
        .filter(|&p| p > 0.0)
        .fold(f64::INFINITY, f64::min);
    for p in density.iter_mut() {
        if *p == 0.0 {
            *p = floor;
        }
    }

    Ok(Pdf1d {
        x: (0..num_bins).map(|b| lo + (b as f64 + 0.5) * width).collect(),
        log_density: density.iter().map(|p| p.log10()).collect(),
    })
}

/// Joint PDF of `(signal_x, signal_y)` on bins of width `binwidth`.
///
/// The bin grid starts at the joint minimum and covers the joint maximum.
pub fn compute_2d_pdf(signal_x: &[f64], signal_y: &[f64], binwidth: f64) -> Result<Pdf2d> {
    if signal_x.len() != signal_y.len() {
        return Err(TurbcastError::shape_mismatch(
            format!("{} samples", signal_x.len()),
            format!("{} samples", signal_y.len()),
        ));
    }
    if binwidth <= 0.0 {
        return Err(TurbcastError::configuration("binwidth must be > 0"));
    }

    let (lo, hi) = signal_x
        .iter()
        .chain(signal_y.iter())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let num_edges = ((hi + binwidth - lo) / binwidth).ceil() as usize;
    if signal_x.is_empty() || num_edges < 2 {
        return Err(TurbcastError::data("joint range is too small for one bin"));
    }
    let num_bins = num_edges - 1;
    let last_edge = lo + num_bins as f64 * binwidth;

    // counts[bx][by]
    let mut counts = vec![vec![0usize; num_bins]; num_bins];
    let mut total = 0usize;
    let locate = |v: f64| -> Option<usize> {
        if v < lo || v > last_edge {
            return None;
        }
        Some((((v - lo) / binwidth) as usize).min(num_bins - 1))
    };
    for (&vx, &vy) in signal_x.iter().zip(signal_y.iter()) {
        if let (Some(bx), Some(by)) = (locate(vx), locate(vy)) {
            counts[bx][by] += 1;
            total += 1;
        }
    }

    let norm = total.max(1) as f64 * binwidth * binwidth;
    let centers: Vec<f64> = (0..num_bins)
        .map(|b| lo + (b as f64 + 0.5) * binwidth)
        .collect();

    let x = (0..num_bins).map(|_| centers.clone()).collect();
    let y = centers.iter().map(|&c| vec![c; num_bins]).collect();
    let density = (0..num_bins)
        .map(|by| (0..num_bins).map(|bx| counts[bx][by] as f64 / norm).collect())
        .collect();

    Ok(Pdf2d { x, y, density })
}

/// Energy spectrum of a velocity field on an `ng³` periodic grid.
///
/// Per-mode energy `(|û|² + |v̂|² + |ŵ|²) / (2 ng⁶)` is summed into shells
/// `floor((2|k| + 1) / 2)`; the result has `ng` entries.
///
/// # Errors
///
/// Returns [`TurbcastError::ShapeMismatch`] if a field is not `ng³` long, or
/// if a corner mode falls in a shell past the last of the `ng` entries
/// (which happens for `ng = 2`).
pub fn compute_v_statistics(u: &[f64], v: &[f64], w: &[f64], ng: usize) -> Result<Vec<f64>> {
    let u_hat = rfft3(u, ng)?;
    let v_hat = rfft3(v, ng)?;
    let w_hat = rfft3(w, ng)?;

    let k = wavenumbers(ng);
    let norm = 2.0 * (ng as f64).powi(6);
    let mut spectrum = vec![0.0; ng];
    for i in 0..ng {
        for j in 0..ng {
            for l in 0..ng {
                let idx = (i * ng + j) * ng + l;
                let k2 = (k[i] * k[i] + k[j] * k[j] + k[l] * k[l]) as f64;
                let shell = ((2.0 * k2.sqrt() + 1.0) / 2.0).floor() as usize;
                let energy = (u_hat[idx].norm_sqr() + v_hat[idx].norm_sqr() + w_hat[idx].norm_sqr())
                    / norm;
                let slot = spectrum.get_mut(shell).ok_or_else(|| {
                    TurbcastError::shape_mismatch(
                        format!("shell index < {ng}"),
                        format!("shell {shell} at k = ({}, {}, {})", k[i], k[j], k[l]),
                    )
                })?;
                *slot += energy;
            }
        }
    }
    Ok(spectrum)
}

/// Velocity-gradient invariants at every cell of a `grid_size³` field.
///
/// `components` holds `A_00, A_01, A_02, A_10, ..., A_22` in row-major order.
pub fn compute_vg_statistics(components: &[Vec<f64>], grid_size: usize) -> Result<VgStatistics> {
    let cells = grid_size * grid_size * grid_size;
    if components.len() != 9 {
        return Err(TurbcastError::shape_mismatch(
            "9 velocity-gradient components",
            format!("{} components", components.len()),
        ));
    }
    for component in components {
        if component.len() != cells {
            return Err(TurbcastError::shape_mismatch(
                format!("({grid_size}, {grid_size}, {grid_size})"),
                format!("{} values", component.len()),
            ));
        }
    }

    let mut stats = VgStatistics {
        trace: Vec::with_capacity(cells),
        q: Vec::with_capacity(cells),
        r: Vec::with_capacity(cells),
        sijsij: Vec::with_capacity(cells),
        rijrij: Vec::with_capacity(cells),
        vortex_stretching: Vec::with_capacity(cells),
        sijskjsji: Vec::with_capacity(cells),
    };

    for cell in 0..cells {
        let a = Matrix3::from_fn(|i, j| components[i * 3 + j][cell]);
        let a2 = a * a;
        let a3 = a2 * a;
        let s = (a + a.transpose()) * 0.5;
        let rot = (a - a.transpose()) * 0.5;
        let omega = Vector3::new(2.0 * rot[(2, 1)], 2.0 * rot[(0, 2)], 2.0 * rot[(1, 0)]);

        stats.trace.push(a.trace());
        stats.q.push(-0.5 * a2.trace());
        stats.r.push(-a3.trace() / 3.0);
        stats.sijsij.push(s.component_mul(&s).sum());
        stats.rijrij.push(rot.component_mul(&rot).sum());
        stats.vortex_stretching.push(omega.dot(&(s * omega)));
        stats.sijskjsji.push((s * s).component_mul(&s).sum());
    }
    Ok(stats)
}

/// Scalar summaries of [`VgStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VgSummary {
    /// `<A_ii>`
    pub mean_trace: f64,
    /// `<S_ij S_ij>`
    pub mean_sijsij: f64,
    /// `<Ω_ij Ω_ij>`
    pub mean_rijrij: f64,
    /// `(-3/4) <ω_i S_ij ω_j>`
    pub scaled_vortex_stretching: f64,
    /// `<S_ij S_kj S_ji>`
    pub mean_sijskjsji: f64,
}

impl VgSummary {
    /// Summarize pointwise invariants.
    pub fn from_statistics(stats: &VgStatistics) -> Self {
        Self {
            mean_trace: mean(&stats.trace),
            mean_sijsij: mean(&stats.sijsij),
            mean_rijrij: mean(&stats.rijrij),
            scaled_vortex_stretching: -0.75 * mean(&stats.vortex_stretching),
            mean_sijskjsji: mean(&stats.sijskjsji),
        }
    }
}

/// All diagnostics of one velocity field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiagnostics {
    /// PDFs of `u`, `v`, `w` (first sample).
    pub velocity_pdfs: Vec<Pdf1d>,
    /// PDFs of `∂u_i/∂x_j`, row-major (all samples).
    pub gradient_pdfs: Vec<Pdf1d>,
    /// Shell-binned energy spectrum (first sample).
    pub energy_spectrum: Vec<f64>,
    /// Mean invariants (first sample).
    pub vg_summary: VgSummary,
    /// Joint PDF of `R / <SijSij>^{3/2}` and `Q / <SijSij>` (first sample).
    pub rq_pdf: Pdf2d,
}

impl FieldDiagnostics {
    /// Diagnose `uvw` `[B, 3, N, N, N]` and its gradient `duvw` `[B, 3, 3, N, N, N]`.
    pub fn compute(uvw: &Tensor, duvw: &Tensor, config: &DiagnosticsConfig) -> Result<Self> {
        let n = config.grid_size;
        let cells = n * n * n;
        let expected_uvw = [uvw.dim(0)?, 3, n, n, n];
        if uvw.dims() != expected_uvw {
            return Err(TurbcastError::shape_mismatch(
                format!("uvw {expected_uvw:?}"),
                format!("{:?}", uvw.dims()),
            ));
        }
        let expected_duvw = [uvw.dim(0)?, 3, 3, n, n, n];
        if duvw.dims() != expected_duvw {
            return Err(TurbcastError::shape_mismatch(
                format!("duvw {expected_duvw:?}"),
                format!("{:?}", duvw.dims()),
            ));
        }
        let batch = uvw.dim(0)?;

        let uvw: Vec<f64> = uvw.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        let duvw: Vec<f64> = duvw.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;

        let velocity: Vec<&[f64]> = (0..3).map(|c| &uvw[c * cells..(c + 1) * cells]).collect();
        let velocity_pdfs = velocity
            .iter()
            .map(|field| compute_1d_pdf(field, config.num_bins))
            .collect::<Result<Vec<_>>>()?;

        let mut gradient_pdfs = Vec::with_capacity(9);
        for component in 0..9 {
            let mut values = Vec::with_capacity(batch * cells);
            for b in 0..batch {
                let start = (b * 9 + component) * cells;
                values.extend_from_slice(&duvw[start..start + cells]);
            }
            gradient_pdfs.push(compute_1d_pdf(&values, config.num_bins)?);
        }

        let energy_spectrum = compute_v_statistics(velocity[0], velocity[1], velocity[2], n)?;

        let components: Vec<Vec<f64>> = (0..9)
            .map(|c| duvw[c * cells..(c + 1) * cells].to_vec())
            .collect();
        let stats = compute_vg_statistics(&components, n)?;
        let vg_summary = VgSummary::from_statistics(&stats);

        let mut rq_pdf = compute_2d_pdf(&stats.r, &stats.q, config.pdf2d_binwidth)?;
        let s2 = vg_summary.mean_sijsij;
        if s2 > 0.0 {
            let r_scale = s2.powf(1.5);
            for row in rq_pdf.x.iter_mut() {
                row.iter_mut().for_each(|v| *v /= r_scale);
            }
            for row in rq_pdf.y.iter_mut() {
                row.iter_mut().for_each(|v| *v /= s2);
            }
        }

        Ok(Self {
            velocity_pdfs,
            gradient_pdfs,
            energy_spectrum,
            vg_summary,
            rq_pdf,
        })
    }
}

/// Original vs. reconstructed diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    /// Ground-truth field.
    pub original: FieldDiagnostics,
    /// Field decoded from predicted codes.
    pub reconstructed: FieldDiagnostics,
    /// Per-component velocity MSE.
    pub mse_uvw: [f64; 3],
    /// Velocity-gradient MSE over all components.
    pub mse_duvw: f64,
}

impl DiagnosticsReport {
    /// Compare two `[B, 3, N, N, N]` velocity fields; gradients are taken spectrally.
    pub fn compute(original: &Tensor, reconstructed: &Tensor, config: &DiagnosticsConfig) -> Result<Self> {
        if original.dims() != reconstructed.dims() {
            return Err(TurbcastError::shape_mismatch(
                format!("{:?}", original.dims()),
                format!("{:?}", reconstructed.dims()),
            ));
        }
        let original_duvw = spectral_derivative_3d(original)?;
        let reconstructed_duvw = spectral_derivative_3d(reconstructed)?;

        let mut mse_uvw = [0.0; 3];
        for (c, slot) in mse_uvw.iter_mut().enumerate() {
            let diff = (reconstructed.narrow(1, c, 1)? - original.narrow(1, c, 1)?)?;
            *slot = diff.sqr()?.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
        let mse_duvw = (&reconstructed_duvw - &original_duvw)?
            .sqr()?
            .mean_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;

        let report = Self {
            original: FieldDiagnostics::compute(original, &original_duvw, config)?,
            reconstructed: FieldDiagnostics::compute(reconstructed, &reconstructed_duvw, config)?,
            mse_uvw,
            mse_duvw,
        };
        tracing::info!(
            "Diagnostics: MSE(uvw) = {:?}, MSE(duvw) = {:.4e}",
            report.mse_uvw,
            report.mse_duvw
        );
        Ok(report)
    }

    /// Write the report as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a report written by [`Self::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spectrum_rejects_shell_beyond_grid() {
        // ng = 2: mode (-1, -1, -1) has |k| = sqrt(3), shell 2
        let u: Vec<f64> = (0..8)
            .map(|idx| if (idx / 4 + idx / 2 % 2 + idx % 2) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let zeros = vec![0.0; 8];
        let err = compute_v_statistics(&u, &zeros, &zeros, 2).unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));

        // ng = 4 holds every shell
        let spectrum = compute_v_statistics(&[1.0; 64], &[0.0; 64], &[0.0; 64], 4).unwrap();
        assert!((spectrum[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_1d_pdf_uniform_ramp() {
        let signal: Vec<f64> = (0..1000).map(|v| v as f64).collect();
        let pdf = compute_1d_pdf(&signal, 10).unwrap();
        assert_eq!(pdf.x.len(), 10);

        // Evenly filled bins share one density and integrate to one
        let width = pdf.x[1] - pdf.x[0];
        let total: f64 = pdf.log_density.iter().map(|l| 10f64.powf(*l) * width).sum();
        assert!((total - 1.0).abs() < 1e-9);
        let first = pdf.log_density[0];
        assert!(pdf.log_density.iter().all(|l| (l - first).abs() < 1e-9));
    }

    #[test]
    fn test_1d_pdf_fills_empty_bins() {
        let signal = vec![0.0, 0.0, 0.0, 10.0];
        let pdf = compute_1d_pdf(&signal, 5).unwrap();
        assert!(pdf.log_density.iter().all(|l| l.is_finite()));
        // Middle bins are empty and take the smaller of the two occupied densities
        assert_eq!(pdf.log_density[2], pdf.log_density[4]);
    }

    #[test]
    fn test_1d_pdf_rejects_constant_signal() {
        assert!(compute_1d_pdf(&[1.0, 1.0, 1.0], 4).is_err());
    }

    #[test]
    fn test_2d_pdf_grid_and_normalization() {
        let x = vec![0.0, 0.5, 1.5, 2.5];
        let y = vec![0.0, 0.5, 0.5, 2.9];
        let pdf = compute_2d_pdf(&x, &y, 1.0).unwrap();

        // Edges 0, 1, 2, 3 -> three bins
        assert_eq!(pdf.density.len(), 3);
        assert_eq!(pdf.x[0], vec![0.5, 1.5, 2.5]);
        assert_eq!(pdf.y[2], vec![2.5, 2.5, 2.5]);

        let total: f64 = pdf.density.iter().flatten().sum();
        assert!((total - 1.0).abs() < 1e-12);

        // Rows are Y bins: (x=1.5, y=0.5) lands in row 0, column 1
        assert!((pdf.density[0][1] - 0.25).abs() < 1e-12);
        assert!((pdf.density[0][0] - 0.5).abs() < 1e-12);
        assert!((pdf.density[2][2] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_vg_rejects_wrong_grid() {
        let components = vec![vec![0.0; 8]; 9];
        let err = compute_vg_statistics(&components, 4).unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));

        let err = compute_vg_statistics(&components[..8], 2).unwrap_err();
        assert!(matches!(err, TurbcastError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_vg_pure_rotation() {
        // A = [[0, -1, 0], [1, 0, 0], [0, 0, 0]]: rigid rotation about z
        let mut components = vec![vec![0.0; 1]; 9];
        components[1] = vec![-1.0];
        components[3] = vec![1.0];
        let stats = compute_vg_statistics(&components, 1).unwrap();

        assert_eq!(stats.trace[0], 0.0);
        assert!((stats.sijsij[0]).abs() < 1e-12);
        assert!((stats.rijrij[0] - 2.0).abs() < 1e-12);
        // Q = -tr(A²)/2 = 1 for a unit rotation
        assert!((stats.q[0] - 1.0).abs() < 1e-12);
        assert!(stats.vortex_stretching[0].abs() < 1e-12);
    }

    #[test]
    fn test_energy_spectrum_length() {
        let n = 4;
        let zeros = vec![0.0; n * n * n];
        let spectrum = compute_v_statistics(&zeros, &zeros, &zeros, n).unwrap();
        assert_eq!(spectrum.len(), n);
        assert!(spectrum.iter().all(|&e| e == 0.0));
    }

    #[test]
    fn test_energy_spectrum_single_mode() {
        let n = 8;
        let h = 2.0 * std::f64::consts::PI / n as f64;
        let mut u = Vec::with_capacity(n * n * n);
        for i in 0..n {
            for _ in 0..n * n {
                u.push((i as f64 * h).cos());
            }
        }
        let zeros = vec![0.0; n * n * n];
        let spectrum = compute_v_statistics(&u, &zeros, &zeros, n).unwrap();

        // <u²>/2 = 1/4, all in shell 1
        assert!((spectrum[1] - 0.25).abs() < 1e-10);
        let elsewhere: f64 = spectrum.iter().enumerate().filter(|(s, _)| *s != 1).map(|(_, e)| e).sum();
        assert!(elsewhere.abs() < 1e-10);
    }

    #[test]
    fn test_1d_pdf_standard_normal_peak() {
        let samples = Tensor::randn(0f64, 1.0, 200_000, &candle_core::Device::Cpu)
            .unwrap()
            .to_vec1::<f64>()
            .unwrap();
        let pdf = compute_1d_pdf(&samples, 60).unwrap();
        let (peak, _) = pdf
            .log_density
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, &l)| if l > acc.1 { (i, l) } else { acc });
        assert!(pdf.x[peak].abs() < 0.5);
        // log10(1 / sqrt(2π)) ≈ -0.399
        assert!((pdf.log_density[peak] + 0.399).abs() < 0.05);
    }
}
