//! 3D FFT helpers on periodic cubes and the spectral derivative.
//!
//! Fields are flat row-major cubes of side `n` indexed `(i * n + j) * n + k`,
//! with `i` the slowest axis. The FFT is unnormalized in the forward direction
//! and the inverse divides by `n³`, matching numpy's `fftn`/`ifftn`.

use candle_core::{DType, Tensor};
use num_complex::Complex64;
use rustfft::FftPlanner;

use crate::error::{Result, TurbcastError};

/// Integer wavenumbers of an `n`-point periodic axis (`fftfreq(n, 1/n)`).
pub fn wavenumbers(n: usize) -> Vec<i64> {
    let n_i = n as i64;
    (0..n_i)
        .map(|m| if m < (n_i + 1) / 2 { m } else { m - n_i })
        .collect()
}

fn check_cube(len: usize, n: usize) -> Result<()> {
    if len != n * n * n {
        return Err(TurbcastError::shape_mismatch(
            format!("{n}^3 = {} values", n * n * n),
            format!("{len} values"),
        ));
    }
    Ok(())
}

/// In-place 3D FFT of a cube of side `n`.
///
/// `inverse` applies the backward transform including the `1/n³` factor.
pub fn fft3(data: &mut [Complex64], n: usize, inverse: bool) -> Result<()> {
    check_cube(data.len(), n)?;
    if n == 0 {
        return Ok(());
    }

    let mut planner = FftPlanner::<f64>::new();
    let fft = if inverse {
        planner.plan_fft_inverse(n)
    } else {
        planner.plan_fft_forward(n)
    };

    let mut line = vec![Complex64::new(0.0, 0.0); n];
    // Transform along each axis in turn; `stride` is the step between
    // consecutive samples of one line along that axis.
    for stride in [n * n, n, 1] {
        for base in 0..n * n {
            let start = line_start(base, stride, n);
            for (m, slot) in line.iter_mut().enumerate() {
                *slot = data[start + m * stride];
            }
            fft.process(&mut line);
            for (m, value) in line.iter().enumerate() {
                data[start + m * stride] = *value;
            }
        }
    }

    if inverse {
        let scale = 1.0 / (n * n * n) as f64;
        for value in data.iter_mut() {
            *value *= scale;
        }
    }
    Ok(())
}

/// Offset of the `base`-th line along the axis with `stride`.
fn line_start(base: usize, stride: usize, n: usize) -> usize {
    let (outer, inner) = (base / n, base % n);
    if stride == n * n {
        // lines along i: vary (j, k)
        outer * n + inner
    } else if stride == n {
        // lines along j: vary (i, k)
        outer * n * n + inner
    } else {
        // lines along k: vary (i, j)
        (outer * n + inner) * n
    }
}

/// Forward FFT of a real cube.
pub fn rfft3(field: &[f64], n: usize) -> Result<Vec<Complex64>> {
    let mut data: Vec<Complex64> = field.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    fft3(&mut data, n, false)?;
    Ok(data)
}

/// `∂f/∂x_axis` of a real cube on a 2π-periodic box.
///
/// The Nyquist mode of an even-sized axis is zeroed so the result stays real.
pub fn derivative(field_hat: &[Complex64], n: usize, axis: usize) -> Result<Vec<f64>> {
    check_cube(field_hat.len(), n)?;
    if axis > 2 {
        return Err(TurbcastError::shape_mismatch("axis in 0..3", format!("axis {axis}")));
    }
    let k = wavenumbers(n);
    let nyquist = n % 2 == 0;

    let mut data = field_hat.to_vec();
    for i in 0..n {
        for j in 0..n {
            for l in 0..n {
                let m = [i, j, l][axis];
                let idx = (i * n + j) * n + l;
                let kk = if nyquist && m == n / 2 { 0.0 } else { k[m] as f64 };
                data[idx] *= Complex64::new(0.0, kk);
            }
        }
    }
    fft3(&mut data, n, true)?;
    Ok(data.into_iter().map(|c| c.re).collect())
}

/// Velocity gradient of `uvw` `[B, 3, N, N, N]` as `[B, 3, 3, N, N, N]`.
///
/// `duvw[b, i, j] = ∂u_i/∂x_j`.
pub fn spectral_derivative_3d(uvw: &Tensor) -> Result<Tensor> {
    let dims = uvw.dims();
    if dims.len() != 5 || dims[1] != 3 || dims[2] != dims[3] || dims[3] != dims[4] {
        return Err(TurbcastError::shape_mismatch(
            "[batch, 3, N, N, N]",
            format!("{dims:?}"),
        ));
    }
    let (batch, n) = (dims[0], dims[2]);
    let cube = n * n * n;

    let values: Vec<f64> = uvw.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
    let mut out = Vec::with_capacity(batch * 9 * cube);
    for b in 0..batch {
        for component in 0..3 {
            let start = (b * 3 + component) * cube;
            let hat = rfft3(&values[start..start + cube], n)?;
            for axis in 0..3 {
                out.extend(derivative(&hat, n, axis)?);
            }
        }
    }

    let duvw = Tensor::from_vec(out, vec![batch, 3, 3, n, n, n], uvw.device())?;
    Ok(duvw.to_dtype(uvw.dtype())?)
}
