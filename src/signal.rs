use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::neldermead::NelderMead;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F64};
use log::debug;
use ndarray::{s, ArrayView1, Zip};

/// Number of time constants a pass is primed for before the first sample.
const SETTLE_PERIODS: f64 = 10.0;

/// 2nd-order Butterworth low-pass.
#[derive(Debug, Clone, Copy)]
pub struct LowPass {
    coeffs: Coefficients<f64>,
    /// Samples of the held first value fed before each pass.
    settle: usize,
}

impl LowPass {
    /// `None` unless `0 < cutoff < fs / 2`.
    pub fn butterworth(cutoff_hz: f64, sample_rate: f64) -> Option<Self> {
        if !(cutoff_hz > 0.0 && cutoff_hz < sample_rate / 2.0) {
            return None;
        }
        let coeffs = Coefficients::<f64>::from_params(
            Type::LowPass,
            sample_rate.hz(),
            cutoff_hz.hz(),
            Q_BUTTERWORTH_F64,
        )
        .map_err(|e| debug!("no {cutoff_hz} Hz low-pass at {sample_rate} Hz: {e:?}"))
        .ok()?;
        Some(LowPass {
            coeffs,
            settle: (SETTLE_PERIODS * sample_rate / cutoff_hz).ceil() as usize,
        })
    }

    pub fn dc_gain(&self) -> f64 {
        let c = &self.coeffs;
        (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2)
    }

    fn pass(&self, x: &[f64], settle: usize) -> Vec<f64> {
        let mut filter = DirectForm2Transposed::<f64>::new(self.coeffs);
        if let Some(&first) = x.first() {
            for _ in 0..settle {
                filter.run(first);
            }
        }
        x.iter().map(|&v| filter.run(v)).collect()
    }

    /// Causal filtering from rest.
    pub fn filter(&self, x: &[f64]) -> Vec<f64> {
        self.pass(x, 0)
    }

    /// Zero-phase forward-backward filtering with odd extension at both
    /// ends. Each pass starts in the steady state of its first sample.
    pub fn filtfilt(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n < 2 {
            return x.to_vec();
        }
        let pad = 9.min(n - 1);
        let (first, last) = (x[0], x[n - 1]);
        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * first - x[i]));
        ext.extend_from_slice(x);
        ext.extend((n - 1 - pad..n - 1).rev().map(|i| 2.0 * last - x[i]));

        let mut forward = self.pass(&ext, self.settle);
        forward.reverse();
        let mut backward = self.pass(&forward, self.settle);
        backward.reverse();
        backward[pad..pad + n].to_vec()
    }
}

/// Low-pass filters `values` spanning `elapsed_s` seconds. The sample rate
/// is the whole number of samples per second. `None` when the rate cannot
/// support the cutoff.
pub fn lowpass(values: &[f64], elapsed_s: f64, cutoff_hz: f64) -> Option<Vec<f64>> {
    if values.len() < 2 || elapsed_s <= 0.0 {
        return None;
    }
    let sample_rate = (values.len() as f64 / elapsed_s).floor();
    let Some(filter) = LowPass::butterworth(cutoff_hz, sample_rate) else {
        debug!("cannot low-pass at {cutoff_hz} Hz with {sample_rate} Hz sampling");
        return None;
    };
    Some(filter.filtfilt(values))
}

/// Trapezoidal rule over evenly spaced samples.
pub fn trapezoid(y: &[f64], dx: f64) -> f64 {
    let y = ArrayView1::from(y);
    match y.len() {
        0 | 1 => 0.0,
        n => (y.sum() - (y[0] + y[n - 1]) / 2.0) * dx,
    }
}

fn trapezoid_xy(y: ArrayView1<f64>, x: ArrayView1<f64>) -> f64 {
    if y.len() < 2 {
        return 0.0;
    }
    let dx = &x.slice(s![1..]) - &x.slice(s![..-1]);
    let pairs = &y.slice(s![1..]) + &y.slice(s![..-1]);
    (dx * pairs).sum() / 2.0
}

/// Composite Simpson over an odd number of possibly uneven samples.
fn simpson_odd(y: ArrayView1<f64>, x: ArrayView1<f64>) -> f64 {
    let n = y.len();
    if n < 3 {
        return 0.0;
    }
    let h = &x.slice(s![1..]) - &x.slice(s![..-1]);
    Zip::from(h.slice(s![..;2]))
        .and(h.slice(s![1..;2]))
        .and(y.slice(s![..n - 2;2]))
        .and(y.slice(s![1..n - 1;2]))
        .and(y.slice(s![2..;2]))
        .fold(0.0, |acc, &h0, &h1, &y0, &y1, &y2| {
            let hsum = h0 + h1;
            let panel =
                y0 * (2.0 - h1 / h0) + y1 * (hsum * hsum / (h0 * h1)) + y2 * (2.0 - h0 / h1);
            acc + hsum / 6.0 * panel
        })
}

/// Simpson's rule against `x`. With an even number of samples the result is
/// the average of closing either end interval with a trapezoid.
pub fn simpson(y: &[f64], x: &[f64]) -> f64 {
    let n = y.len().min(x.len());
    let (y, x) = (ArrayView1::from(&y[..n]), ArrayView1::from(&x[..n]));
    match n {
        0 | 1 => 0.0,
        2 => trapezoid_xy(y, x),
        _ if n % 2 == 1 => simpson_odd(y, x),
        _ => {
            let head = simpson_odd(y.slice(s![..n - 1]), x.slice(s![..n - 1]))
                + trapezoid_xy(y.slice(s![n - 2..]), x.slice(s![n - 2..]));
            let tail = trapezoid_xy(y.slice(s![..2]), x.slice(s![..2]))
                + simpson_odd(y.slice(s![1..]), x.slice(s![1..]));
            (head + tail) / 2.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub nb_data: usize,
}

/// Ordinary least squares line through `(x, y)`.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    if x.len() < 2 || x.len() != y.len() {
        return None;
    }
    let n = x.len() as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xy: f64 = x.iter().zip(y).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = x.iter().map(|x| x.powi(2)).sum();

    let denominator = n * sum_xx - sum_x.powi(2);
    if denominator == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;

    let mean_y = sum_y / n;
    let ss_total: f64 = y.iter().map(|y| (y - mean_y).powi(2)).sum();
    let ss_residual: f64 = x
        .iter()
        .zip(y)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    Some(LinearFit {
        slope,
        intercept,
        r_squared: 1.0 - ss_residual / ss_total,
        nb_data: x.len(),
    })
}

pub fn nan_mean(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

/// Population standard deviation of the non-NaN values.
pub fn nan_std(values: &[f64]) -> f64 {
    let mean = nan_mean(values);
    if mean.is_nan() {
        return f64::NAN;
    }
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    (valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / valid.len() as f64).sqrt()
}

/// `A·e^(B·t) + C`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpCurve {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl ExpCurve {
    pub fn at(&self, t: f64) -> f64 {
        self.a * (self.b * t).exp() + self.c
    }
}

/// Sum of squared residuals of an exponential model.
#[derive(Debug, Clone)]
struct ExpCost {
    t: Vec<f64>,
    y: Vec<f64>,
    /// Fixed amplitude: fit `amplitude·e^(−K·t)` with K the only parameter.
    decay_from: Option<f64>,
}

impl ExpCost {
    fn model(&self, p: &[f64]) -> ExpCurve {
        match self.decay_from {
            Some(amplitude) => ExpCurve {
                a: amplitude,
                b: -p[0],
                c: 0.0,
            },
            None => ExpCurve {
                a: p[0],
                b: p[1],
                c: p[2],
            },
        }
    }
}

impl CostFunction for ExpCost {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> Result<Self::Output, Error> {
        let curve = self.model(p);
        let sse: f64 = self
            .t
            .iter()
            .zip(&self.y)
            .map(|(&t, &y)| (curve.at(t) - y).powi(2))
            .sum();
        if !sse.is_finite() {
            return Ok(1e99);
        }
        Ok(sse)
    }
}

const MAX_FIT_ITERS: u64 = 10_000;

fn simplex_around(start: &[f64]) -> Vec<Vec<f64>> {
    let mut simplex = vec![start.to_vec()];
    for i in 0..start.len() {
        let mut vertex = start.to_vec();
        vertex[i] = if vertex[i] == 0.0 {
            0.05
        } else {
            vertex[i] * 1.1
        };
        simplex.push(vertex);
    }
    simplex
}

fn minimize(cost: ExpCost, start: &[f64]) -> Result<Vec<f64>, Error> {
    let solver = NelderMead::new(simplex_around(start)).with_sd_tolerance(1e-12)?;
    let res = Executor::new(cost, solver)
        .configure(|state| state.max_iters(MAX_FIT_ITERS))
        .run()?;
    res.state()
        .get_best_param()
        .cloned()
        .ok_or_else(|| Error::msg("solver returned no parameters"))
}

/// Least-squares fit of `A·e^(B·t) + C`. `None` with fewer than two samples
/// or when the solver fails.
pub fn fit_exponential(t: &[f64], y: &[f64]) -> Option<ExpCurve> {
    if t.len() < 2 || t.len() != y.len() {
        return None;
    }
    let span = t[t.len() - 1] - t[0];
    let growth = span.exp_m1();
    let a0 = if growth.is_finite() && growth != 0.0 {
        (y[y.len() - 1] - y[0]) / growth
    } else {
        1.0
    };
    let start = [a0, 1.0, y[0] - a0];

    let cost = ExpCost {
        t: t.to_vec(),
        y: y.to_vec(),
        decay_from: None,
    };
    match minimize(cost, &start) {
        Ok(p) => Some(ExpCurve {
            a: p[0],
            b: p[1],
            c: p[2],
        }),
        Err(e) => {
            debug!("exponential fit failed: {e}");
            None
        }
    }
}

/// Decay constant K of `amplitude·e^(−K·t)` fitted to `(t, y)`.
pub fn fit_decay(t: &[f64], y: &[f64], amplitude: f64) -> Option<f64> {
    if t.len() < 2 || t.len() != y.len() {
        return None;
    }
    let cost = ExpCost {
        t: t.to_vec(),
        y: y.to_vec(),
        decay_from: Some(amplitude),
    };
    match minimize(cost, &[1.0]) {
        Ok(p) => Some(p[0]),
        Err(e) => {
            debug!("decay fit failed: {e}");
            None
        }
    }
}
