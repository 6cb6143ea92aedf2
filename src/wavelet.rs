use std::f64::consts::FRAC_1_SQRT_2;

/// Single-level Haar (db1) decomposition.
pub struct HaarLevel {
    pub approx: Vec<f64>,
    pub detail: Vec<f64>,
}

/// Splits `signal` into `ceil(n / 2)` approximation and detail coefficients.
///
/// `approx[k] = (x[2k] + x[2k+1]) / sqrt(2)`, `detail[k] = (x[2k] - x[2k+1]) / sqrt(2)`.
/// An odd trailing sample is paired with itself (symmetric extension).
pub fn haar_dwt(signal: &[f64]) -> HaarLevel {
    let pairs = (signal.len() + 1) / 2;
    let mut approx = Vec::with_capacity(pairs);
    let mut detail = Vec::with_capacity(pairs);

    for pair in signal.chunks(2) {
        let a = pair[0];
        let b = pair.get(1).copied().unwrap_or(a);
        approx.push((a + b) * FRAC_1_SQRT_2);
        detail.push((a - b) * FRAC_1_SQRT_2);
    }

    HaarLevel { approx, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn even_length() {
        let level = haar_dwt(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(level.approx.len(), 2);
        assert_relative_eq!(level.approx[0], 3.0 * FRAC_1_SQRT_2);
        assert_relative_eq!(level.approx[1], 7.0 * FRAC_1_SQRT_2);
        assert_relative_eq!(level.detail[0], -FRAC_1_SQRT_2);
        assert_relative_eq!(level.detail[1], -FRAC_1_SQRT_2);
    }

    #[test]
    fn odd_length_extends_last_sample() {
        let level = haar_dwt(&[2.0, 0.0, 5.0]);
        assert_eq!(level.approx.len(), 2);
        assert_relative_eq!(level.approx[1], 10.0 * FRAC_1_SQRT_2);
        assert_eq!(level.detail[1], 0.0);
    }

    #[test]
    fn energy_is_preserved() {
        let signal = [0.3, -1.2, 4.0, 2.2, -0.7, 0.1];
        let level = haar_dwt(&signal);
        let input: f64 = signal.iter().map(|x| x * x).sum();
        let output: f64 = level
            .approx
            .iter()
            .chain(&level.detail)
            .map(|x| x * x)
            .sum();
        assert_relative_eq!(input, output, epsilon = 1e-12);
    }
}
