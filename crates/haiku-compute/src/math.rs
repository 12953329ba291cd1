//! Scalar definitions shared by the reference kernels
//!
//! These mirror `shaders/common.wgsl` exactly so both backends agree.

/// Logistic sigmoid
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Hyperbolic tangent evaluated piecewise
///
/// Large magnitudes saturate, medium ones use the exponential identity,
/// tiny ones return `x`, and the rest use a rational approximation
/// (Beebe, "Accurate Hyperbolic Tangent Computation").
pub fn stable_tanh(x: f32) -> f32 {
    const X_LARGE: f32 = 8.664_34;
    const X_MEDIUM: f32 = 5.493_061_4e-1;
    const X_SMALL: f32 = 4.228_64e-4;

    let sign = if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    };
    let abs_x = sign * x;

    if abs_x >= X_LARGE {
        return sign;
    }

    if abs_x >= X_MEDIUM {
        let temp = 0.5 - 1.0 / (1.0 + (2.0 * abs_x).exp());
        return sign * (temp + temp);
    }

    if abs_x < X_SMALL {
        return sign * abs_x;
    }

    const P0: f32 = -8.237_728e-1;
    const P1: f32 = -3.831_010_7e-3;
    const Q0: f32 = 2.471_319_7;

    let g = abs_x * abs_x;
    let r = g * (P1 * g + P0) / (g + Q0);
    x + x * r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_zero() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_sigmoid_saturates() {
        assert!(sigmoid(20.0) > 0.999_999);
        assert!(sigmoid(-20.0) < 1e-6);
    }

    #[test]
    fn test_stable_tanh_matches_std() {
        let mut x = -12.0f32;
        while x <= 12.0 {
            let expected = x.tanh();
            let actual = stable_tanh(x);
            assert!(
                (expected - actual).abs() < 2e-6,
                "tanh({x}): expected {expected}, got {actual}"
            );
            x += 0.037;
        }
    }

    #[test]
    fn test_stable_tanh_is_odd() {
        for x in [0.0001f32, 0.1, 0.5, 1.0, 3.0, 9.0] {
            assert_eq!(stable_tanh(-x), -stable_tanh(x));
        }
    }

    #[test]
    fn test_stable_tanh_zero() {
        assert_eq!(stable_tanh(0.0), 0.0);
    }
}
