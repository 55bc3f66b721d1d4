use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Used for per-step probabilities so that stochastic process logic stays
/// bit-identical across platforms.
pub type Fixed64 = I32F32;

/// Simulation time in steps. The first executed step is time 1.
pub type Time = u64;

/// Number of steps until a scheduled entry becomes ready.
pub type Delay = u32;

/// Convert an f64 to Fixed64. Use only for initialization, never in the step loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Probability of at least one success in `trials` independent trials that
/// each succeed with `p`: `1 - (1 - p)^trials`.
///
/// Used for force-of-infection style rules where a person is exposed to
/// several infectious contacts in a single step.
pub fn complement_power(p: Fixed64, trials: u32) -> Fixed64 {
    let one = Fixed64::from_num(1);
    if p <= Fixed64::ZERO || trials == 0 {
        return Fixed64::ZERO;
    }
    if p >= one {
        return one;
    }
    let miss = one - p;
    let mut acc = one;
    for _ in 0..trials {
        acc = acc.saturating_mul(miss);
    }
    one - acc
}
