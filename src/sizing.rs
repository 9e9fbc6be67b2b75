//! Pure size arithmetic: the target-size calculation and conversions between
//! byte counts and Kubernetes quantity strings (`10Gi`, `5T`, ...).

use anyhow::{anyhow, Result};

use crate::policy::ScalingPolicy;

/// Compute the size a volume should grow to, honoring every bound of the
/// policy. Returns a value `<= current` when the volume is already at (or
/// past) its ceiling, which callers treat as "do not resize".
///
/// Growth is `current * scale_up_percent / 100` with floor division, then the
/// delta is clamped to `[min_increment, max_increment]` and the result capped
/// at `max_size`. Intermediate math is u128 so a multi-terabyte volume with a
/// large percentage cannot overflow.
pub fn target_bytes(current: u64, policy: &ScalingPolicy) -> u64 {
    let raw = (current as u128 * (100 + policy.scale_up_percent as u128) / 100) as u64;
    let mut delta = raw.saturating_sub(current);
    delta = delta.max(policy.scale_up_min_increment);
    delta = delta.min(policy.scale_up_max_increment);
    let candidate = current.saturating_add(delta);
    candidate.min(policy.scale_up_max_size)
}

const BINARY_SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, u64)] = &[
    ("k", 1_000),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Convert a Kubernetes storage quantity (`10Gi`, `5T`, `1e9`, `1000000`)
/// into a byte count.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Err(anyhow!("empty storage quantity"));
    }

    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let n: u64 = number
                .parse()
                .map_err(|_| anyhow!("invalid quantity {quantity:?}"))?;
            return n
                .checked_mul(*multiplier)
                .ok_or_else(|| anyhow!("quantity {quantity:?} overflows u64"));
        }
    }
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let n: u64 = number
                .parse()
                .map_err(|_| anyhow!("invalid quantity {quantity:?}"))?;
            return n
                .checked_mul(*multiplier)
                .ok_or_else(|| anyhow!("quantity {quantity:?} overflows u64"));
        }
    }

    // decimalExponent form, e.g. `12e9`
    if quantity.get(1..).is_some_and(|rest| rest.contains(['e', 'E'])) {
        let f: f64 = quantity
            .parse()
            .map_err(|_| anyhow!("invalid quantity {quantity:?}"))?;
        if !f.is_finite() || f < 0.0 || f > u64::MAX as f64 {
            return Err(anyhow!("quantity {quantity:?} out of range"));
        }
        return Ok(f as u64);
    }

    quantity
        .parse()
        .map_err(|_| anyhow!("invalid quantity {quantity:?}"))
}

fn try_unit(bytes: u64, multiplier: u64, suffix: &str) -> Option<String> {
    // Only use a unit when the rounded value stays within 10% of the exact
    // byte count, so 12000000000 renders as 12G but 12345678901 stays raw.
    let tolerance = multiplier / 10;
    if bytes < multiplier - tolerance {
        return None;
    }
    let rounded = (bytes + multiplier / 2) / multiplier;
    let retest = rounded * multiplier;
    if retest.abs_diff(bytes) < bytes / 10 {
        Some(format!("{rounded}{suffix}"))
    } else {
        None
    }
}

/// Render a byte count as a short quantity for logs and notifications.
/// Patches always use exact byte strings; this is presentation only.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[(u64, &str)] = &[
        (1_000_000_000_000, "T"),
        (1_000_000_000, "G"),
        (1_000_000, "M"),
        (1 << 40, "Ti"),
        (1 << 30, "Gi"),
        (1 << 20, "Mi"),
    ];
    for (multiplier, suffix) in UNITS {
        if let Some(rendered) = try_unit(bytes, *multiplier, suffix) {
            return rendered;
        }
    }
    bytes.to_string()
}
