//! Capacity-tiered reference reservations and share/millicore conversion
//!
//! These are the static formulas managed Kubernetes providers key to machine
//! size. The agent reports them next to its measurement-based targets so
//! operators can compare the two, but never acts on them.

use crate::quantity::Quantity;

const GIB: i64 = 1 << 30;

/// Memory reservation as a function of capacity:
/// 255 MiB below 1 GiB, then 25% of the first 4 GiB, 20% of the next 4 GiB,
/// 10% of the next 8 GiB, 6% of the next 112 GiB, 2% of everything above
/// 128 GiB. Monotone non-decreasing in capacity.
pub fn reserved_memory_for_capacity(capacity: Quantity) -> Quantity {
    if capacity.value() < GIB {
        return Quantity::from_mib(255);
    }

    // (segment size in bytes, percent applied to it)
    const TIERS: &[(i64, i64)] = &[
        (4 * GIB, 25),
        (4 * GIB, 20),
        (8 * GIB, 10),
        (112 * GIB, 6),
        (i64::MAX, 2),
    ];

    let mut remaining = capacity.value();
    let mut reservation = 0i64;
    for &(segment, percent) in TIERS {
        let portion = remaining.min(segment);
        reservation += (portion as f64 * percent as f64 / 100.0) as i64;
        remaining -= portion;
        if remaining == 0 {
            break;
        }
    }

    Quantity::new(reservation)
}

/// CPU reservation in millicores as a function of core count:
/// 6% of the first core, 1% of the next, 0.5% of the next two, 0.25% of the
/// remainder. Computed in f32 to match the convention the reference values
/// were produced with.
pub fn reserved_cpu_for_capacity(num_cores: i64) -> i64 {
    let mut capacity_millicores = num_cores * 1000;

    // 6% of the first core
    if capacity_millicores <= 1000 {
        return (capacity_millicores as f32 * 0.06f32) as i64;
    }
    let mut reservation = 1000f32 * 0.06f32;
    capacity_millicores -= 1000;

    // 1% of the next core
    if capacity_millicores <= 1000 {
        return (capacity_millicores as f32 * 0.01f32) as i64 + reservation as i64;
    }
    reservation += 1000f32 * 0.01f32;
    capacity_millicores -= 1000;

    // 0.5% of the next two cores
    if capacity_millicores <= 2000 {
        return (capacity_millicores as f32 * 0.005f32) as i64 + reservation as i64;
    }
    reservation += 2000f32 * 0.005f32;
    capacity_millicores -= 2000;

    // 0.25% of anything above four cores
    (capacity_millicores as f32 * 0.0025f32) as i64 + reservation as i64
}

/// Converts a binary-SI share count into decimal-SI millicores.
/// 1024 shares equal one core equal 1000 millicores.
pub fn decimal_milli_of_binary_shares(shares: i64) -> i64 {
    (shares as f64 / 1024.0 * 1000.0) as i64
}
