use super::ActiveMask;

#[must_use]
pub fn and(a: &ActiveMask, b: &ActiveMask) -> ActiveMask {
    a.iter()
        .by_vals()
        .zip(b.iter().by_vals())
        .map(|(a, b)| a && b)
        .collect()
}

/// Threads in `a` but not in `b`.
#[must_use]
pub fn and_not(a: &ActiveMask, b: &ActiveMask) -> ActiveMask {
    a.iter()
        .by_vals()
        .zip(b.iter().by_vals())
        .map(|(a, b)| a && !b)
        .collect()
}

pub fn or_assign(a: &mut ActiveMask, b: &ActiveMask) {
    for idx in b.iter_ones() {
        if idx < a.len() {
            a.set(idx, true);
        }
    }
}

#[must_use]
pub fn full(num_threads: usize) -> ActiveMask {
    ActiveMask::repeat(true, num_threads)
}

#[must_use]
pub fn to_bit_string(mask: &ActiveMask) -> String {
    mask.iter()
        .by_vals()
        .map(|active| if active { '1' } else { '0' })
        .collect()
}
