use crate::pprof::Count;
use serde::{Deserialize, Serialize};

/// How emitted deltas are corrected for runtime sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    None,
    /// Heap samples are taken on average once every `rate` bytes.
    Heap { rate: i64 },
    /// Only one in `n` mutex or block events is recorded.
    Fraction(i64),
}

impl Scaling {
    pub fn apply(&self, c: Count) -> Count {
        match *self {
            Scaling::None => c,
            Scaling::Heap { rate } => {
                let (v1, v2) = scale_heap_sample(c.v1, c.v2, rate);
                Count { v1, v2 }
            }
            Scaling::Fraction(n) if n > 1 => Count {
                v1: c.v1.saturating_mul(n),
                v2: c.v2.saturating_mul(n),
            },
            Scaling::Fraction(_) => c,
        }
    }
}

/// Unsamples a heap (objects, bytes) pair. The probability of an allocation of
/// average size `avg` being sampled is `1 - exp(-avg / rate)`.
pub fn scale_heap_sample(count: i64, size: i64, rate: i64) -> (i64, i64) {
    if count == 0 || size == 0 {
        return (0, 0);
    }
    if rate <= 1 {
        return (count, size);
    }

    let avg_size = size as f64 / count as f64;
    let scale = 1.0 / (1.0 - (-avg_size / rate as f64).exp());
    ((count as f64 * scale) as i64, (size as f64 * scale) as i64)
}
