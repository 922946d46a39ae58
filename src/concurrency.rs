//! Process-wide concurrency hint derived from `common.max-cpu`.
//!
//! The tokio worker pool is sized once in `main`; this hint is what components
//! read afterwards to size their own worker pools (receiver parse workers).

use std::sync::atomic::{AtomicUsize, Ordering};

static MAX_CPU: AtomicUsize = AtomicUsize::new(0);

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Resolve a `max-cpu` value: 0 means every available core.
pub fn effective_max_cpu(requested: usize) -> usize {
    if requested == 0 {
        available_cpus()
    } else {
        requested
    }
}

/// Set the hint and return the effective value.
pub fn set_max_cpu(requested: usize) -> usize {
    let effective = effective_max_cpu(requested);
    let previous = MAX_CPU.swap(effective, Ordering::Relaxed);
    if previous != effective {
        tracing::debug!(previous, max_cpu = effective, "Concurrency hint updated");
    }
    effective
}

/// Current hint; all available cores until [`set_max_cpu`] is called.
pub fn max_cpu() -> usize {
    match MAX_CPU.load(Ordering::Relaxed) {
        0 => available_cpus(),
        n => n,
    }
}

/// Parse workers per receiver.
pub fn parse_threads() -> usize {
    max_cpu() * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_max_cpu() {
        assert_eq!(effective_max_cpu(3), 3);
        assert!(effective_max_cpu(0) >= 1);
    }

    #[test]
    fn test_set_and_read_hint() {
        assert_eq!(set_max_cpu(2), 2);
        assert!(max_cpu() >= 1);
        assert!(parse_threads() >= 2);
    }
}
