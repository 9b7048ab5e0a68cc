use std::sync::atomic::{AtomicUsize, Ordering};

/// The set of cores workers may be pinned to, handed out round robin.
#[derive(Debug)]
pub struct CpuSet {
    cores: Vec<usize>,
    next: AtomicUsize,
}

impl CpuSet {
    /// Cores reported by the OS. Falls back to `0..num_cpus` if they can't be
    /// listed.
    pub fn detect() -> Self {
        let cores = match core_affinity::get_core_ids() {
            Some(ids) if !ids.is_empty() => ids.into_iter().map(|c| c.id).collect(),
            _ => (0..num_cpus::get().max(1)).collect(),
        };
        Self::from_cores(cores)
    }

    /// An empty list is treated as a single core 0.
    pub fn from_cores(cores: Vec<usize>) -> Self {
        let cores = if cores.is_empty() { vec![0] } else { cores };
        CpuSet {
            cores,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Next core in round robin order.
    pub fn next_core(&self) -> usize {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        self.cores[idx % self.cores.len()]
    }
}
