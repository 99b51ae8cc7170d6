//! Advisory probes for optional compute backends.
//!
//! Probes are informational only. No run is ever refused because of them.

use std::fmt;

use serde::Serialize;

/// Presence of the optional compute paths on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// More than one worker thread is available for data parallel kernels
    pub threaded: bool,
    /// Worker threads in the global pool
    pub worker_threads: usize,
    /// The binary was compiled with a SIMD target feature enabled
    pub simd: bool,
}

impl Capabilities {
    /// Probe the current process
    pub fn probe() -> Self {
        let worker_threads = rayon::current_num_threads();
        Self {
            threaded: worker_threads > 1,
            worker_threads,
            simd: simd_enabled(),
        }
    }

    /// One advisory line per probe
    pub fn advisories(&self) -> Vec<String> {
        let threaded = if self.threaded {
            format!(
                "Threaded backends are available ({} worker threads).",
                self.worker_threads
            )
        } else {
            "Threaded backends will run on a single worker thread; expect no speedup.".to_string()
        };
        let simd = if self.simd {
            "SIMD target features are enabled.".to_string()
        } else {
            "SIMD target features are disabled; native kernels use scalar code.".to_string()
        };
        vec![threaded, simd]
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.advisories().join("\n"))
    }
}

fn simd_enabled() -> bool {
    cfg!(any(
        target_feature = "avx2",
        target_feature = "sse4.1",
        target_feature = "neon",
        target_feature = "simd128"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisories_cover_both_probes() {
        let caps = Capabilities {
            threaded: false,
            worker_threads: 1,
            simd: true,
        };
        let lines = caps.advisories();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("single worker thread"));
        assert!(lines[1].contains("enabled"));
    }

    #[test]
    fn test_probe_is_consistent() {
        let caps = Capabilities::probe();
        assert_eq!(caps.threaded, caps.worker_threads > 1);
    }
}
