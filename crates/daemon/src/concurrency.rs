//! Worker pool sizing
//!
//! Derives how many encoder processes to run and how many threads each
//! software encode may use from the CPU core count and configuration.

use crate::config::PoolConfig;

/// Sizing derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Upper bound on worker processes
    pub max_workers: u32,
    /// `-threads` for each software encode
    pub threads_per_worker: u32,
}

impl ConcurrencyPlan {
    /// Derive a plan for a known core count
    ///
    /// - An explicit non-zero `max_workers` is used unchanged
    /// - Otherwise 1 worker below 4 cores, 2 from 4 cores up
    /// - Threads per worker are the cores split evenly, at least 1
    pub fn for_cores(total_cores: u32, cfg: &PoolConfig) -> Self {
        let total_cores = total_cores.max(1);

        let max_workers = if cfg.max_workers > 0 {
            cfg.max_workers
        } else {
            derive_workers(total_cores)
        };

        let threads_per_worker = (total_cores / max_workers).max(1);

        Self {
            total_cores,
            max_workers,
            threads_per_worker,
        }
    }
}

/// Derive worker count based on core count
/// - 1 worker below 4 cores
/// - 2 workers otherwise
fn derive_workers(cores: u32) -> u32 {
    if cores < 4 {
        1
    } else {
        2
    }
}

/// Derive a plan for this machine
pub fn derive_plan(cfg: &PoolConfig) -> ConcurrencyPlan {
    ConcurrencyPlan::for_cores(num_cpus::get() as u32, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool_config(max_workers: u32) -> PoolConfig {
        PoolConfig {
            max_workers,
            ..PoolConfig::default()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_worker_derivation(cores in 1u32..256) {
            let plan = ConcurrencyPlan::for_cores(cores, &pool_config(0));

            prop_assert_eq!(plan.total_cores, cores);
            let expected_workers = if cores < 4 { 1 } else { 2 };
            prop_assert_eq!(
                plan.max_workers, expected_workers,
                "For {} cores, expected {} workers but got {}",
                cores, expected_workers, plan.max_workers
            );
        }

        #[test]
        fn prop_explicit_workers_override(
            cores in 1u32..256,
            explicit in 1u32..16,
        ) {
            let plan = ConcurrencyPlan::for_cores(cores, &pool_config(explicit));
            prop_assert_eq!(plan.max_workers, explicit);
        }

        // Workers never oversubscribe the machine with threads, and each
        // gets at least one.
        #[test]
        fn prop_threads_split_cores(
            cores in 1u32..256,
            explicit in 0u32..16,
        ) {
            let plan = ConcurrencyPlan::for_cores(cores, &pool_config(explicit));
            prop_assert!(plan.threads_per_worker >= 1);
            if plan.max_workers <= cores {
                prop_assert!(plan.threads_per_worker * plan.max_workers <= cores);
            }
        }
    }

    #[test]
    fn test_zero_cores_treated_as_one() {
        let plan = ConcurrencyPlan::for_cores(0, &pool_config(0));
        assert_eq!(plan.total_cores, 1);
        assert_eq!(plan.max_workers, 1);
        assert_eq!(plan.threads_per_worker, 1);
    }

    #[test]
    fn test_eight_cores() {
        let plan = ConcurrencyPlan::for_cores(8, &pool_config(0));
        assert_eq!(plan.max_workers, 2);
        assert_eq!(plan.threads_per_worker, 4);
    }

    #[test]
    fn test_derive_plan_uses_host() {
        let plan = derive_plan(&pool_config(3));
        assert_eq!(plan.max_workers, 3);
        assert!(plan.total_cores >= 1);
    }
}
