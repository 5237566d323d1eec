/// Size the tokio worker pool from the CPU budget actually granted to
/// this process rather than the host's core count. Kubernetes hands out
/// fractional quotas through cgroups, and a pod limited to two cores on a
/// 64-core machine gains nothing from 64 workers contending inside its
/// quota.
///
/// Precedence: the `AETHER_CPU_LIMIT` override, then the cgroup quota
/// (unified v2 file, legacy v1 pair as fallback), then whatever the host
/// reports.
pub fn worker_threads() -> usize {
    let (threads, source) = cpu_budget();
    eprintln!("[runtime] worker threads: {} (source: {})", threads, source);
    threads
}

fn cpu_budget() -> (usize, &'static str) {
    if let Some(cores) = std::env::var("AETHER_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cores(&v))
    {
        return (cores, "AETHER_CPU_LIMIT");
    }

    if let Some(cores) = cgroup_quota() {
        return (cores, "cgroup quota");
    }

    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host parallelism")
}

/// Accepts plain core counts ("4") and Kubernetes-style millicores
/// ("2500m"). Fractional budgets round up: a 500m pod still needs one
/// worker.
fn parse_cores(value: &str) -> Option<usize> {
    let value = value.trim();
    let cores = match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok()?.div_ceil(1000),
        None => value.parse::<usize>().ok()?,
    };
    Some(cores.max(1))
}

/// The effective cgroup CPU quota, if one is set. The v2 unified file
/// holds `"<quota> <period>"` in a single line; v1 splits the same pair
/// across two files.
fn cgroup_quota() -> Option<usize> {
    let (quota, period) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|line| {
            let mut fields = line.split_whitespace().map(str::to_owned);
            Some((fields.next()?, fields.next()?))
        })
        .or_else(|| {
            let quota =
                std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
            let period =
                std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
            Some((quota, period))
        })?;
    quota_cores(&quota, &period)
}

/// Cores implied by a quota/period pair, rounded up. `"max"` (v2) and a
/// non-positive quota (v1) both mean unlimited.
fn quota_cores(quota: &str, period: &str) -> Option<usize> {
    let quota = quota.trim();
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    let cores = (quota + period - 1) / period;
    Some((cores as usize).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_core_counts() {
        assert_eq!(parse_cores("4"), Some(4));
        assert_eq!(parse_cores(" 8 "), Some(8));
        assert_eq!(parse_cores("four"), None);
    }

    #[test]
    fn test_millicores_round_up() {
        assert_eq!(parse_cores("4000m"), Some(4));
        assert_eq!(parse_cores("2500m"), Some(3));
        assert_eq!(parse_cores("500m"), Some(1));
    }

    #[test]
    fn test_quota_cores_rounds_partial_cores_up() {
        assert_eq!(quota_cores("400000", "100000"), Some(4));
        assert_eq!(quota_cores("150000", "100000"), Some(2));
        assert_eq!(quota_cores("50000", "100000"), Some(1));
    }

    #[test]
    fn test_unlimited_and_invalid_quotas() {
        assert_eq!(quota_cores("max", "100000"), None);
        assert_eq!(quota_cores("-1", "100000"), None);
        assert_eq!(quota_cores("0", "100000"), None);
        assert_eq!(quota_cores("banana", "100000"), None);
    }
}
