use std::time::Duration;

const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStats {
    pub cpu_percent: Option<f64>,
    pub mem_used_percent: Option<f64>,
    pub active_processes: usize,
}

/// `(busy, total)` jiffies from the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let vals: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if vals.len() < 4 {
        return None;
    }
    let total: u64 = vals.iter().sum();
    // idle + iowait
    let idle = vals[3].saturating_add(vals.get(4).copied().unwrap_or(0));
    Some((total.saturating_sub(idle), total))
}

fn parse_mem_used_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(target_os = "linux")]
async fn read_cpu_percent() -> Option<f64> {
    let a = parse_cpu_line(&tokio::fs::read_to_string("/proc/stat").await.ok()?)?;
    tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
    let b = parse_cpu_line(&tokio::fs::read_to_string("/proc/stat").await.ok()?)?;

    let dt = b.1.saturating_sub(a.1);
    if dt == 0 {
        return Some(0.0);
    }
    Some(round1(b.0.saturating_sub(a.0) as f64 / dt as f64 * 100.0))
}

#[cfg(not(target_os = "linux"))]
async fn read_cpu_percent() -> Option<f64> {
    let _ = CPU_SAMPLE_WINDOW;
    None
}

#[cfg(target_os = "linux")]
async fn read_mem_used_percent() -> Option<f64> {
    let s = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_mem_used_percent(&s).map(round1)
}

#[cfg(not(target_os = "linux"))]
async fn read_mem_used_percent() -> Option<f64> {
    None
}

pub async fn collect(active_processes: usize) -> ServerStats {
    let (cpu_percent, mem_used_percent) = tokio::join!(read_cpu_percent(), read_mem_used_percent());
    ServerStats {
        cpu_percent,
        mem_used_percent,
        active_processes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_line_counts_iowait_as_idle() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n";
        assert_eq!(parse_cpu_line(stat), Some((200, 1000)));
    }

    #[test]
    fn mem_used_uses_available() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(parse_mem_used_percent(meminfo), Some(75.0));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_cpu_line("intr 1 2 3"), None);
        assert_eq!(parse_mem_used_percent("MemTotal: x"), None);
    }
}
