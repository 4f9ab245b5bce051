//! Locating and signalling the per-layer backstore service process.
//!
//! Each attached layer is served by one `overlaybd-service <snID>` process.
//! The attach flow does not spawn it (the kernel target does), so the only
//! handle we have is a command-line match over the process table.

use std::fs;
use std::thread::sleep;
use std::time::Duration;

use rustix::process::{kill_process, Pid, Signal};
use tracing::{info, warn};

use crate::error::{Error, Result};

const SERVICE_PROCESS_NAME: &str = "overlaybd-service";

/// How long to wait for the service to exit after SIGINT.
const EXIT_WAIT_ATTEMPTS: u32 = 500;
const EXIT_WAIT_INTERVAL: Duration = Duration::from_micros(20);

/// Pids of service processes whose command line names this layer id.
pub fn find_service_pids(id: i64) -> std::io::Result<Vec<i32>> {
    let id_arg = id.to_string();
    let mut pids = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(cmdline) = fs::read(entry.path().join("cmdline")) else {
            // the process is allowed to vanish mid-scan
            continue;
        };
        let args: Vec<&str> = cmdline
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .filter_map(|a| std::str::from_utf8(a).ok())
            .collect();
        for pair in args.windows(2) {
            let program_matches =
                pair[0] == SERVICE_PROCESS_NAME || pair[0].ends_with(&format!("/{SERVICE_PROCESS_NAME}"));
            if program_matches && pair[1] == id_arg {
                pids.push(pid);
                break;
            }
        }
    }
    Ok(pids)
}

/// Send `signal` to the service process for `id` and, unless the signal is
/// SIGUSR2, wait for it to disappear from the process table.
pub fn kill_service(id: i64, signal: Signal) -> Result<()> {
    let pids = find_service_pids(id)?;
    if pids.is_empty() {
        warn!(id, "service process not found");
        return Ok(());
    }

    for &pid in &pids {
        info!(id, pid, ?signal, "signalling service process");
        if let Some(pid) = Pid::from_raw(pid) {
            if let Err(err) = kill_process(pid, signal) {
                warn!(id, pid = pid.as_raw_nonzero().get(), error = %err, "kill failed");
            }
        }
    }
    if signal == Signal::USR2 {
        // fire and forget
        return Ok(());
    }

    for _ in 0..EXIT_WAIT_ATTEMPTS {
        if find_service_pids(id)?.is_empty() {
            return Ok(());
        }
        sleep(EXIT_WAIT_INTERVAL);
    }
    Err(Error::DeadlineExceeded(format!(
        "service process for layer {id} did not exit"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_service_process() {
        // nothing on a test host serves this id
        assert!(find_service_pids(123_456_789).unwrap().is_empty());
        // absent process means the kill is a clean no-op
        kill_service(123_456_789, Signal::INT).unwrap();
    }
}
