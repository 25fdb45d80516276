use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::scan::{IdleScanner, SweepProgress};
use crate::stats::CgroupStat;

/// A completed sweep, keyed by cgroup path.
pub type SweepResult = BTreeMap<String, CgroupStat>;

pub type UpdateFn = Box<dyn Fn(&SweepResult) + Send>;

#[derive(Default)]
struct State {
    stop: bool,
    latest: Option<SweepResult>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Runs the scanner on its own thread, spreading each sweep's iterations
/// across `interval` so the scan cost never arrives as a CPU burst.
pub struct BackgroundScanner {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundScanner {
    pub fn spawn(scanner: IdleScanner, interval: Duration, on_update: Option<UpdateFn>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let thread = thread::spawn(move || run(scanner, interval, worker_shared, on_update));
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// The most recently completed sweep, if any sweep has finished yet.
    pub fn latest(&self) -> Option<SweepResult> {
        self.shared.state.lock().latest.clone()
    }

    /// Stats for one cgroup path; zeros when nothing has been seen for it.
    pub fn idle_stat(&self, path: &str) -> CgroupStat {
        self.shared
            .state
            .lock()
            .latest
            .as_ref()
            .and_then(|result| result.get(path).cloned())
            .unwrap_or_default()
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn request_stop(&self) {
        self.shared.state.lock().stop = true;
        self.shared.wake.notify_all();
    }
}

impl Drop for BackgroundScanner {
    fn drop(&mut self) {
        // dropped without shutdown(): let the worker wind down on its own
        self.request_stop();
    }
}

fn run(
    mut scanner: IdleScanner,
    interval: Duration,
    shared: Arc<Shared>,
    on_update: Option<UpdateFn>,
) {
    let mut warned_lag = false;
    'sweeps: loop {
        let nr_iters = scanner.nr_iters();
        let sweep_start = Instant::now();
        let mut scan_time = Duration::ZERO;
        let mut iters_done: u64 = 0;

        loop {
            if shared.state.lock().stop {
                return;
            }

            let iter_start = Instant::now();
            let progress = match scanner.iterate() {
                Ok(progress) => progress,
                Err(e) => {
                    error!("idle page scan failed: {e}");
                    // partial counts are unusable, start the sweep over
                    scanner.reset();
                    if sleep_interruptible(&shared, interval) {
                        return;
                    }
                    continue 'sweeps;
                }
            };
            scan_time += iter_start.elapsed();
            iters_done += 1;

            match throttle_delay(interval, sweep_start.elapsed(), nr_iters, iters_done, scan_time)
            {
                Ok(pause) => {
                    if !pause.is_zero() && sleep_interruptible(&shared, pause) {
                        return;
                    }
                }
                Err(lag) => {
                    // only significant lag is worth a log line
                    if !warned_lag && lag > interval / 1000 {
                        warn!("idle page scan lagging {lag:?} behind");
                        warned_lag = true;
                    }
                }
            }

            if progress == SweepProgress::Complete {
                break;
            }
        }

        match scanner.result() {
            Ok(result) => {
                debug!(cgroups = result.len(), "idle page sweep complete");
                shared.state.lock().latest = Some(result.clone());
                if let Some(callback) = &on_update {
                    callback(&result);
                }
            }
            Err(e) => error!("failed to aggregate idle page stats: {e}"),
        }
    }
}

/// How long to pause before the next iteration so the remaining ones land on
/// the interval boundary; `Err` carries the shortfall when the sweep cannot
/// finish in time at the measured pace.
fn throttle_delay(
    interval: Duration,
    elapsed: Duration,
    nr_iters: u64,
    iters_done: u64,
    scan_time: Duration,
) -> Result<Duration, Duration> {
    let iters_left = nr_iters.saturating_sub(iters_done);
    let time_left = interval.saturating_sub(elapsed);
    let time_required = scan_time.mul_f64(iters_left as f64 / iters_done as f64);
    if time_required > time_left {
        return Err(time_required - time_left);
    }
    if iters_left == 0 {
        // sweep finished early: sleep out the rest of the interval
        return Ok(time_left);
    }
    Ok((time_left - time_required).div_f64(iters_left as f64))
}

// true when shutdown was requested
fn sleep_interruptible(shared: &Shared, duration: Duration) -> bool {
    let mut state = shared.state.lock();
    if state.stop {
        return true;
    }
    let _ = shared.wake.wait_for(&mut state, duration);
    state.stop
}
