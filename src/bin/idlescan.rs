use std::thread;
use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use idlescan::{IdleScanner, KernelPaths, SweepProgress};

/// Estimate per-cgroup idle memory via the kernel's page_idle tracking.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Scan only 1 in N batches of pages
    #[arg(long, conflicts_with = "ratio")]
    sampling: Option<u64>,

    /// Fraction of pages to scan, in (0, 1]
    #[arg(long)]
    ratio: Option<f64>,

    /// Full sweeps to run; idle ages only become meaningful from the second
    /// sweep on
    #[arg(long, default_value_t = 2)]
    sweeps: u32,

    /// Seconds to pause between sweeps
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Emit the full cumulative series as JSON
    #[arg(long)]
    json: bool,
}

fn page_size() -> u64 {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as u64
    } else {
        4096
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let paths = KernelPaths::default();
    if !IdleScanner::supported(&paths) {
        bail!(
            "kernel does not expose {} (CONFIG_IDLE_PAGE_TRACKING)",
            paths.idle_bitmap.display()
        );
    }

    let mut scanner = IdleScanner::new(paths)?;
    if let Some(sampling) = cli.sampling {
        scanner.set_sampling(sampling)?;
    }
    if let Some(ratio) = cli.ratio {
        scanner.set_sampling_ratio(ratio)?;
    }

    for sweep in 0..cli.sweeps {
        if sweep > 0 && cli.delay > 0 {
            thread::sleep(Duration::from_secs(cli.delay));
        }
        while scanner.iterate()? == SweepProgress::More {}
    }

    let result = scanner.result()?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    let to_mib = |pages: u64| pages * page_size() / (1024 * 1024);
    println!(
        "{:<50} {:>10} {:>10} {:>10} {:>10}",
        "cgroup", "anon MiB", "idle MiB", "file MiB", "idle MiB"
    );
    for (path, stat) in &result {
        println!(
            "{:<50} {:>10} {:>10} {:>10} {:>10}",
            path,
            to_mib(stat.anon[0]),
            to_mib(stat.anon[1]),
            to_mib(stat.file[0]),
            to_mib(stat.file[1]),
        );
    }
    Ok(())
}
