use std::{
    fs::File,
    io::{BufWriter, Write},
    time::Instant,
};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use kalias_bin::technique::{build_techniques, parse_kread, parse_kwrite};
use kalias_core::util::PAGE_SIZE;
use kalias_core::{Capabilities, CopyRegion, RunReport, Session};
use kalias_sim::{PagePool, SIM_PROC_PID_OFFSET, SimDuplicator, SimKernel, sim_capabilities};
use log::{info, warn};
use rand::Rng;
use serde::Serialize;

/// First pool page of the aliased range, leaving the early heap to the
/// technique sprays.
const ALIAS_FIRST_PAGE: usize = 16;

/// Pages the sprays may consume beyond the aliased range before the pool is
/// considered too small.
const SPRAY_HEADROOM_PAGES: usize = 64;

const SCRATCH_PATTERN: u64 = u64::from_le_bytes(*b"krkw_sim");

/// CLI arguments for the `krkw_sim` binary.
///
/// This struct defines the command line arguments that can be passed to the
/// `krkw_sim` binary for evaluating krkw session reliability against the
/// simulated kernel.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The technique family for the read channel.
    #[clap(long = "kread", default_value = "stamp")]
    kread: String,
    /// The technique family for the write channel.
    #[clap(long = "kwrite", default_value = "stamp")]
    kwrite: String,
    /// Size of the simulated kernel pool in pages.
    #[clap(long = "pool-pages", default_value = "4096")]
    pool_pages: usize,
    /// Number of aliased (dangling) pages handed to the session.
    #[clap(long = "puaf-pages", default_value = "64")]
    puaf_pages: usize,
    /// Pages copied per duplication pass during free-page acquisition.
    #[clap(long = "copy-pages", default_value = "4")]
    copy_pages: usize,
    /// The number of full sessions to run.
    #[clap(long = "attempts", default_value = "10")]
    attempts: u32,
    /// Base seed for the kernel slide and reclaim plan; random when absent.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Capability descriptor file (JSON format); the simulated build when
    /// absent.
    #[clap(long = "caps")]
    caps: Option<String>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// Verbose output - print per-attempt object details.
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct AttemptResult {
    attempt: u32,
    success: bool,
    duration_ms: u64,
    seed: u64,
    report: Option<RunReport>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionResults {
    args: CliArgs,
    total_attempts: u32,
    successful_attempts: u32,
    failed_attempts: u32,
    success_rate: f64,
    average_duration_ms: f64,
    total_duration_ms: u64,
    attempts: Vec<AttemptResult>,
}

impl SessionResults {
    fn new(args: CliArgs) -> Self {
        Self {
            args,
            total_attempts: 0,
            successful_attempts: 0,
            failed_attempts: 0,
            success_rate: 0.0,
            average_duration_ms: 0.0,
            total_duration_ms: 0,
            attempts: Vec::new(),
        }
    }

    fn add_attempt(&mut self, result: AttemptResult) {
        self.total_attempts += 1;
        if result.success {
            self.successful_attempts += 1;
        } else {
            self.failed_attempts += 1;
        }
        self.total_duration_ms += result.duration_ms;
        self.attempts.push(result);

        // Update calculated fields
        self.success_rate = self.successful_attempts as f64 / self.total_attempts as f64;
        self.average_duration_ms = self.total_duration_ms as f64 / self.total_attempts as f64;
    }

    fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

/// Runs one full session against a fresh simulated kernel and proves the
/// primitives it yields.
fn run_session(
    args: &CliArgs,
    caps: &Capabilities,
    progress: &indicatif::MultiProgress,
    seed: u64,
) -> Result<RunReport> {
    ensure!(
        args.pool_pages >= ALIAS_FIRST_PAGE + args.puaf_pages + SPRAY_HEADROOM_PAGES,
        "pool of {} pages is too small for {} aliased pages",
        args.pool_pages,
        args.puaf_pages
    );

    let kernel = SimKernel::new(args.pool_pages, seed)?.into_shared();

    // Alias a page range past the early heap and schedule one page reclaim
    // per copy pass, so acquisition sees frames coming back gradually.
    let alias_pages = ALIAS_FIRST_PAGE..ALIAS_FIRST_PAGE + args.puaf_pages;
    let puaf = kernel.borrow().alias_pages(alias_pages.clone())?;
    for (index, page) in alias_pages.enumerate() {
        let at_churn = (index as u64 + 1) * args.copy_pages as u64;
        kernel.borrow_mut().plan_reclaim(page, at_churn);
    }

    let copy_pool = PagePool::new(2 * args.copy_pages)?;
    let copy = CopyRegion::new(
        copy_pool.addr(0) as usize,
        copy_pool.addr(args.copy_pages * PAGE_SIZE) as usize,
        args.copy_pages * PAGE_SIZE,
    )?;

    let kread_family = parse_kread(&args.kread)?;
    let kwrite_family = parse_kwrite(&args.kwrite)?;
    let (kread, kwrite) = build_techniques(&kernel, caps, kread_family, kwrite_family)?;

    let mut session = Session::builder()
        .kread_technique(kread_family, kread)
        .kwrite_technique(kwrite_family, kwrite)
        .capabilities(caps.clone())
        .puaf_pages(puaf)
        .copy_region(copy)
        .duplicator(Box::new(SimDuplicator::new(kernel.clone())))
        .progress(progress.clone())
        .build()?;

    let report = session.run()?;

    // Prove the read primitive against the simulated process structure.
    let proc = session
        .current_proc()
        .context("no channel resolved the current proc")?;
    let pid = session.kread_u64(proc + SIM_PROC_PID_OFFSET)?;
    ensure!(
        pid == u64::from(std::process::id()),
        "kread returned pid {} instead of ours",
        pid
    );

    // Prove the write primitive against the scratch slot.
    let scratch = kernel.borrow().scratch();
    session.kwrite_u64(scratch, SCRATCH_PATTERN)?;
    let readback = session.kread_u64(scratch)?;
    ensure!(
        readback == SCRATCH_PATTERN,
        "kwrite did not reach the scratch slot: read back {:#x}",
        readback
    );

    session.release();

    let (created, destroyed, live) = {
        let kernel = kernel.borrow();
        (kernel.created(), kernel.destroyed(), kernel.live_objects())
    };
    ensure!(live == 0, "{} kernel objects leaked after release", live);
    info!(
        "kernel objects: created = {}, destroyed = {}, live = {}",
        created, destroyed, live
    );

    Ok(report)
}

fn main() -> Result<()> {
    let progress = kalias_bin::init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let caps = match &args.caps {
        Some(filepath) => Capabilities::from_jsonfile(filepath)?,
        None => sim_capabilities(),
    };
    info!("capabilities: build {}", caps.build);

    let base_seed = match args.seed {
        Some(seed) => seed,
        None => rand::rng().random(),
    };
    info!("base seed: {:#x}", base_seed);

    let mut results = SessionResults::new(args.clone());

    for attempt in 1..=args.attempts {
        info!("Attempt number {}", attempt);
        let seed = base_seed.wrapping_add(u64::from(attempt));
        let start_time = Instant::now();

        let result = match run_session(&args, &caps, &progress, seed) {
            Ok(report) => {
                let duration = start_time.elapsed();

                if args.verbose {
                    info!(
                        "Attempt {}: Success in {}ms, kread {} id {} at {:#x}, kwrite {} id {} at {:#x}",
                        attempt,
                        duration.as_millis(),
                        report.kread.technique,
                        report.kread.object_id,
                        report.kread.object_uaddr,
                        report.kwrite.technique,
                        report.kwrite.object_id,
                        report.kwrite.object_uaddr,
                    );
                }

                AttemptResult {
                    attempt,
                    success: true,
                    duration_ms: duration.as_millis() as u64,
                    seed,
                    report: Some(report),
                    error: None,
                }
            }
            Err(e) => {
                let duration = start_time.elapsed();
                let error_msg = format!("{:?}", e);
                warn!(
                    "Attempt {}: Failed in {}ms - {}",
                    attempt,
                    duration.as_millis(),
                    error_msg
                );

                AttemptResult {
                    attempt,
                    success: false,
                    duration_ms: duration.as_millis() as u64,
                    seed,
                    report: None,
                    error: Some(error_msg),
                }
            }
        };

        results.add_attempt(result);
    }

    info!("Evaluation completed:");
    info!("  Success rate: {:.2}%", results.success_rate * 100.0);
    info!("  Average duration: {:.2}ms", results.average_duration_ms);
    info!(
        "  Successful attempts: {}/{}",
        results.successful_attempts, results.total_attempts
    );

    // Save results if output file is specified
    if let Some(output_file) = &args.output {
        results.save_to_file(output_file)?;
    }

    Ok(())
}
