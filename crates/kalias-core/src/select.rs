//! Technique selection and validation.
//!
//! Before a session owns any channel state, the requested technique pairing
//! is checked against the capability descriptor: both families must be
//! supported on the build, and families with a sibling requirement must be
//! paired correctly. Everything here is fallible-by-value; a rejected
//! selection leaves nothing to clean up.

use thiserror::Error;

use crate::caps::Capabilities;
use crate::technique::{KreadTechnique, KwriteTechnique, TechniqueError};

/// Errors raised while configuring a session, before any channel state is
/// touched. All of them are recoverable by retrying with different
/// parameters.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("kread technique {0:?} is not supported on kernel build {1}")]
    UnsupportedKreadTechnique(KreadTechnique, String),
    #[error("kwrite technique {0:?} is not supported on kernel build {1}")]
    UnsupportedKwriteTechnique(KwriteTechnique, String),
    #[error("the stamp kwrite drives objects owned by the read channel and requires the stamp kread")]
    UnpairedStamp,
    #[error("kernel build {0} carries no stamp registry layout")]
    NoStampLayout(String),
    #[error("no capabilities specified")]
    NoCapabilities,
    #[error("no kread technique specified")]
    NoKreadTechnique,
    #[error("no kwrite technique specified")]
    NoKwriteTechnique,
    #[error("no puaf pages specified")]
    NoPuafPages,
    #[error("no copy region specified")]
    NoCopyRegion,
    #[error("no region duplicator specified")]
    NoDuplicator,
    #[error("puaf page set is empty")]
    EmptyPuafSet,
    #[error("puaf page address {0:#x} is not page aligned")]
    UnalignedPuafPage(usize),
    #[error("copy region is smaller than one page")]
    ShortCopyRegion,
    #[error("copy source and destination overlap")]
    OverlappingCopyRegion,
    #[error("technique init failed: {0}")]
    TechniqueInit(TechniqueError),
}

/// Whether this pairing shares one dual-capable technique between both
/// channels (the read channel owning the state, the write channel holding a
/// non-owning delegate).
pub fn twin_shared(kread: KreadTechnique, kwrite: KwriteTechnique) -> bool {
    matches!((kread, kwrite), (KreadTechnique::Stamp, KwriteTechnique::Stamp))
}

/// Validates a requested technique pairing against `caps`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if either family is unsupported on the build,
/// if the stamp family is requested for the write channel without its
/// read-channel sibling, or if the stamp family is requested on a build
/// whose descriptor carries no registry layout.
pub fn validate(
    kread: KreadTechnique,
    kwrite: KwriteTechnique,
    caps: &Capabilities,
) -> Result<(), ConfigError> {
    if !caps.supports_kread(kread) {
        return Err(ConfigError::UnsupportedKreadTechnique(
            kread,
            caps.build.clone(),
        ));
    }
    if !caps.supports_kwrite(kwrite) {
        return Err(ConfigError::UnsupportedKwriteTechnique(
            kwrite,
            caps.build.clone(),
        ));
    }
    if kwrite == KwriteTechnique::Stamp && kread != KreadTechnique::Stamp {
        return Err(ConfigError::UnpairedStamp);
    }
    let wants_stamp = kread == KreadTechnique::Stamp || kwrite == KwriteTechnique::Stamp;
    if wants_stamp && caps.stamp.is_none() {
        return Err(ConfigError::NoStampLayout(caps.build.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::StampLayout;

    fn caps_with_everything() -> Capabilities {
        Capabilities {
            build: "test".to_string(),
            kread: vec![KreadTechnique::Dummy, KreadTechnique::Stamp],
            kwrite: vec![KwriteTechnique::Dummy, KwriteTechnique::Stamp],
            stamp: Some(StampLayout {
                object_size: 512,
                magic: 0x4711,
                instance_offset: 8,
                slot_ptr_offset: 16,
                owner_proc_offset: 24,
                slot_count: 4,
                maximum_id: 64,
            }),
        }
    }

    #[test]
    fn accepts_supported_pairings() {
        let caps = caps_with_everything();
        validate(KreadTechnique::Dummy, KwriteTechnique::Dummy, &caps).unwrap();
        validate(KreadTechnique::Stamp, KwriteTechnique::Stamp, &caps).unwrap();
        validate(KreadTechnique::Stamp, KwriteTechnique::Dummy, &caps).unwrap();
    }

    #[test]
    fn rejects_unsupported_families() {
        let mut caps = caps_with_everything();
        caps.kread = vec![KreadTechnique::Stamp];
        assert!(matches!(
            validate(KreadTechnique::Dummy, KwriteTechnique::Dummy, &caps),
            Err(ConfigError::UnsupportedKreadTechnique(KreadTechnique::Dummy, _))
        ));
        caps.kwrite = vec![];
        assert!(matches!(
            validate(KreadTechnique::Stamp, KwriteTechnique::Stamp, &caps),
            Err(ConfigError::UnsupportedKwriteTechnique(KwriteTechnique::Stamp, _))
        ));
    }

    #[test]
    fn stamp_kwrite_requires_stamp_kread() {
        let caps = caps_with_everything();
        assert!(matches!(
            validate(KreadTechnique::Dummy, KwriteTechnique::Stamp, &caps),
            Err(ConfigError::UnpairedStamp)
        ));
    }

    #[test]
    fn stamp_needs_a_registry_layout() {
        let mut caps = caps_with_everything();
        caps.stamp = None;
        assert!(matches!(
            validate(KreadTechnique::Stamp, KwriteTechnique::Stamp, &caps),
            Err(ConfigError::NoStampLayout(_))
        ));
        validate(KreadTechnique::Dummy, KwriteTechnique::Dummy, &caps).unwrap();
    }

    #[test]
    fn twin_sharing_only_for_double_stamp() {
        assert!(twin_shared(KreadTechnique::Stamp, KwriteTechnique::Stamp));
        assert!(!twin_shared(KreadTechnique::Dummy, KwriteTechnique::Stamp));
        assert!(!twin_shared(KreadTechnique::Stamp, KwriteTechnique::Dummy));
    }
}
