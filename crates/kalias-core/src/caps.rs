//! Per-kernel-build capability descriptors.
//!
//! Which technique families work, and where the fields of their kernel
//! objects live, depends on the kernel build. Instead of a process-global
//! table, the engine takes an explicit [`Capabilities`] value: look one up
//! with [`Capabilities::for_build`], load one from JSON, or construct one by
//! hand (the simulated kernel ships its own).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::technique::{KreadTechnique, KwriteTechnique};

/// Build-dependent layout of the stamp registry object family.
///
/// Offsets are relative to the start of the object as it appears inside a
/// PUAF page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampLayout {
    /// Total object size in bytes.
    pub object_size: usize,
    /// Constant header word identifying a registry object.
    pub magic: u64,
    /// Offset of the 32-bit registry instance id.
    pub instance_offset: usize,
    /// Offset of the pointer to the object's stamp slot array.
    pub slot_ptr_offset: usize,
    /// Offset of the pointer to the owning process structure.
    pub owner_proc_offset: usize,
    /// Number of stamp slots per object.
    pub slot_count: u32,
    /// System-wide ceiling on live registry objects.
    pub maximum_id: u64,
}

/// Errors that can occur when loading a capability descriptor.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Result type for capability loading.
pub type Result<T> = std::result::Result<T, Error>;

/// What a given kernel build supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Kernel build identifier, e.g. `23F79`.
    pub build: String,
    /// Technique families usable on the read channel.
    pub kread: Vec<KreadTechnique>,
    /// Technique families usable on the write channel.
    pub kwrite: Vec<KwriteTechnique>,
    /// Stamp registry layout, when the family is usable on this build.
    pub stamp: Option<StampLayout>,
}

impl Capabilities {
    /// Looks up the built-in descriptor for `build`.
    pub fn for_build(build: &str) -> Option<Capabilities> {
        BUILTIN.iter().find(|caps| caps.build == build).cloned()
    }

    /// Loads a descriptor from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_jsonfile(filepath: &str) -> Result<Capabilities> {
        let mut file = File::open(Path::new(filepath))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let caps: Capabilities = serde_json::from_str(&contents)?;
        Ok(caps)
    }

    /// Whether `technique` is usable on the read channel of this build.
    pub fn supports_kread(&self, technique: KreadTechnique) -> bool {
        self.kread.contains(&technique)
    }

    /// Whether `technique` is usable on the write channel of this build.
    pub fn supports_kwrite(&self, technique: KwriteTechnique) -> bool {
        self.kwrite.contains(&technique)
    }
}

lazy_static! {
    static ref BUILTIN: Vec<Capabilities> = vec![
        Capabilities {
            build: "23F79".to_string(),
            kread: vec![KreadTechnique::Stamp],
            kwrite: vec![KwriteTechnique::Stamp],
            stamp: Some(StampLayout {
                object_size: 0x400,
                magic: u64::from_le_bytes(*b"STMPREGY"),
                instance_offset: 0x8,
                slot_ptr_offset: 0x10,
                owner_proc_offset: 0x18,
                slot_count: 60,
                maximum_id: 4096,
            }),
        },
        // Registry object layout changed in 22E; until the new offsets are
        // recovered the stamp family stays off this build.
        Capabilities {
            build: "22E252".to_string(),
            kread: vec![],
            kwrite: vec![],
            stamp: None,
        },
    ];
}
