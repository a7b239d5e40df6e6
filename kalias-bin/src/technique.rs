//! Technique selection for the command line.
//!
//! This module resolves technique family names into boxed technique objects
//! wired to the simulated kernel. To add a new technique, implement the
//! `Technique` trait for it and extend the two parse functions and
//! `build_techniques` with a new arm.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use kalias_core::select::twin_shared;
use kalias_core::{Capabilities, KreadTechnique, KwriteTechnique, StampLayout, Technique};
use kalias_dummy::DummyTechnique;
use kalias_sim::{SimHandle, SimStampPort};
use kalias_stamp::{StampPort, StampTechnique};

/// Parses a read-channel technique name as given on the command line.
pub fn parse_kread(name: &str) -> Result<KreadTechnique> {
    match name {
        "dummy" => Ok(KreadTechnique::Dummy),
        "stamp" => Ok(KreadTechnique::Stamp),
        _ => bail!("unknown kread technique: {name}"),
    }
}

/// Parses a write-channel technique name as given on the command line.
pub fn parse_kwrite(name: &str) -> Result<KwriteTechnique> {
    match name {
        "dummy" => Ok(KwriteTechnique::Dummy),
        "stamp" => Ok(KwriteTechnique::Stamp),
        _ => bail!("unknown kwrite technique: {name}"),
    }
}

/// Builds the technique objects for both channels against the simulated
/// kernel.
///
/// When both channels pick the stamp family the pair shares one port and one
/// spray: the read channel owns every registry and the write channel drives
/// the owner's confirmed object.
pub fn build_techniques(
    kernel: &SimHandle,
    caps: &Capabilities,
    kread: KreadTechnique,
    kwrite: KwriteTechnique,
) -> Result<(Box<dyn Technique>, Box<dyn Technique>)> {
    if twin_shared(kread, kwrite) {
        info!("stamp twin pair: one spray serves both channels");
        let port: Rc<RefCell<dyn StampPort>> =
            Rc::new(RefCell::new(SimStampPort::new(kernel.clone())));
        let (owner, delegate) = StampTechnique::twin_pair(port, stamp_layout(caps)?);
        return Ok((Box::new(owner), Box::new(delegate)));
    }
    let kread: Box<dyn Technique> = match kread {
        KreadTechnique::Dummy => Box::new(DummyTechnique::kread(kernel.clone())),
        KreadTechnique::Stamp => Box::new(StampTechnique::solo(
            Rc::new(RefCell::new(SimStampPort::new(kernel.clone()))),
            stamp_layout(caps)?,
        )),
    };
    let kwrite: Box<dyn Technique> = match kwrite {
        KwriteTechnique::Dummy => Box::new(DummyTechnique::kwrite(kernel.clone())),
        KwriteTechnique::Stamp => Box::new(StampTechnique::solo(
            Rc::new(RefCell::new(SimStampPort::new(kernel.clone()))),
            stamp_layout(caps)?,
        )),
    };
    Ok((kread, kwrite))
}

fn stamp_layout(caps: &Capabilities) -> Result<StampLayout> {
    caps.stamp
        .clone()
        .with_context(|| format!("build {} carries no stamp registry layout", caps.build))
}
