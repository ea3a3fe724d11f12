//! TI UniFlash command line (`DSLite`) with XDS110 probes
//!
//! DSLite is driven by a target configuration (`.ccxml`) file describing
//! the MCU and the probe. Output markers:
//!
//! - write: `Program verification successful`
//! - mass erase: `Erasing Flash`... followed by `Success`
//! - reset: `Running...`
//!
//! Probes are enumerated with `xdsdfu -e`, which prints
//! `Serial Num:   <serial>` for each connected XDS110.
//!
//! DSLite has no command line switch selecting an XDS110. It is picked in
//! the configuration instead, so every operation runs with a scratch copy
//! of the configuration selecting the XDS110 by its serial number.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use log::warn;
use regex::{NoExpand, Regex};

use super::{jlink::ShadowFile, Invocation, ToolOutcome, ToolOutput, ToolRunner};
use crate::{
    error::{Error, Transport},
    session::FlashTransport,
};

const WRITE_MARKER: &str = "Program verification successful";
const ERASE_MARKER: &str = "Success";
const RESET_MARKER: &str = "Running...";

/// Choice of the `Debug Probe Selection` property selecting by serial number
const SELECT_BY_SERIAL: &str = "1";

static RE_XDS_SERIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Serial Num:\s*(\w+)").unwrap());
static RE_SERIAL_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<property\b[^>]*\bid="-- Enter the serial number"[^>]*>"#).unwrap()
});
static RE_SELECTION_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<property\b[^>]*\bid="Debug Probe Selection"[^>]*>"#).unwrap()
});
static RE_VALUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"\bValue="[^"]*""#).unwrap());

pub struct Uniflash<R> {
    runner: R,
    dslite: PathBuf,
    xdsdfu: PathBuf,
    config: PathBuf,
    scratch: PathBuf,
}

impl<R: ToolRunner> Uniflash<R> {
    /// `scratch` holds the per device copies of `config`
    pub fn new(
        runner: R,
        dslite: impl Into<PathBuf>,
        xdsdfu: impl Into<PathBuf>,
        config: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            dslite: dslite.into(),
            xdsdfu: xdsdfu.into(),
            config: config.into(),
            scratch: scratch.into(),
        }
    }

    fn run(&self, program: &Path, args: Vec<String>) -> Result<ToolOutput, Error> {
        self.runner
            .run(&Invocation::new(program, args))
            .map_err(|source| Error::ToolLaunch {
                transport: Transport::Xds110,
                program: program.display().to_string(),
                source,
            })
    }

    /// Configuration selecting the XDS110 with serial `device`, `None` when
    /// the configuration can be used as is
    fn device_config(&self, device: &str) -> Result<Option<ShadowFile>, Error> {
        if device.is_empty() {
            return Ok(None);
        }

        let ccxml = fs::read_to_string(&self.config)?;
        let Some(selected) = select_by_serial(&ccxml, device) else {
            warn!(
                "{} can't select an XDS110 by serial number, DSLite uses the first one it finds",
                self.config.display()
            );
            return Ok(None);
        };

        fs::create_dir_all(&self.scratch)?;
        let file = ShadowFile::scratch(&self.scratch, "uniflash", "ccxml");
        fs::write(file.path(), selected)?;

        Ok(Some(file))
    }

    fn flash(&self, device: &str, extra: &[String]) -> Result<ToolOutput, Error> {
        let selected = self.device_config(device)?;
        let config = selected
            .as_ref()
            .map_or(self.config.as_path(), |file| file.path());

        let mut args = vec!["flash".to_owned(), format!("--config={}", config.display())];
        args.extend_from_slice(extra);

        self.run(&self.dslite, args)
    }
}

impl<R: ToolRunner> FlashTransport for Uniflash<R> {
    fn transport(&self) -> Transport {
        Transport::Xds110
    }

    fn list_devices(&self) -> Result<Vec<String>, Error> {
        let output = self.run(&self.xdsdfu, vec!["-e".to_owned()])?;
        Ok(parse_probes(&output.text))
    }

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.flash(device, &["--erase".to_owned()])?;

        Ok(if output.contains("Erasing Flash") && output.contains(ERASE_MARKER) {
            ToolOutcome::Success
        } else {
            ToolOutcome::Failure(output.failure_summary())
        })
    }

    /// Only HEX images are accepted, their load address comes from the file
    fn write(&self, device: &str, _address: u32, file: &Path) -> Result<ToolOutcome, Error> {
        let output = self.flash(device, &[
            "--flash".to_owned(),
            "--verify".to_owned(),
            file.display().to_string(),
        ])?;

        Ok(if output.contains(WRITE_MARKER) {
            ToolOutcome::Success
        } else {
            ToolOutcome::Failure(output.failure_summary())
        })
    }

    fn reset(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.flash(device, &["--run".to_owned()])?;

        Ok(if output.contains(RESET_MARKER) {
            ToolOutcome::Success
        } else {
            ToolOutcome::SuccessWithWarning(
                "The device could not be started, press its RESET button".into(),
            )
        })
    }
}

pub fn parse_probes(output: &str) -> Vec<String> {
    RE_XDS_SERIAL
        .captures_iter(output)
        .map(|c| c[1].to_owned())
        .collect()
}

/// Set the value of the first property tag matched by `property`
fn set_property(ccxml: &str, property: &Regex, value: &str) -> Option<String> {
    let tag = property.find(ccxml)?;
    let updated = RE_VALUE.replace(tag.as_str(), NoExpand(&format!(r#"Value="{value}""#)));

    Some(format!(
        "{}{updated}{}",
        &ccxml[..tag.start()],
        &ccxml[tag.end()..]
    ))
}

/// Target configuration `ccxml` changed to use the XDS110 with `serial`
pub fn select_by_serial(ccxml: &str, serial: &str) -> Option<String> {
    let ccxml = set_property(ccxml, &RE_SERIAL_PROPERTY, serial)?;
    set_property(&ccxml, &RE_SELECTION_PROPERTY, SELECT_BY_SERIAL)
}
