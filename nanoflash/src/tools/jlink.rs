//! SEGGER J-Link Commander (`JLinkExe`)
//!
//! Commands are passed through a command file. Output markers:
//!
//! - write: `O.K.` after the last `Flash download` line, or
//!   `Contents already match`
//! - mass erase: `Erasing done`
//! - reset: `Reset type`
//!
//! Probe listing (`ShowEmuList`) prints
//! `J-Link[0]: Connection: USB, Serial number: <serial>, ...` per probe.
//!
//! J-Link can't open files whose path contains spaces or non-ASCII
//! characters. Such files are copied to a [ShadowFile] first.

use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicUsize, Ordering},
        LazyLock,
    },
};

use log::debug;
use regex::Regex;

use super::{is_tool_safe_path, Invocation, ToolOutcome, ToolOutput, ToolRunner};
use crate::{
    error::{Error, Transport},
    session::FlashTransport,
};

const ERASE_MARKER: &str = "Erasing done";
const RESET_MARKER: &str = "Reset type";
const ALREADY_MATCH: &str = "Contents already match";

pub const DEFAULT_SPEED_KHZ: u32 = 4000;

static RE_EMU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"J-Link\[\d+\]:.*Serial number:\s*(\d+)").unwrap());

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn scratch_name(prefix: &str, extension: &str) -> String {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}.{extension}", process::id())
}

/// Scratch file handed to J-Link, deleted on drop
#[derive(Debug)]
pub struct ShadowFile {
    path: PathBuf,
}

impl ShadowFile {
    /// Fresh scratch file name in `scratch`, nothing is written yet
    pub(super) fn scratch(scratch: &Path, prefix: &str, extension: &str) -> Self {
        Self {
            path: scratch.join(scratch_name(prefix, extension)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShadowFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {e}", self.path.display());
        }
    }
}

/// Path of `file` as handed to J-Link: the file itself when its path is
/// safe, otherwise a shadow copy in `scratch`
pub fn tool_path(file: &Path, scratch: &Path) -> Result<(PathBuf, Option<ShadowFile>), Error> {
    if is_tool_safe_path(file) {
        return Ok((file.to_owned(), None));
    }

    if !is_tool_safe_path(scratch) {
        return Err(Error::UnsupportedPath(file.to_owned()));
    }

    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.is_ascii())
        .unwrap_or("bin");
    let shadow = ShadowFile {
        path: scratch.join(scratch_name("shadow", extension)),
    };

    fs::create_dir_all(scratch)?;
    fs::copy(file, shadow.path())?;
    debug!("Using {} for {}", shadow.path().display(), file.display());

    Ok((shadow.path().to_owned(), Some(shadow)))
}

pub struct JLink<R> {
    runner: R,
    program: PathBuf,
    /// J-Link device name of the target MCU, e.g. `EFM32GG11B820F2048`
    device: String,
    speed_khz: u32,
    scratch: PathBuf,
}

impl<R: ToolRunner> JLink<R> {
    /// `scratch` holds command files and shadow copies
    pub fn new(
        runner: R,
        program: impl Into<PathBuf>,
        device: impl Into<String>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            device: device.into(),
            speed_khz: DEFAULT_SPEED_KHZ,
            scratch: scratch.into(),
        }
    }

    /// Run a command file, connected to the target through the probe with
    /// serial `probe`
    fn run_script(&self, probe: Option<&str>, commands: &[String]) -> Result<ToolOutput, Error> {
        if !is_tool_safe_path(&self.scratch) {
            return Err(Error::UnsupportedPath(self.scratch.clone()));
        }

        fs::create_dir_all(&self.scratch)?;
        let script = ShadowFile {
            path: self.scratch.join(scratch_name("jlink", "jlink")),
        };

        let mut contents = commands.join("\n");
        contents.push_str("\nq\n");
        fs::write(script.path(), contents)?;

        // without a probe only the host side commands are usable
        let mut args = Vec::new();
        if let Some(probe) = probe {
            args.extend([
                "-Device".to_owned(),
                self.device.clone(),
                "-If".to_owned(),
                "SWD".to_owned(),
                "-Speed".to_owned(),
                self.speed_khz.to_string(),
                "-AutoConnect".to_owned(),
                "1".to_owned(),
                "-ExitOnError".to_owned(),
                "1".to_owned(),
                "-SelectEmuBySN".to_owned(),
                probe.to_owned(),
            ]);
        }
        args.extend(["-CommandFile".to_owned(), script.path().display().to_string()]);

        self.runner
            .run(&Invocation::new(&self.program, args))
            .map_err(|source| Error::ToolLaunch {
                transport: Transport::JLink,
                program: self.program.display().to_string(),
                source,
            })
    }
}

impl<R: ToolRunner> FlashTransport for JLink<R> {
    fn transport(&self) -> Transport {
        Transport::JLink
    }

    fn list_devices(&self) -> Result<Vec<String>, Error> {
        let output = self.run_script(None, &["ShowEmuList".to_owned()])?;
        Ok(parse_emulators(&output.text))
    }

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.run_script(Some(device), &["erase".to_owned()])?;
        Ok(classify_marker(&output, ERASE_MARKER))
    }

    fn write(&self, device: &str, address: u32, file: &Path) -> Result<ToolOutcome, Error> {
        let (path, _shadow) = tool_path(file, &self.scratch)?;

        let is_binary = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("bin"));
        let load = if is_binary {
            format!("loadfile {} {address:#010x}", path.display())
        } else {
            format!("loadfile {}", path.display())
        };

        let output = self.run_script(Some(device), &["h".to_owned(), load])?;
        Ok(classify_write(&output))
    }

    fn reset(&self, device: &str) -> Result<ToolOutcome, Error> {
        let output = self.run_script(Some(device), &["r".to_owned(), "g".to_owned()])?;
        Ok(classify_marker(&output, RESET_MARKER))
    }
}

fn classify_marker(output: &ToolOutput, marker: &str) -> ToolOutcome {
    if output.contains(marker) {
        ToolOutcome::Success
    } else {
        ToolOutcome::Failure(output.failure_summary())
    }
}

pub fn classify_write(output: &ToolOutput) -> ToolOutcome {
    let verified = output
        .text
        .rfind("Flash download")
        .is_some_and(|at| output.text[at..].contains("O.K."));

    if verified || output.contains(ALREADY_MATCH) {
        ToolOutcome::Success
    } else {
        ToolOutcome::Failure(output.failure_summary())
    }
}

pub fn parse_emulators(output: &str) -> Vec<String> {
    RE_EMU
        .captures_iter(output)
        .map(|c| c[1].to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_emulator_list() {
        let output = "\
SEGGER J-Link Commander V7.94e (Compiled Jan 15 2024 15:17:14)
J-Link[0]: Connection: USB, Serial number: 440045632, ProductName: J-Link OB-SAM3U128-V2
J-Link[1]: Connection: USB, Serial number: 440112233, ProductName: J-Link EDU
";
        assert_eq!(parse_emulators(output), vec!["440045632", "440112233"]);
    }

    #[test]
    fn write_needs_ok_after_download() {
        let ok = ToolOutput::new(
            0,
            "Downloading file [nanoCLR.hex]...\nJ-Link: Flash download: Bank 0 @ 0x00000000: 1 range affected (131072 bytes)\nJ-Link: Flash download: Program & Verify speed: 95 KiB/s\nO.K.\n",
        );
        assert_eq!(classify_write(&ok), ToolOutcome::Success);

        let failed = ToolOutput::new(
            0,
            "O.K.\nDownloading file [nanoCLR.hex]...\nJ-Link: Flash download: Bank 0 @ 0x00000000\nError while programming flash: Programming failed.\n",
        );
        assert!(matches!(classify_write(&failed), ToolOutcome::Failure(_)));
    }

    #[test]
    fn shadow_file_for_unsafe_path() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");

        let unsafe_dir = dir.path().join("My Firmware");
        fs::create_dir_all(&unsafe_dir).unwrap();
        let file = unsafe_dir.join("nanoCLR.hex");
        fs::write(&file, b":00000001FF\n").unwrap();

        let shadow_path = {
            let (path, shadow) = tool_path(&file, &scratch).unwrap();
            assert!(shadow.is_some());
            assert!(is_tool_safe_path(&path));
            assert_eq!(fs::read(&path).unwrap(), b":00000001FF\n");
            path
        };

        assert!(!shadow_path.exists());
    }

    #[test]
    fn safe_path_is_used_directly() {
        let (path, shadow) =
            tool_path(Path::new("/tmp/nanoCLR.hex"), Path::new("/tmp/scratch")).unwrap();
        assert_eq!(path, Path::new("/tmp/nanoCLR.hex"));
        assert!(shadow.is_none());
    }
}
