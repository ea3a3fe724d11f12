//! ST `STM32_Programmer_CLI`, for ST-LINK (JTAG/SWD) probes and USB DFU
//!
//! Output markers:
//!
//! - write: `File download complete`
//! - mass erase: `Mass erase successfully achieved`
//! - reset over SWD: `reset is performed`
//! - start over DFU: `Start operation achieved successfully`
//!
//! Probe listing prints `ST-LINK SN  : <serial>` for every ST-LINK and
//! `Device Index : USB<n>` for every device in DFU mode.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;

use super::{Invocation, ToolOutcome, ToolOutput, ToolRunner};
use crate::{
    error::{Error, Transport},
    session::FlashTransport,
    targets::STM32_FLASH_START,
};

const WRITE_MARKER: &str = "File download complete";
const ERASE_MARKER: &str = "Mass erase successfully achieved";
const RESET_MARKER: &str = "reset is performed";
const START_MARKER: &str = "Start operation achieved successfully";

static RE_STLINK_SN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ST-LINK SN\s*:\s*([0-9A-Fa-f]+)").unwrap());
static RE_DFU_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Device Index\s*:\s*(USB\d+)").unwrap());

/// How the programmer reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stm32Link {
    /// ST-LINK probe over SWD
    Swd,
    /// Built-in USB DFU bootloader
    Dfu,
}

pub struct Stm32Programmer<R> {
    runner: R,
    program: PathBuf,
    link: Stm32Link,
}

impl<R: ToolRunner> Stm32Programmer<R> {
    pub fn new(runner: R, program: impl Into<PathBuf>, link: Stm32Link) -> Self {
        Self {
            runner,
            program: program.into(),
            link,
        }
    }

    fn run(&self, args: Vec<String>) -> Result<ToolOutput, Error> {
        self.runner
            .run(&Invocation::new(&self.program, args))
            .map_err(|source| Error::ToolLaunch {
                transport: self.transport(),
                program: self.program.display().to_string(),
                source,
            })
    }

    fn connect_args(&self, device: &str) -> Vec<String> {
        let port = match self.link {
            Stm32Link::Swd => format!("port=SWD sn={device}"),
            Stm32Link::Dfu => format!("port={device}"),
        };

        let mut args = vec!["-c".to_owned()];
        args.extend(port.split(' ').map(ToOwned::to_owned));
        args
    }
}

impl<R: ToolRunner> FlashTransport for Stm32Programmer<R> {
    fn transport(&self) -> Transport {
        match self.link {
            Stm32Link::Swd => Transport::Jtag,
            Stm32Link::Dfu => Transport::Dfu,
        }
    }

    fn list_devices(&self) -> Result<Vec<String>, Error> {
        let which = match self.link {
            Stm32Link::Swd => "st-link",
            Stm32Link::Dfu => "usb",
        };
        let output = self.run(vec!["--list".to_owned(), which.to_owned()])?;

        Ok(match self.link {
            Stm32Link::Swd => parse_stlink_serials(&output.text),
            Stm32Link::Dfu => parse_dfu_devices(&output.text),
        })
    }

    fn mass_erase(&self, device: &str) -> Result<ToolOutcome, Error> {
        let mut args = self.connect_args(device);
        args.extend(["-e".to_owned(), "all".to_owned()]);

        Ok(classify(&self.run(args)?, ERASE_MARKER))
    }

    /// HEX files carry their own addresses, binary files are written at
    /// `address`
    fn write(&self, device: &str, address: u32, file: &Path) -> Result<ToolOutcome, Error> {
        let mut args = self.connect_args(device);
        args.extend(["-w".to_owned(), file.display().to_string()]);

        let is_binary = file
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("bin"));
        if is_binary {
            args.push(format!("{address:#010x}"));
        }

        if self.link == Stm32Link::Swd {
            args.push("-v".to_owned());
        }

        Ok(classify(&self.run(args)?, WRITE_MARKER))
    }

    fn reset(&self, device: &str) -> Result<ToolOutcome, Error> {
        let mut args = self.connect_args(device);

        let marker = match self.link {
            Stm32Link::Swd => {
                args.push("-rst".to_owned());
                RESET_MARKER
            }
            Stm32Link::Dfu => {
                args.extend(["-s".to_owned(), format!("{STM32_FLASH_START:#010x}")]);
                START_MARKER
            }
        };

        Ok(classify(&self.run(args)?, marker))
    }
}

fn classify(output: &ToolOutput, marker: &str) -> ToolOutcome {
    if output.contains(marker) {
        ToolOutcome::Success
    } else {
        ToolOutcome::Failure(output.failure_summary())
    }
}

pub fn parse_stlink_serials(output: &str) -> Vec<String> {
    RE_STLINK_SN
        .captures_iter(output)
        .map(|c| c[1].to_owned())
        .collect()
}

pub fn parse_dfu_devices(output: &str) -> Vec<String> {
    RE_DFU_INDEX
        .captures_iter(output)
        .map(|c| c[1].to_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    const STLINK_LIST: &str = "
      -------------------------------------------------------------------
                        STM32CubeProgrammer v2.16.0
      -------------------------------------------------------------------

=====  STLink Interface  =====

-------- Connected ST-LINK Probes List --------

ST-Link Probe 0 :
   ST-LINK SN  : 066CFF535752877167012515
   ST-LINK FW  : V2J40M27
   Access Port Number  : 1
-----------------------------------------------

ST-Link Probe 1 :
   ST-LINK SN  : 0670FF495150898667134337
   ST-LINK FW  : V2J37M27
-----------------------------------------------
";

    const DFU_LIST: &str = "
=====  DFU Interface   =====

Total number of available STM32 device in DFU mode: 1

  Device Index           : USB1
  USB Bus Number         : 001
  USB Address Number     : 012
  Product ID             : DFU in FS Mode
  Serial number          : 3574364C3034
";

    struct ScriptedRunner {
        outputs: RefCell<Vec<ToolOutput>>,
        invocations: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: &[&str]) -> Self {
            Self {
                outputs: RefCell::new(outputs.iter().rev().map(|o| ToolOutput::new(0, *o)).collect()),
                invocations: RefCell::new(Vec::new()),
            }
        }
    }

    impl ToolRunner for ScriptedRunner {
        fn run(&self, invocation: &Invocation) -> std::io::Result<ToolOutput> {
            self.invocations.borrow_mut().push(invocation.args.clone());
            Ok(self.outputs.borrow_mut().pop().unwrap_or_default())
        }
    }

    #[test]
    fn lists_stlink_probes() {
        assert_eq!(
            parse_stlink_serials(STLINK_LIST),
            vec!["066CFF535752877167012515", "0670FF495150898667134337"]
        );
        assert_eq!(parse_dfu_devices(DFU_LIST), vec!["USB1"]);
        assert!(parse_stlink_serials(DFU_LIST).is_empty());
    }

    #[test]
    fn binary_files_get_an_address() {
        let runner = ScriptedRunner::new(&["File download complete", "File download complete"]);
        let programmer = Stm32Programmer::new(&runner, "STM32_Programmer_CLI", Stm32Link::Swd);

        programmer
            .write("066CFF535752877167012515", 0x0808_0000, Path::new("app.bin"))
            .unwrap();
        programmer
            .write("066CFF535752877167012515", 0x0800_0000, Path::new("nanoBooter.hex"))
            .unwrap();

        let invocations = runner.invocations.borrow();
        assert_eq!(
            invocations[0],
            vec![
                "-c",
                "port=SWD",
                "sn=066CFF535752877167012515",
                "-w",
                "app.bin",
                "0x08080000",
                "-v"
            ]
        );
        assert!(!invocations[1].contains(&"0x08000000".to_owned()));
    }

    #[test]
    fn missing_marker_is_failure() {
        let runner = ScriptedRunner::new(&["Error: No STM32 target found!"]);
        let programmer = Stm32Programmer::new(&runner, "STM32_Programmer_CLI", Stm32Link::Dfu);

        let outcome = programmer
            .write("USB1", 0x0800_0000, Path::new("nanoCLR.hex"))
            .unwrap();
        assert_eq!(
            outcome,
            ToolOutcome::Failure("Error: No STM32 target found!".into())
        );
        assert_eq!(programmer.transport(), Transport::Dfu);
    }
}
