use std::{cell::RefCell, fs, io, path::Path};

use nanoflash::{
    flash_plan::{self, FlashPartitionMap},
    progress::DefaultProgressCallback,
    session::{DeviceSession, SessionOptions, SessionState},
    targets::{Platform, TargetIdentity},
    tools::{
        stm32::{Stm32Link, Stm32Programmer},
        Invocation, ToolOutput, ToolRunner,
    },
    Error, ExitCode,
};
use pretty_assertions::assert_eq;

const STLINK_LIST: &str = "
-------- Connected ST-LINK Probes List --------

ST-Link Probe 0 :
   ST-LINK SN  : 0670FF495150898667134337
   ST-LINK FW  : V2J37M27
-----------------------------------------------
";

/// Runner answering every invocation with the next scripted output
struct ScriptedRunner {
    outputs: RefCell<Vec<String>>,
    invocations: RefCell<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    fn new(outputs: &[&str]) -> Self {
        Self {
            outputs: RefCell::new(outputs.iter().rev().map(|o| o.to_string()).collect()),
            invocations: RefCell::new(Vec::new()),
        }
    }

    fn invocations(&self) -> Vec<Vec<String>> {
        self.invocations.borrow().clone()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ToolOutput> {
        self.invocations.borrow_mut().push(invocation.args.clone());

        let text = self.outputs.borrow_mut().pop().unwrap_or_default();
        Ok(ToolOutput::new(0, text))
    }
}

fn touch(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"").unwrap();
    path
}

#[test]
fn application_deploy_has_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let app = touch(dir.path(), "app.bin");

    let map = flash_plan::application_only(&["0x1B000"], &[&app]).unwrap();

    assert_eq!(map.len(), 1);
    assert_eq!(map.get(0x1B000), Some(std::path::absolute(&app).unwrap().as_path()));
}

#[test]
fn address_count_must_match_file_count() {
    let dir = tempfile::tempdir().unwrap();
    let files = [touch(dir.path(), "a.bin"), touch(dir.path(), "b.bin")];

    let err = flash_plan::application_only(&["0x1B000"], &files).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::E5009);
}

#[test]
fn malformed_address_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = touch(dir.path(), "app.bin");

    let err = flash_plan::application_only(&["1B000"], &[&app]).unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}

#[test]
fn single_image_takes_the_target_default() {
    let dir = tempfile::tempdir().unwrap();
    let app = touch(dir.path(), "app.bin");
    let target = TargetIdentity::new("ST_NUCLEO64_F091RC", Platform::Stm32);

    let map = flash_plan::deployment(Some(&target), &[] as &[&str], &[&app]).unwrap();
    assert_eq!(map.iter().map(|(a, _)| a).collect::<Vec<_>>(), vec![0x0801_0000]);

    let map = flash_plan::deployment(Some(&target), &["0x08020000"], &[&app]).unwrap();
    assert!(map.get(0x0802_0000).is_some());

    let err = flash_plan::deployment(None, &[] as &[&str], &[&app]).unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::E5009);
}

#[test]
fn unknown_probe_is_never_flashed() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = FlashPartitionMap::new();
    map.insert(0x0808_0000, touch(dir.path(), "app.bin")).unwrap();

    let runner = ScriptedRunner::new(&[STLINK_LIST]);
    let programmer = Stm32Programmer::new(&runner, "STM32_Programmer_CLI", Stm32Link::Swd);

    let mut session = DeviceSession::new(
        programmer,
        SessionOptions {
            device_id: Some("066CFF535752877167012515".into()),
            ..Default::default()
        },
    );

    let err = session
        .flash(&map, &mut DefaultProgressCallback)
        .unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::E5002);
    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(runner.invocations(), vec![vec!["--list", "st-link"]]);
}

#[test]
fn stm32_update_writes_every_image() {
    let dir = tempfile::tempdir().unwrap();
    let target = TargetIdentity::new("ST_STM32F769I_DISCOVERY", Platform::Stm32);
    let app = touch(dir.path(), "app.bin");

    let mut map = FlashPartitionMap::new();
    map.insert(0x0800_0000, touch(dir.path(), "nanoBooter.hex"))
        .unwrap();
    map.insert(0x0800_8000, touch(dir.path(), "nanoCLR.hex"))
        .unwrap();
    flash_plan::with_application(&mut map, &target, None, &app).unwrap();

    let runner = ScriptedRunner::new(&[
        STLINK_LIST,
        "Mass erase successfully achieved",
        "File download complete",
        "File download complete",
        "File download complete",
        "MCU Reset\nSoftware reset is performed",
    ]);
    let programmer = Stm32Programmer::new(&runner, "STM32_Programmer_CLI", Stm32Link::Swd);

    let mut session = DeviceSession::new(
        programmer,
        SessionOptions {
            device_id: None,
            mass_erase: true,
            reset: true,
        },
    );
    session.flash(&map, &mut DefaultProgressCallback).unwrap();

    assert_eq!(session.state(), SessionState::Done);
    assert_eq!(session.device(), Some("0670FF495150898667134337"));

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 6);
    assert!(invocations[1].contains(&"all".to_owned()));
    assert!(invocations[4].contains(&"0x08080000".to_owned()));
    assert!(invocations[5].contains(&"-rst".to_owned()));
}

#[test]
fn failed_write_stops_the_session() {
    let dir = tempfile::tempdir().unwrap();

    let mut map = FlashPartitionMap::new();
    map.insert(0x0800_0000, touch(dir.path(), "nanoBooter.hex"))
        .unwrap();
    map.insert(0x0800_8000, touch(dir.path(), "nanoCLR.hex"))
        .unwrap();

    let runner = ScriptedRunner::new(&[STLINK_LIST, "Error: failed to download Segment[0]"]);
    let programmer = Stm32Programmer::new(&runner, "STM32_Programmer_CLI", Stm32Link::Swd);

    let mut session = DeviceSession::new(programmer, SessionOptions::default());
    let err = session
        .flash(&map, &mut DefaultProgressCallback)
        .unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::E5004);
    assert_eq!(runner.invocations().len(), 2);
}

#[test]
fn broken_partition_table_skips_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("partitions_nanoclr_4mb.csv");
    fs::write(&csv, "nvs, data, nvs, not-an-offset, 0x6000,\n").unwrap();

    let backup = flash_plan::plan_config_backup(Some(&csv), dir.path(), false, false);
    assert!(backup.is_err());

    let skipped = flash_plan::plan_config_backup(Some(&csv), dir.path(), true, false).unwrap();
    assert_eq!(skipped, None);
}
