use dynamorio_annotations::elf::AnnotationObject;
use dynamorio_annotations::x86::SiteAssembler;
use dynamorio_annotations::PointerWidth;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};

fn annotscan(args: &[&OsStr]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_annotscan"))
        .args(args)
        .output()
        .unwrap()
}

fn write_input(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn clean_object_exits_successfully() {
    let mut obj = AnnotationObject::new(PointerWidth::Bits64);
    obj.define_annotation("counter", &[0xC3]).unwrap();
    obj.emit_call_site("log_caller", "log_event", &[0x90]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = write_input(&dir, "annotated.o", &obj.finish().unwrap());

    let output = annotscan(&[path.as_os_str(), OsStr::new("--patches")]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("64-bit"));
    assert!(stdout.contains("annotation=log_event"));
    assert!(stdout.contains("annotation=counter"));
    assert!(stdout.contains("patch=[0x"));
    assert!(!stdout.contains("defect"));
}

#[test]
fn malformed_raw_site_exits_with_failure() {
    let site = SiteAssembler::new(PointerWidth::Bits32).call_site(&[]).unwrap();
    let mut code = site.code;
    code[site.layout.offset + 1] = 0x0b;
    let dir = tempfile::tempdir().unwrap();
    let path = write_input(&dir, "site.bin", &code);

    let output = annotscan(&[
        OsStr::new("--raw"),
        OsStr::new("--bits"),
        OsStr::new("32"),
        path.as_os_str(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("defect:"), "{stdout}");
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("1 malformed annotation sites"), "{stderr}");
}

#[test]
fn unsupported_width_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_input(&dir, "empty.bin", &[]);
    let output = annotscan(&[OsStr::new("--raw"), OsStr::new("--bits"), OsStr::new("16"), path.as_os_str()]);
    assert!(!output.status.success());
}
