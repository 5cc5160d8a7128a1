use std::fs;
use std::io::{Cursor, Write};
use std::path::PathBuf;

use zip::write::{FileOptions, ZipWriter};

use crate::apk::{analyse_apk, analyse_jar, TaskKind};
use crate::testutil::{minimal_class_file, single_class_dex, CodeBlob, DexBuilder};

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("declass-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn zip_bytes(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn nested_class_dex() -> Vec<u8> {
    let mut b = DexBuilder::new();
    let proto = b.add_proto("V", "V", &[]);
    let method = b.add_method("Lp/C;", proto, "m");
    let outer = b.add_class("Lp/C;", 0x1);
    b.add_direct_method(
        outer,
        method,
        0x1,
        Some(CodeBlob {
            registers: 1,
            ins: 1,
            outs: 0,
            insns: vec![0x000e],
        }),
    );
    b.add_class("Lp/C$D;", 0x1);
    b.build()
}

#[test]
fn apk_fan_out_counts_and_files() {
    let dir = temp_dir("apk");
    let apk = dir.join("app.apk");

    let mut second = DexBuilder::new();
    second.add_class("Lb;", 0x1);
    fs::write(
        &apk,
        zip_bytes(&[
            ("classes.dex", single_class_dex()),
            ("classes2.dex", second.build()),
            ("resources.arsc", vec![1, 2, 3]),
        ]),
    )
    .unwrap();

    let out = dir.join("out");
    let progress = analyse_apk(&apk, &out, 8, TaskKind::Decompile).unwrap();
    assert_eq!(progress.added, 2);
    assert_eq!(progress.done, 2);
    assert!(out.join("a.java").exists());
    assert!(out.join("b.java").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn inner_classes_inline_into_parent_file() {
    let dir = temp_dir("inner");
    let apk = dir.join("app.apk");
    fs::write(&apk, zip_bytes(&[("classes.dex", nested_class_dex())])).unwrap();

    let out = dir.join("out");
    let progress = analyse_apk(&apk, &out, 2, TaskKind::Decompile).unwrap();
    // One task: the inner class rides along with its parent.
    assert_eq!(progress.added, 1);
    assert_eq!(progress.done, 1);

    let parent = out.join("p/C.java");
    assert!(parent.exists());
    assert!(!out.join("p/C$D.java").exists());
    let text = fs::read_to_string(&parent).unwrap();
    assert!(text.contains("public class C {"), "got:\n{text}");
    assert!(text.contains("public class D {"), "got:\n{text}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn smali_mode_schedules_inner_classes_separately() {
    let dir = temp_dir("smali");
    let apk = dir.join("app.apk");
    fs::write(&apk, zip_bytes(&[("classes.dex", nested_class_dex())])).unwrap();

    let out = dir.join("out");
    let progress = analyse_apk(&apk, &out, 2, TaskKind::Smali).unwrap();
    assert_eq!(progress.added, 2);
    assert_eq!(progress.done, 2);
    assert!(out.join("p/C.smali").exists());
    assert!(out.join("p/C$D.smali").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn malformed_dex_entry_skips_but_siblings_continue() {
    let dir = temp_dir("badentry");
    let apk = dir.join("app.apk");
    let mut bad = single_class_dex();
    bad[40] = 0x12; // flip the endian tag
    bad[41] = 0x34;
    bad[42] = 0x56;
    bad[43] = 0x78;
    // bad entry first, good entry second
    let mut second = DexBuilder::new();
    second.add_class("Lok;", 0x1);
    fs::write(
        &apk,
        zip_bytes(&[("classes.dex", bad), ("classes2.dex", second.build())]),
    )
    .unwrap();

    let out = dir.join("out");
    let progress = analyse_apk(&apk, &out, 2, TaskKind::Decompile).unwrap();
    assert_eq!(progress.added, 1);
    assert_eq!(progress.done, 1);
    assert!(out.join("ok.java").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn jar_decompiles_class_entries() {
    let dir = temp_dir("jar");
    let jar = dir.join("lib.jar");
    fs::write(
        &jar,
        zip_bytes(&[
            ("p/A.class", minimal_class_file("p/A")),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
        ]),
    )
    .unwrap();

    let out = dir.join("out");
    let progress = analyse_jar(&jar, &out, 2).unwrap();
    assert_eq!(progress.added, 1);
    assert_eq!(progress.done, 1);
    let text = fs::read_to_string(out.join("p/A.java")).unwrap();
    assert!(text.contains("package p;"), "got:\n{text}");
    assert!(text.contains("public class A {"), "got:\n{text}");

    let _ = fs::remove_dir_all(&dir);
}
