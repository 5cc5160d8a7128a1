//! Command-line entry point: sniff the input's magic, pick the pipeline,
//! run it.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use log::LevelFilter;
use simple_logger::SimpleLogger;

use declass::apk::{analyse_apk, analyse_dex_file, analyse_jar, TaskKind};
use declass::dex::image::DexImage;
use declass::error::InputError;
use declass::java;
use declass::jvm::class_file::ClassFile;
use declass::jvm::source::decompile_class_file;
use declass::pool::clamp_workers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileType {
    JavaClass,
    Jar,
    Dex,
    Apk,
}

#[derive(Debug)]
struct Options {
    path: PathBuf,
    file_type: FileType,
    out: Option<PathBuf>,
    dump: bool,
    smali: bool,
    threads: usize,
}

fn print_usage() {
    eprintln!("Usage: declass file [-p] [-s] [-o outpath] [-t num]");
    eprintln!("    -p: print structural info, like javap or dexdump");
    eprintln!("    -s: dex/apk to smali");
    eprintln!("    -o: output path for jar/dex/apk files");
    eprintln!("    -t: number of worker threads (default 4; ignored for single class files)");
}

/// The first four bytes decide the pipeline; `.apk` suffix splits ZIP
/// containers into APK vs JAR.
fn magic_of_file(path: &Path) -> Result<FileType, InputError> {
    let mut file = File::open(path).map_err(|source| InputError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() {
        return Err(InputError::UnknownMagic {
            path: path.to_path_buf(),
        });
    }
    match magic {
        [0xca, 0xfe, 0xba, 0xbe] => Ok(FileType::JavaClass),
        [0x50, 0x4b, 0x03, 0x04] => {
            if path.extension().map(|e| e == "apk").unwrap_or(false) {
                Ok(FileType::Apk)
            } else {
                Ok(FileType::Jar)
            }
        }
        [0x64, 0x65, 0x78, 0x0a] => Ok(FileType::Dex),
        _ => Err(InputError::UnknownMagic {
            path: path.to_path_buf(),
        }),
    }
}

/// Default output directory: a sibling of the input named after it with
/// dots turned into underscores (`app.apk` -> `app_apk`).
fn default_out_dir(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('.', "_"))
        .unwrap_or_else(|| "out".to_string());
    path.parent().unwrap_or(Path::new(".")).join(name)
}

fn parse_options() -> Result<Options, i32> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print_usage();
        return Err(0);
    }

    let dump = args.contains("-p");
    let smali = args.contains("-s");
    let out: Option<PathBuf> = match args.opt_value_from_str("-o") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("[declass] option -o requires an output path");
            return Err(2);
        }
    };
    let threads: usize = match args.opt_value_from_str("-t") {
        Ok(v) => v.unwrap_or(4),
        Err(_) => {
            eprintln!("[declass] option -t requires a thread count");
            return Err(2);
        }
    };

    let rest = args.finish();
    let path = match rest.as_slice() {
        [one] => PathBuf::from(one),
        [] => {
            print_usage();
            return Err(2);
        }
        _ => {
            eprintln!("[declass] expected exactly one input file");
            print_usage();
            return Err(2);
        }
    };

    let file_type = match magic_of_file(&path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("[declass] {e}");
            return Err(1);
        }
    };
    if smali && !matches!(file_type, FileType::Dex | FileType::Apk) {
        eprintln!("[declass] -s is only valid for DEX and APK inputs");
        return Err(2);
    }

    Ok(Options {
        path,
        file_type,
        out,
        dump,
        smali,
        threads,
    })
}

fn banner(what: &str, opt: &Options, out: &Path) {
    println!("[declass] {what}");
    println!("File     : {}", opt.path.display());
    println!("Save to  : {}", out.display());
    println!("Thread   : {}", clamp_workers(opt.threads));
}

fn run_for_class(opt: &Options) -> i32 {
    // -t is accepted here and silently ignored.
    let bytes = match fs::read(&opt.path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("[declass] cannot read {}: {e}", opt.path.display());
            return 1;
        }
    };
    let class = match ClassFile::parse(&bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[declass] {}: {e}", opt.path.display());
            return 1;
        }
    };
    if opt.dump {
        let mut stdout = std::io::stdout();
        if class.dump(&mut stdout).is_err() {
            return 1;
        }
        return 0;
    }
    let text = match decompile_class_file(&class) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("[declass] {}: {e}", opt.path.display());
            return 1;
        }
    };
    let out = opt
        .out
        .clone()
        .unwrap_or_else(|| default_out_dir(&opt.path));
    let name = match class.this_name() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("[declass] {}: {e}", opt.path.display());
            return 1;
        }
    };
    let target = java::class_file_path(&out, &name, "java");
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("[declass] cannot create {}: {e}", parent.display());
            return 1;
        }
    }
    match fs::write(&target, text) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("[declass] cannot write {}: {e}", target.display());
            1
        }
    }
}

fn run_for_jar(opt: &Options) -> i32 {
    let out = opt
        .out
        .clone()
        .unwrap_or_else(|| default_out_dir(&opt.path));
    banner("JAR file analysis", opt, &out);
    match analyse_jar(&opt.path, &out, opt.threads) {
        Ok(_) => {
            println!("\n[Done]");
            0
        }
        Err(e) => {
            eprintln!("[declass] {e}");
            1
        }
    }
}

fn run_for_dex(opt: &Options) -> i32 {
    if opt.dump {
        let bytes = match fs::read(&opt.path) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("[declass] cannot read {}: {e}", opt.path.display());
                return 1;
            }
        };
        println!("[declass] DEX file info");
        let image = match DexImage::parse(bytes) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("[declass] {}: {e}", opt.path.display());
                return 1;
            }
        };
        let mut stdout = std::io::stdout();
        return if image.dump(&mut stdout).is_ok() { 0 } else { 1 };
    }

    let kind = if opt.smali {
        TaskKind::Smali
    } else {
        TaskKind::Decompile
    };
    let out = opt
        .out
        .clone()
        .unwrap_or_else(|| default_out_dir(&opt.path));
    banner(
        if opt.smali {
            "DEX to Smali"
        } else {
            "DEX file analysis"
        },
        opt,
        &out,
    );
    match analyse_dex_file(&opt.path, &out, opt.threads, kind) {
        Ok(_) => {
            println!("\n[Done]");
            0
        }
        Err(e) => {
            eprintln!("[declass] {e}");
            1
        }
    }
}

fn run_for_apk(opt: &Options) -> i32 {
    let kind = if opt.smali {
        TaskKind::Smali
    } else {
        TaskKind::Decompile
    };
    let out = opt
        .out
        .clone()
        .unwrap_or_else(|| default_out_dir(&opt.path));
    banner("APK file analysis", opt, &out);
    match analyse_apk(&opt.path, &out, opt.threads, kind) {
        Ok(_) => {
            println!("\n[Done]");
            0
        }
        Err(e) => {
            eprintln!("[declass] {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("declass-magic-{}-{name}", std::process::id()));
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn magic_identification_is_total_and_exclusive() {
        let class = write_temp("a.class", &[0xca, 0xfe, 0xba, 0xbe, 0, 0]);
        assert_eq!(magic_of_file(&class).unwrap(), FileType::JavaClass);

        let jar = write_temp("a.jar", &[0x50, 0x4b, 0x03, 0x04, 0, 0]);
        assert_eq!(magic_of_file(&jar).unwrap(), FileType::Jar);

        let apk = write_temp("a.apk", &[0x50, 0x4b, 0x03, 0x04, 0, 0]);
        assert_eq!(magic_of_file(&apk).unwrap(), FileType::Apk);

        let dex = write_temp("a.dex", &[0x64, 0x65, 0x78, 0x0a, 0, 0]);
        assert_eq!(magic_of_file(&dex).unwrap(), FileType::Dex);

        let junk = write_temp("a.bin", &[0x00, 0x11, 0x22, 0x33]);
        assert!(matches!(
            magic_of_file(&junk),
            Err(InputError::UnknownMagic { .. })
        ));

        let short = write_temp("a.short", &[0x64]);
        assert!(matches!(
            magic_of_file(&short),
            Err(InputError::UnknownMagic { .. })
        ));

        let missing = std::env::temp_dir().join("declass-magic-missing-nope");
        assert!(matches!(
            magic_of_file(&missing),
            Err(InputError::Unreadable { .. })
        ));

        for p in [class, jar, apk, dex, junk, short] {
            let _ = fs::remove_file(p);
        }
    }

    #[test]
    fn default_out_dir_replaces_dots() {
        assert_eq!(
            default_out_dir(Path::new("/x/app.apk")),
            Path::new("/x/app_apk")
        );
        assert_eq!(
            default_out_dir(Path::new("lib.jar")),
            Path::new("lib_jar")
        );
    }
}

fn main() -> ExitCode {
    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .init()
        .ok();

    let opt = match parse_options() {
        Ok(opt) => opt,
        Err(code) => return ExitCode::from(code as u8),
    };

    let code = match opt.file_type {
        FileType::JavaClass => run_for_class(&opt),
        FileType::Jar => run_for_jar(&opt),
        FileType::Dex => run_for_dex(&opt),
        FileType::Apk => run_for_apk(&opt),
    };
    ExitCode::from(code as u8)
}
