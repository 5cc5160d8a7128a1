//! Archive fan-out: walks an APK or JAR, schedules one class-level task
//! per eligible class on the worker pool, and tracks progress.
//!
//! The parsed [`DexImage`] is shared read-only by every task from the same
//! entry; per-task scratch (expression arena, decoded code items) lives
//! inside the task closure and dies with it. The `added`/`done` counters
//! are only touched under the progress mutex, which also serializes the
//! repaint.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use zip::read::ZipArchive;

use crate::arena::ExprArena;
use crate::dex::class::SourceFile;
use crate::dex::image::DexImage;
use crate::error::{InputError, TaskError};
use crate::java;
use crate::jvm::class_file::ClassFile;
use crate::jvm::source::decompile_class_file;
use crate::pool::{clamp_workers, WorkerPool};
use crate::smali;
use crate::types::ObjectIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Decompile,
    Smali,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Progress {
    pub added: u32,
    pub done: u32,
}

/// Shared state of one archive run. Outlives every task; released only
/// after the pool has joined.
pub struct ApkContext {
    pub out_dir: PathBuf,
    pub kind: TaskKind,
    pub pool: WorkerPool,
    progress: Mutex<Progress>,
}

impl ApkContext {
    pub fn new(out_dir: &Path, workers: usize, kind: TaskKind) -> ApkContext {
        ApkContext {
            out_dir: out_dir.to_path_buf(),
            kind,
            pool: WorkerPool::new(clamp_workers(workers)),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn task_added(&self) {
        let mut p = self.progress.lock().unwrap();
        p.added += 1;
    }

    /// Increments `done` and repaints the progress line in place.
    pub fn task_done(&self) {
        let mut p = self.progress.lock().unwrap();
        p.done += 1;
        let mut stdout = io::stdout();
        let _ = write!(stdout, "{}", "\u{8}".repeat(30));
        let _ = write!(stdout, "Progress : {} ({})", p.done, p.added);
        let _ = stdout.flush();
    }

    pub fn counts(&self) -> Progress {
        *self.progress.lock().unwrap()
    }
}

/// Is this class-def scheduled as its own task? In Decompile mode inner
/// and anonymous classes ride along inside their declaring class's file --
/// unless no declaring class exists in the image, in which case the class
/// would otherwise be lost and is scheduled anyway. Smali mode schedules
/// everything.
pub fn is_schedulable(image: &DexImage, def_index: usize, kind: TaskKind) -> bool {
    if kind == TaskKind::Smali {
        return true;
    }
    let def = &image.class_defs[def_index];
    if !image.is_inner_class(def) && !image.is_anonymous_class(def) {
        return true;
    }
    let name = match image.type_desc(def.class_idx) {
        Ok(n) => n.to_string(),
        Err(_) => return true,
    };
    let declaring = match name.rfind('$') {
        Some(ix) => format!("{};", &name[..ix]),
        None => return true,
    };
    !image
        .class_defs
        .iter()
        .any(|d| image.type_desc(d.class_idx).ok() == Some(declaring.as_str()))
}

fn write_output(path: &Path, text: &str) -> Result<(), TaskError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text)?;
    Ok(())
}

/// One class-level task: decompile or disassemble `def_index`, then write
/// the output file. Failures are logged; nothing partial is written.
fn class_task(image: &DexImage, def_index: usize, out_dir: &Path, kind: TaskKind) {
    let result = (|| -> Result<(), TaskError> {
        let def = &image.class_defs[def_index];
        let name = ObjectIdentifier::from_jni_type(image.type_desc(def.class_idx)?);
        match kind {
            TaskKind::Decompile => {
                let sf = SourceFile::build(image, def_index)?;
                let mut arena = ExprArena::new();
                let text = java::decompile_source_file(&sf, &mut arena)?;
                write_output(&java::class_file_path(out_dir, &name, "java"), &text)
            }
            TaskKind::Smali => {
                let text = smali::write_class(image, def_index)?;
                write_output(&java::class_file_path(out_dir, &name, "smali"), &text)
            }
        }
    })();
    if let Err(e) = result {
        error!("class task #{def_index} failed: {e}");
    }
}

/// Schedules every eligible class of a parsed image onto the context's
/// pool. The image moves behind an `Arc` shared by all of its tasks.
pub fn schedule_image(ctx: &Arc<ApkContext>, image: Arc<DexImage>) {
    for def_index in 0..image.class_defs.len() {
        if !is_schedulable(&image, def_index, ctx.kind) {
            continue;
        }
        ctx.task_added();
        let task_ctx = Arc::clone(ctx);
        let image = Arc::clone(&image);
        ctx.pool.execute(move || {
            class_task(&image, def_index, &task_ctx.out_dir, task_ctx.kind);
            task_ctx.task_done();
        });
    }
}

/// APK: parse every `*.dex` entry, fan out, join. A malformed entry is
/// logged and skipped; sibling entries continue.
pub fn analyse_apk(
    path: &Path,
    out_dir: &Path,
    workers: usize,
    kind: TaskKind,
) -> Result<Progress, InputError> {
    let file = File::open(path).map_err(|source| InputError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| InputError::Unreadable {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;

    let ctx = Arc::new(ApkContext::new(out_dir, workers, kind));
    for ix in 0..archive.len() {
        let mut entry = match archive.by_index(ix) {
            Ok(e) => e,
            Err(e) => {
                warn!("unreadable archive entry #{ix}: {e}");
                continue;
            }
        };
        if !entry.name().ends_with(".dex") {
            continue;
        }
        let entry_name = entry.name().to_string();
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut bytes) {
            warn!("cannot read {entry_name}: {e}");
            continue;
        }
        match DexImage::parse(bytes) {
            Ok(image) => {
                info!("{entry_name}: {} class defs", image.class_defs.len());
                schedule_image(&ctx, Arc::new(image));
            }
            Err(e) => error!("{entry_name}: {e}"),
        }
    }

    ctx.pool.join();
    println!();
    Ok(ctx.counts())
}

/// A single `.dex` file: same fan-out without the archive walk. A
/// malformed container is fatal here.
pub fn analyse_dex_file(
    path: &Path,
    out_dir: &Path,
    workers: usize,
    kind: TaskKind,
) -> Result<Progress, TaskError> {
    let bytes = fs::read(path)?;
    let image = Arc::new(DexImage::parse(bytes)?);
    let ctx = Arc::new(ApkContext::new(out_dir, workers, kind));
    schedule_image(&ctx, image);
    ctx.pool.join();
    println!();
    Ok(ctx.counts())
}

/// JAR: one task per `.class` entry, each parsing and decompiling one
/// class file.
pub fn analyse_jar(path: &Path, out_dir: &Path, workers: usize) -> Result<Progress, InputError> {
    let file = File::open(path).map_err(|source| InputError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = ZipArchive::new(file).map_err(|e| InputError::Unreadable {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;

    let ctx = Arc::new(ApkContext::new(out_dir, workers, TaskKind::Decompile));
    for ix in 0..archive.len() {
        let mut entry = match archive.by_index(ix) {
            Ok(e) => e,
            Err(e) => {
                warn!("unreadable archive entry #{ix}: {e}");
                continue;
            }
        };
        if !entry.name().ends_with(".class") {
            continue;
        }
        let entry_name = entry.name().to_string();
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut bytes) {
            warn!("cannot read {entry_name}: {e}");
            continue;
        }

        ctx.task_added();
        let ctx_task = Arc::clone(&ctx);
        ctx.pool.execute(move || {
            let result = (|| -> Result<(), TaskError> {
                let class = ClassFile::parse(&bytes)?;
                let name = class.this_name()?;
                let text = decompile_class_file(&class)?;
                write_output(
                    &java::class_file_path(&ctx_task.out_dir, &name, "java"),
                    &text,
                )
            })();
            if let Err(e) = result {
                error!("{entry_name}: {e}");
            }
            ctx_task.task_done();
        });
    }

    ctx.pool.join();
    println!();
    Ok(ctx.counts())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::single_class_dex;

    #[test]
    fn schedulable_filters_inner_in_decompile_mode() {
        let mut b = crate::testutil::DexBuilder::new();
        let proto = b.add_proto("V", "V", &[]);
        let outer_m = b.add_method("Lp/C;", proto, "m");
        let outer = b.add_class("Lp/C;", 0x1);
        b.add_direct_method(outer, outer_m, 0x1, None);
        b.add_class("Lp/C$D;", 0x1);
        b.add_class("Lp/C$1;", 0x1);
        let image = DexImage::parse(b.build()).unwrap();

        assert!(is_schedulable(&image, 0, TaskKind::Decompile));
        assert!(!is_schedulable(&image, 1, TaskKind::Decompile));
        assert!(!is_schedulable(&image, 2, TaskKind::Decompile));

        // Smali schedules everything.
        for ix in 0..3 {
            assert!(is_schedulable(&image, ix, TaskKind::Smali));
        }
    }

    #[test]
    fn orphan_inner_class_is_still_scheduled() {
        let mut b = crate::testutil::DexBuilder::new();
        b.add_class("Lp/Gone$1;", 0x1);
        let image = DexImage::parse(b.build()).unwrap();
        assert!(is_schedulable(&image, 0, TaskKind::Decompile));
    }

    #[test]
    fn task_accounting_matches() {
        let dir = std::env::temp_dir().join("declass-test-accounting");
        let _ = fs::remove_dir_all(&dir);
        let image = Arc::new(DexImage::parse(single_class_dex()).unwrap());
        let ctx = Arc::new(ApkContext::new(&dir, 4, TaskKind::Decompile));
        schedule_image(&ctx, image);
        ctx.pool.join();
        let p = ctx.counts();
        assert_eq!(p.added, 1);
        assert_eq!(p.done, 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
