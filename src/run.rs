//! # Run
//!
//! This module sequences a full patching run over a fresh copy of the base executable.
//!
//! A run moves through [`Stage`]s strictly in order and never retries. The first error ends it in
//! [`Stage::Failed`]; the half patched working copy is then useless and should be discarded.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::asm::{Assembler, ToolchainError};
use crate::code::x86;
use crate::config::{ExtSource, Plan};
use crate::hook::{apply_hook, HookError};
use crate::patcher::table::TableError;
use crate::section::{inject, strip_region, SectionError};

/// Progress of a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Nothing has happened yet
    Init,
    /// The base image was copied to the working path
    BaseCopied,
    /// The patch table was written
    TablePatched,
    /// This many hooks, counted from the start of the plan, were written
    HooksApplied(usize),
    /// The signature region was zeroed
    RegionStripped,
    /// The extension section was written
    SectionWritten,
    /// The image was flushed and closed
    Done,
    /// The run stopped on an error
    Failed(String),
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::BaseCopied => write!(f, "base copied"),
            Self::TablePatched => write!(f, "table patched"),
            Self::HooksApplied(count) => write!(f, "{} hook(s) applied", count),
            Self::RegionStripped => write!(f, "signature stripped"),
            Self::SectionWritten => write!(f, "extension section written"),
            Self::Done => write!(f, "done"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Errors that end a run
#[derive(Debug, Error)]
pub enum RunError {
    /// The base image couldn't be copied
    #[error("failed to copy {} to {}", .from.display(), .to.display())]
    Copy {
        /// Base image
        from: PathBuf,
        /// Working copy
        to: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The working copy couldn't be opened for patching
    #[error("failed to open {} for writing", .path.display())]
    Open {
        /// Working copy
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The working copy is too short for the layout, so it isn't the expected executable
    #[error("{} is {len:#x} bytes but the layout needs at least {required:#x}", .path.display())]
    ImageTooSmall {
        /// Working copy
        path: PathBuf,
        /// Size of the working copy
        len: u64,
        /// Size the layout reaches up to
        required: u64,
    },
    /// The patch table couldn't be written
    #[error("failed to apply the patch table")]
    Table(#[source] TableError),
    /// The build directory couldn't be created
    #[error("failed to create build directory {}", .path.display())]
    BuildDir {
        /// Build directory
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// One of the hooks failed
    #[error("hook #{index} ({}) failed", .path.display())]
    Hook {
        /// Zero-based position of the hook in the plan
        index: usize,
        /// Hook source
        path: PathBuf,
        /// What went wrong
        #[source]
        source: HookError,
    },
    /// The signature region couldn't be zeroed
    #[error("failed to strip the signature region")]
    Strip(#[source] SectionError),
    /// The extension section's code couldn't be built
    #[error("failed to build the extension section")]
    Build(#[source] ToolchainError),
    /// The extension section couldn't be written
    #[error("failed to write the extension section")]
    Section(#[source] SectionError),
    /// The patched image couldn't be flushed to disk
    #[error("failed to flush {}", .path.display())]
    Flush {
        /// Working copy
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Drives a [`Plan`] against the working copy of the executable.
///
/// The orchestrator is the only owner of the open image; every step borrows it.
pub struct Orchestrator<'a, A: Assembler + ?Sized> {
    /// What to do
    plan: &'a Plan,
    /// Assembler used for hooks and the assembled extension section
    assembler: &'a A,
    /// How far the run got
    stage: Stage,
}
impl<'a, A: Assembler + ?Sized> Orchestrator<'a, A> {
    /// Creates an orchestrator for `plan`
    pub fn new(plan: &'a Plan, assembler: &'a A) -> Self {
        Self {
            plan,
            assembler,
            stage: Stage::Init,
        }
    }

    /// How far the run got
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Runs every step of the plan, leaving the patched image at `plan.working`.
    ///
    /// Running again starts over from a fresh copy of the base image.
    pub fn run(&mut self) -> Result<(), RunError> {
        self.stage = Stage::Init;

        let result = self.run_stages();
        if let Err(e) = &result {
            debug!("patching stopped after stage '{}': {}", self.stage, e);
            self.stage = Stage::Failed(e.to_string());
        }
        result
    }

    /// Moves to the next stage
    fn advance(&mut self, stage: Stage) {
        debug!("stage: {}", stage);
        self.stage = stage;
    }

    /// Every step of the run, in order
    fn run_stages(&mut self) -> Result<(), RunError> {
        let plan = self.plan;
        info!(
            "Patching {} to {}",
            plan.base.display(),
            plan.working.display()
        );

        fs::copy(&plan.base, &plan.working).map_err(|source| RunError::Copy {
            from: plan.base.clone(),
            to: plan.working.clone(),
            source,
        })?;
        let open_error = |source| RunError::Open {
            path: plan.working.clone(),
            source,
        };
        let mut image = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&plan.working)
            .map_err(open_error)?;
        let image_len = image.metadata().map_err(open_error)?.len();
        self.advance(Stage::BaseCopied);

        let required = plan.layout.extent();
        if image_len < required {
            return Err(RunError::ImageTooSmall {
                path: plan.working.clone(),
                len: image_len,
                required,
            });
        }

        info!("Patching in a .ext sector");
        plan.layout
            .patches
            .apply(&mut image)
            .map_err(RunError::Table)?;
        self.advance(Stage::TablePatched);

        fs::create_dir_all(&plan.build_dir).map_err(|source| RunError::BuildDir {
            path: plan.build_dir.clone(),
            source,
        })?;

        for (index, path) in plan.hooks.iter().enumerate() {
            apply_hook(&mut image, self.assembler, path, image_len).map_err(|source| {
                RunError::Hook {
                    index,
                    path: path.clone(),
                    source,
                }
            })?;
            self.advance(Stage::HooksApplied(index + 1));
        }

        info!("Stripping signature at {}", plan.layout.signature);
        strip_region(&mut image, plan.layout.signature).map_err(RunError::Strip)?;
        self.advance(Stage::RegionStripped);

        let code = self.build_ext_section()?;
        info!(
            "Writing {:#x} byte extension section at {}",
            code.len(),
            plan.layout.ext_section
        );
        for line in x86::file_listing(&code, plan.layout.ext_section.offset) {
            debug!("  {}", line);
        }
        inject(&mut image, plan.layout.ext_section, &code).map_err(RunError::Section)?;
        self.advance(Stage::SectionWritten);

        close(image).map_err(|source| RunError::Flush {
            path: plan.working.clone(),
            source,
        })?;
        self.advance(Stage::Done);
        info!("Done.");
        Ok(())
    }

    /// Produces the extension section's code from the configured source
    fn build_ext_section(&self) -> Result<Vec<u8>, RunError> {
        let code = match &self.plan.ext_source {
            ExtSource::Assemble(source) => self.assembler.assemble(source),
            ExtSource::Build(build) => build.build(),
        };
        code.map_err(RunError::Build)
    }
}

/// Flushes the image to disk and closes it
fn close(image: File) -> io::Result<()> {
    image.sync_all()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::asm::{Assembler, ToolchainError};
    use crate::config::{ExtSource, Layout, Plan};
    use crate::hook::{HeaderError, HookError};
    use crate::patcher::table::{PatchEntry, PatchTable};
    use crate::run::{Orchestrator, RunError, Stage};
    use crate::section::{FileRegion, SectionError};

    /// Assembler returning canned code per source file name, recording every call
    #[derive(Default)]
    struct Canned {
        /// Code returned for each file name
        code: HashMap<&'static str, Vec<u8>>,
        /// File names in the order they were assembled
        calls: RefCell<Vec<String>>,
    }
    impl Canned {
        /// Adds canned output for `name`
        fn with(mut self, name: &'static str, code: Vec<u8>) -> Self {
            self.code.insert(name, code);
            self
        }
    }
    impl Assembler for Canned {
        fn assemble(&self, source: &Path) -> Result<Vec<u8>, ToolchainError> {
            let name = source.file_name().unwrap().to_str().unwrap();
            self.calls.borrow_mut().push(name.to_owned());
            self.code
                .get(name)
                .cloned()
                .ok_or_else(|| ToolchainError::NotAssembly {
                    path: source.to_path_buf(),
                })
        }
    }

    /// Writes a hook source with the given header into `dir`
    fn write_hook(dir: &Path, name: &str, header: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("{}\nbits 32\n", header)).unwrap();
        path
    }

    /// Plan over an all-0xff base image of `size` bytes inside `dir`
    fn plan(dir: &Path, size: usize, layout: Layout, hooks: Vec<PathBuf>) -> Plan {
        let base = dir.join("base.exe");
        fs::write(&base, vec![0xffu8; size]).unwrap();
        Plan {
            base,
            working: dir.join("ext.exe"),
            build_dir: dir.join("build"),
            layout,
            hooks,
            ext_source: ExtSource::Assemble(dir.join("ext_sector.s")),
        }
    }

    /// Layout with no table patches and an 8 byte extension section at 0x1000
    fn small_layout(patches: PatchTable) -> Layout {
        Layout::new(
            patches,
            FileRegion::new(0x1000, 0x8),
            FileRegion::new(0x1000, 0x8),
        )
        .unwrap()
    }

    #[test]
    /// Test a single table byte on an all-0xff image
    fn test_table_only() {
        let dir = tempfile::tempdir().unwrap();
        let table = PatchTable::new([PatchEntry::new(0x10, vec![0x07])]).unwrap();
        let plan = plan(dir.path(), 0x1010, small_layout(table), vec![]);
        let assembler = Canned::default().with("ext_sector.s", vec![0xc3]);

        Orchestrator::new(&plan, &assembler).run().unwrap();

        let image = fs::read(&plan.working).unwrap();
        for (i, b) in image.iter().enumerate() {
            let expected = match i {
                0x10 => 0x07,
                0x1000 => 0xc3,
                0x1001..=0x1007 => 0x00,
                _ => 0xff,
            };
            assert_eq!(*b, expected, "byte {:#x}", i);
        }
        // the base image is never touched
        assert!(fs::read(&plan.base).unwrap().iter().all(|b| *b == 0xff));
    }

    #[test]
    /// Tests a full run with hooks applied in plan order
    fn test_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![
            write_hook(dir.path(), "hook_b.s", "; HOOK second ROffset 0x100"),
            write_hook(dir.path(), "hook_a.s", "; HOOK first ROffset 256"),
        ];
        let table = PatchTable::new([PatchEntry::new(0x20, vec![0x01, 0x02])]).unwrap();
        let plan = plan(dir.path(), 0x1010, small_layout(table), hooks);
        let assembler = Canned::default()
            .with("hook_b.s", vec![0x90, 0x90])
            // written later to the same offset, so this one wins
            .with("hook_a.s", vec![0xcc])
            .with("ext_sector.s", vec![0x55, 0x89, 0xe5]);

        let mut run = Orchestrator::new(&plan, &assembler);
        run.run().unwrap();

        assert_eq!(run.stage(), &Stage::Done);
        assert_eq!(
            *assembler.calls.borrow(),
            ["hook_b.s", "hook_a.s", "ext_sector.s"]
        );
        assert!(plan.build_dir.is_dir());

        let image = fs::read(&plan.working).unwrap();
        assert_eq!(&image[0x20..0x22], &[0x01, 0x02]);
        assert_eq!(&image[0x100..0x102], &[0xcc, 0x90]);
        assert_eq!(
            &image[0x1000..0x1008],
            &[0x55, 0x89, 0xe5, 0, 0, 0, 0, 0]
        );
        assert_eq!(&image[0x1008..], &[0xff; 8]);
    }

    #[test]
    /// Tests an oversized extension section fails the run without touching its region
    fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(
            PatchTable::default(),
            FileRegion::new(0x1000, 0x8),
            FileRegion::new(0x1000, 4),
        )
        .unwrap();
        let plan = plan(dir.path(), 0x1010, layout, vec![]);
        let assembler =
            Canned::default().with("ext_sector.s", vec![0x01, 0x02, 0x03, 0x04, 0x05]);

        let mut run = Orchestrator::new(&plan, &assembler);
        let err = run.run().unwrap_err();

        assert!(matches!(
            err,
            RunError::Section(SectionError::CapacityExceeded { len: 5, .. })
        ));
        assert!(matches!(run.stage(), Stage::Failed(_)));
        // still exactly as the signature strip left it
        let image = fs::read(&plan.working).unwrap();
        assert_eq!(&image[0x1000..0x1008], &[0u8; 8]);
        assert_eq!(&image[0x1008..], &[0xffu8; 8]);
    }

    #[test]
    /// Tests a bad hook header stops the run and names the hook
    fn test_bad_hook() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![
            write_hook(dir.path(), "hook_ok.s", "; HOOK ok ROffset 0x10"),
            write_hook(dir.path(), "hook_bad.s", "; HOOK bad Offset 0x20"),
            write_hook(dir.path(), "hook_never.s", "; HOOK never ROffset 0x30"),
        ];
        let plan = plan(dir.path(), 0x1010, small_layout(PatchTable::default()), hooks);
        let assembler = Canned::default()
            .with("hook_ok.s", vec![0x90])
            .with("hook_never.s", vec![0x90]);

        let mut run = Orchestrator::new(&plan, &assembler);
        let err = run.run().unwrap_err();

        match &err {
            RunError::Hook {
                index,
                path,
                source: HookError::Header(HeaderError::UnexpectedToken { position, .. }),
            } => {
                assert_eq!(*index, 1);
                assert!(path.ends_with("hook_bad.s"));
                assert_eq!(*position, 3);
            }
            e => panic!("unexpected error {}", e),
        }
        assert_eq!(*assembler.calls.borrow(), ["hook_ok.s"]);
        assert_eq!(run.stage(), &Stage::Failed(err.to_string()));
    }

    #[test]
    /// Tests a base image shorter than the layout is refused before anything is written
    fn test_image_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), 0x100, small_layout(PatchTable::default()), vec![]);
        let assembler = Canned::default().with("ext_sector.s", vec![0xc3]);

        let mut run = Orchestrator::new(&plan, &assembler);
        let err = run.run().unwrap_err();

        assert!(matches!(
            err,
            RunError::ImageTooSmall { len: 0x100, required: 0x1008, .. }
        ));
        assert!(matches!(run.stage(), Stage::Failed(_)));
        assert!(assembler.calls.borrow().is_empty());
        assert_eq!(fs::read(&plan.working).unwrap(), vec![0xffu8; 0x100]);
    }

    #[test]
    /// Tests a hook past the end of the image stops the run without growing the image
    fn test_hook_outside_image() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![write_hook(dir.path(), "hook_far.s", "; HOOK far ROffset 0x100f")];
        let plan = plan(dir.path(), 0x1010, small_layout(PatchTable::default()), hooks);
        let assembler = Canned::default().with("hook_far.s", vec![0x90, 0x90]);

        let err = Orchestrator::new(&plan, &assembler).run().unwrap_err();

        assert!(matches!(
            err,
            RunError::Hook { index: 0, source: HookError::OutsideImage { .. }, .. }
        ));
        assert_eq!(fs::read(&plan.working).unwrap().len(), 0x1010);
    }

    #[test]
    /// Tests a missing base image fails before anything is written
    fn test_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut plan = plan(dir.path(), 0x10, small_layout(PatchTable::default()), vec![]);
        plan.base = dir.path().join("missing.exe");
        let assembler = Canned::default();

        let err = Orchestrator::new(&plan, &assembler).run().unwrap_err();

        assert!(matches!(err, RunError::Copy { .. }));
        assert!(!plan.working.exists());
    }

    #[test]
    /// Tests rerunning over an old working copy starts from the base image again
    fn test_rerun_resets() {
        let dir = tempfile::tempdir().unwrap();
        let plan = plan(dir.path(), 0x1010, small_layout(PatchTable::default()), vec![]);
        fs::write(&plan.working, vec![0x11u8; 0x2000]).unwrap();
        let assembler = Canned::default().with("ext_sector.s", vec![0xc3]);

        Orchestrator::new(&plan, &assembler).run().unwrap();

        let image = fs::read(&plan.working).unwrap();
        assert_eq!(image.len(), 0x1010);
        assert_eq!(image[0], 0xff);
    }
}
