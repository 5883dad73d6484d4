//! # Config
//!
//! The layout of the Forged Alliance executable and the plan for patching it.
//!
//! Everything here is plain data handed to [`crate::run::Orchestrator`]; nothing is global state
//! besides the compiled-in patch list.

use std::path::PathBuf;

use lazy_static::lazy_static;
use thiserror::Error;

use crate::asm::ExternalBuild;
use crate::patcher::table::{PatchEntry, PatchTable, TableError};
use crate::section::FileRegion;

/// Unmodified executable every run starts from
pub const BASE_IMAGE: &str = "ForgedAlliance_base.exe";
/// Working copy that gets patched
pub const PATCHED_IMAGE: &str = "ForgedAlliance_ext.exe";
/// Directory for assembled fragments and other build artifacts
pub const BUILD_DIR: &str = "build";

/// Hook sources, in the order they are applied
pub const HOOKS: [&str; 3] = [
    "hook_LoadSavedGame.s",
    "hook_ArmyGetHandicap.s",
    "hook_Walls.s",
];
/// Assembly source of the extension section
pub const EXT_SECTION_SOURCE: &str = "ext_sector.s";
/// Interpreter used for the C version of the extension section
pub const EXT_BUILD_PROGRAM: &str = "python";
/// Script that compiles the C version of the extension section
pub const EXT_BUILD_SCRIPT: &str = "build_ext.py";
/// Artifact left behind by [`EXT_BUILD_SCRIPT`]
pub const EXT_BUILD_ARTIFACT: &str = "ext_sector.bin";

/// Authenticode signature block, wiped so the patched image isn't left with a broken signature
pub const SIGNATURE_REGION: FileRegion = FileRegion::new(0xBDD000, 0x1500);
/// Raw data of the added `.ext` section, reusing the space of the signature
pub const EXT_SECTION_REGION: FileRegion = FileRegion::new(0xBDD000, 0x1500);

/// File offset of the unused section table slot the `.ext` header goes into
const EXT_SECTION_HEADER_OFFSET: u64 = 0x318;
/// Relative virtual address the `.ext` section is mapped at
const EXT_SECTION_RVA: u32 = 0xE8B000;
/// `IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ`
const EXT_SECTION_CHARACTERISTICS: u32 = 0x6000_0020;

/// One entry of a PE section table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name, NUL padded
    pub name: [u8; 8],
    /// Size of the section once mapped
    pub virtual_size: u32,
    /// Where the section is mapped, relative to the image base
    pub virtual_address: u32,
    /// Size of the section's data in the file
    pub size_of_raw_data: u32,
    /// File offset of the section's data
    pub pointer_to_raw_data: u32,
    /// Section flags
    pub characteristics: u32,
}
impl SectionHeader {
    /// Size of an encoded header
    pub const SIZE: usize = 40;

    /// Encodes the header the way it appears in the section table.
    ///
    /// Relocation and line number fields are always zero.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.name);
        bytes[8..12].copy_from_slice(&self.virtual_size.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.virtual_address.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.size_of_raw_data.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.pointer_to_raw_data.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.characteristics.to_le_bytes());
        bytes
    }

    /// File region covered by the section's raw data
    pub fn raw_region(&self) -> FileRegion {
        FileRegion::new(
            self.pointer_to_raw_data.into(),
            self.size_of_raw_data.into(),
        )
    }
}

/// Section table entry for the `.ext` section
pub const EXT_SECTION_HEADER: SectionHeader = SectionHeader {
    name: *b".ext\0\0\0\0",
    virtual_size: EXT_SECTION_REGION.size as u32,
    virtual_address: EXT_SECTION_RVA,
    size_of_raw_data: EXT_SECTION_REGION.size as u32,
    pointer_to_raw_data: EXT_SECTION_REGION.offset as u32,
    characteristics: EXT_SECTION_CHARACTERISTICS,
};

lazy_static! {
    /// Header edits that make room for the `.ext` section
    pub static ref FORGED_ALLIANCE_PATCHES: Vec<PatchEntry> = vec![
        // number of sections
        PatchEntry::new(0x136, vec![0x07]),
        // size of image
        PatchEntry::new(0x181, vec![0xC5]),
        // checksum
        PatchEntry::new(0x188, vec![0xAC, 0x24]),
        // resource table directory
        PatchEntry::new(0x1B9, vec![0xF0, 0xE3, 0x00, 0xEC, 0xB8, 0x04, 0x00]),
        // certificate table directory
        PatchEntry::new(0x1C8, vec![0x00; 8]),
        // seventh section table entry
        PatchEntry::new(
            EXT_SECTION_HEADER_OFFSET,
            EXT_SECTION_HEADER.to_bytes().to_vec(),
        ),
    ];
}

/// Errors in a [`Layout`]
#[derive(Debug, Error)]
pub enum LayoutError {
    /// The patch table is malformed
    #[error(transparent)]
    Table(#[from] TableError),
    /// The extension section region isn't inside the space freed by the signature
    #[error("extension section {section} is not inside the signature region {signature}")]
    SectionOutsideSignature {
        /// Extension section region
        section: FileRegion,
        /// Signature region
        signature: FileRegion,
    },
}

/// Where things are in the executable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Literal header edits
    pub patches: PatchTable,
    /// Region zeroed before the extension section is written
    pub signature: FileRegion,
    /// Region the extension section code is written to
    pub ext_section: FileRegion,
}
impl Layout {
    /// Creates a layout, checking the extension section sits inside the wiped signature region
    pub fn new(
        patches: PatchTable,
        signature: FileRegion,
        ext_section: FileRegion,
    ) -> Result<Self, LayoutError> {
        let inside = ext_section.offset >= signature.offset
            && ext_section
                .offset
                .checked_add(ext_section.size)
                .zip(signature.offset.checked_add(signature.size))
                .map_or(false, |(section_end, signature_end)| {
                    section_end <= signature_end
                });
        if !inside {
            return Err(LayoutError::SectionOutsideSignature {
                section: ext_section,
                signature,
            });
        }

        Ok(Self {
            patches,
            signature,
            ext_section,
        })
    }

    /// Smallest image size that holds every table entry and both regions
    pub fn extent(&self) -> u64 {
        let region_end = |region: FileRegion| region.offset.saturating_add(region.size);
        self.patches
            .entries()
            .iter()
            .filter_map(PatchEntry::end)
            .chain([region_end(self.signature), region_end(self.ext_section)])
            .max()
            .unwrap_or(0)
    }

    /// Layout of the retail Forged Alliance executable
    pub fn forged_alliance() -> Result<Self, LayoutError> {
        Self::new(
            PatchTable::new(FORGED_ALLIANCE_PATCHES.iter().cloned())?,
            SIGNATURE_REGION,
            EXT_SECTION_REGION,
        )
    }
}

/// Where the extension section's code comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtSource {
    /// Assemble this source with the configured assembler
    Assemble(PathBuf),
    /// Run an external build and use its artifact
    Build(ExternalBuild),
}
impl ExtSource {
    /// The assembled `ext_sector.s`
    pub fn assembly() -> Self {
        Self::Assemble(EXT_SECTION_SOURCE.into())
    }

    /// The C version, compiled by `python build_ext.py` into `<build_dir>/ext_sector.bin`
    pub fn c_code(build_dir: impl Into<PathBuf>) -> Self {
        Self::Build(ExternalBuild::new(
            EXT_BUILD_PROGRAM,
            [EXT_BUILD_SCRIPT],
            build_dir.into().join(EXT_BUILD_ARTIFACT),
        ))
    }
}

/// Everything a patching run needs to know
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    /// Pristine executable copied at the start of the run
    pub base: PathBuf,
    /// Copy that is patched in place
    pub working: PathBuf,
    /// Directory created for build artifacts before the hooks are assembled
    pub build_dir: PathBuf,
    /// Where things are in the executable
    pub layout: Layout,
    /// Hook sources, applied strictly in this order since later hooks may rely on earlier ones
    pub hooks: Vec<PathBuf>,
    /// Source of the extension section's code
    pub ext_source: ExtSource,
}
impl Plan {
    /// Plan for patching `ForgedAlliance_base.exe` in the current directory
    pub fn forged_alliance(c_code: bool) -> Result<Self, LayoutError> {
        let build_dir = PathBuf::from(BUILD_DIR);
        let ext_source = if c_code {
            ExtSource::c_code(&build_dir)
        } else {
            ExtSource::assembly()
        };

        Ok(Self {
            base: BASE_IMAGE.into(),
            working: PATCHED_IMAGE.into(),
            layout: Layout::forged_alliance()?,
            hooks: HOOKS.iter().map(PathBuf::from).collect(),
            build_dir,
            ext_source,
        })
    }
}
