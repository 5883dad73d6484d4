//! This module contains a gateway for arbitrary build commands that leave a binary artifact behind

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{clear_output, read_output, run, ToolchainError};

/// A build command plus the raw code file it produces, e.g. `python build_ext.py` producing
/// `build/ext_sector.bin`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalBuild {
    /// Program to run
    pub program: OsString,
    /// Arguments passed to the program
    pub args: Vec<OsString>,
    /// File the build leaves its code in
    pub artifact: PathBuf,
}
impl ExternalBuild {
    /// Creates a new external build description
    pub fn new<I, S>(program: impl Into<OsString>, args: I, artifact: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            artifact: artifact.into(),
        }
    }

    /// File the build leaves its code in
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Runs the build and reads its artifact.
    ///
    /// The build runs every time. Any artifact left by an earlier run is removed first, so a
    /// build that succeeds without writing one is reported as missing output.
    pub fn build(&self) -> Result<Vec<u8>, ToolchainError> {
        clear_output(&self.artifact)?;
        let command = run(Command::new(&self.program).args(&self.args))?;
        read_output(command, &self.artifact)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use crate::asm::{ExternalBuild, ToolchainError};

    #[test]
    /// Test the artifact of a successful build is returned
    fn test_build() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("ext_sector.bin");
        let script = format!("printf '\\220\\303' > '{}'", artifact.display());

        let build = ExternalBuild::new("sh", ["-c", script.as_str()], &artifact);

        assert_eq!(build.build().unwrap(), [0x90, 0xc3]);
    }

    #[test]
    /// Tests a failing build is an error even with a stale artifact around
    fn test_stale_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("ext_sector.bin");
        fs::write(&artifact, [0x90u8]).unwrap();

        let build = ExternalBuild::new("false", Vec::<String>::new(), &artifact);

        assert!(matches!(
            build.build().unwrap_err(),
            ToolchainError::Failed { .. }
        ));
    }

    #[test]
    /// Tests a successful build that doesn't rewrite its artifact can't hand back the old one
    fn test_stale_artifact_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("ext_sector.bin");
        fs::write(&artifact, [0xdeu8, 0xad]).unwrap();

        let build = ExternalBuild::new("true", Vec::<String>::new(), &artifact);

        assert!(matches!(
            build.build().unwrap_err(),
            ToolchainError::MissingOutput { .. }
        ));
        assert!(!artifact.exists());
    }

    #[test]
    /// Tests a build that succeeds without producing anything is an error
    fn test_no_artifact() {
        let dir = tempfile::tempdir().unwrap();

        let build = ExternalBuild::new("true", Vec::<String>::new(), dir.path().join("none.bin"));

        assert!(matches!(
            build.build().unwrap_err(),
            ToolchainError::MissingOutput { .. }
        ));
    }
}
