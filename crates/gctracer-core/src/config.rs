use std::path::{Path, PathBuf};

use anyhow::{Error, anyhow};
use gctracer_error::{Fault, errno};

use crate::tracing::SentinelMatch;

/// Startup configuration of a [`Tracer`](crate::tracing::Tracer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerConfig {
    /// File to write the log to. The diagnostic stream is used if absent.
    pub output: Option<PathBuf>,

    /// How routine names are matched against the sentinel names.
    pub sentinel_match: SentinelMatch,
}

impl TracerConfig {
    pub fn new() -> Self {
        Self {
            output: None,
            sentinel_match: SentinelMatch::Exact,
        }
    }

    pub fn with_output<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_sentinel_match(mut self, matching: SentinelMatch) -> Self {
        self.sentinel_match = matching;
        self
    }

    /// Checks the configuration before any tracing begins.
    ///
    /// # Errors
    ///
    /// Fails with [`errno::CONFIGURATION`] in the following cases:
    /// - The output path is an existing directory
    /// - The parent directory of the output path does not exist
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(path) = &self.output {
            if path.is_dir() {
                return Err(configuration_error(format!(
                    "Output path {} is a directory",
                    path.display()
                )));
            }

            match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                    return Err(configuration_error(format!(
                        "Output directory {} does not exist",
                        parent.display()
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn configuration_error<M>(message: M) -> Error
where
    M: std::fmt::Display + Send + Sync + 'static,
{
    anyhow!(Fault::new(errno::CONFIGURATION)).context(message)
}
