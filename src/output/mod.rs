pub mod binary;
pub mod json;
pub mod list;

use anyhow::Result;

use crate::{ScanBanner, ScanStatus};

/// The "Output interface" spec.md §6 describes: `begin`/`end` bracket a
/// scan, `output_status`/`output_banner` report one event each. Accessed
/// only by the receiver thread and responder workers, serialized by the
/// engine (spec.md §5 "Shared state").
pub trait OutputSink: Send {
    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    fn output_status(&mut self, status: &ScanStatus) -> Result<()>;
    fn output_banner(&mut self, banner: &ScanBanner) -> Result<()>;

    /// When true, banners are stored/forwarded verbatim and
    /// post-processing is skipped (spec.md §GLOSSARY "Raw output").
    fn raw(&self) -> bool {
        false
    }
}
