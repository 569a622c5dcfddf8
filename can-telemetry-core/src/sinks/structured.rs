//! Structured (JSON Lines) sink writer
//!
//! One serialized [`DecodedFrame`] per line, suitable for `jq` or for loading
//! into analysis tools.

use super::FrameWriter;
use crate::types::{DecodedFrame, Result};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub struct StructuredFileWriter<W: Write = BufWriter<File>> {
    out: W,
}

impl StructuredFileWriter {
    /// Create (truncate) the file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        log::info!("Structured log: {:?}", path);
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> StructuredFileWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> FrameWriter for StructuredFileWriter<W> {
    fn write_frame(&mut self, frame: &DecodedFrame) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, frame).map_err(io::Error::from)?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
