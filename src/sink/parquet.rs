//! In-memory Parquet writer.
//!
//! Encodes Arrow record batches into Parquet files held in memory, rolling
//! to a new file once the current one reaches the configured size. Files
//! are named under the partition directory they belong to.

use bytes::{BufMut, BytesMut};
use deltalake::arrow::array::RecordBatch;
use deltalake::arrow::datatypes::SchemaRef;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::parquet::basic::{Compression, GzipLevel, ZstdLevel};
use deltalake::parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::FinishedFile;
use crate::config::{MB, ParquetCompression, ParquetSettings};
use crate::emit;
use crate::error::{
    BufferInUseSnafu, BufferLockSnafu, ParquetError, WriteSnafu, WriterCreateSnafu,
    WriterUnavailableSnafu,
};
use crate::metrics::events::{BytesWritten, ParquetWriteCompleted};

/// Rows per slice handed to the Arrow writer, so size checks run between slices.
const WRITE_SLICE_ROWS: usize = 8192;

/// Buffer shared between the Arrow writer and its owner.
#[derive(Clone)]
struct SharedBuffer {
    buffer: Arc<Mutex<bytes::buf::Writer<BytesMut>>>,
}

impl SharedBuffer {
    fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(BytesMut::new().writer())),
        }
    }

    fn into_inner(self) -> Result<BytesMut, ParquetError> {
        let mutex = Arc::into_inner(self.buffer).context(BufferInUseSnafu)?;
        let writer = mutex.into_inner().map_err(|_| BufferLockSnafu.build())?;
        Ok(writer.into_inner())
    }

    fn len(&self) -> Result<usize, ParquetError> {
        let guard = self.buffer.lock().map_err(|_| BufferLockSnafu.build())?;
        Ok(guard.get_ref().len())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::other("buffer lock poisoned"))?;
        Write::write(&mut *buffer, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Configuration for the Parquet writer.
#[derive(Debug, Clone)]
pub struct ParquetWriterConfig {
    /// Roll to a new file once the current one reaches this many bytes.
    pub target_file_size: usize,
    pub compression: ParquetCompression,
}

impl Default for ParquetWriterConfig {
    fn default() -> Self {
        Self {
            target_file_size: 128 * MB,
            compression: ParquetCompression::Snappy,
        }
    }
}

impl From<&ParquetSettings> for ParquetWriterConfig {
    fn from(settings: &ParquetSettings) -> Self {
        Self {
            target_file_size: settings.file_size_mb.max(1) * MB,
            compression: settings.compression,
        }
    }
}

/// Writes the files of one partition.
pub struct ParquetWriter {
    schema: SchemaRef,
    config: ParquetWriterConfig,
    directory: String,
    writer: Option<ArrowWriter<SharedBuffer>>,
    buffer: SharedBuffer,
    records_in_file: usize,
    finished_files: Vec<FinishedFile>,
}

impl ParquetWriter {
    /// Create a writer for files under `directory` (relative to the table root).
    pub fn new(
        schema: SchemaRef,
        config: ParquetWriterConfig,
        directory: impl Into<String>,
    ) -> Result<Self, ParquetError> {
        let buffer = SharedBuffer::new();
        let writer = create_writer(&schema, &config, buffer.clone())?;
        Ok(Self {
            schema,
            config,
            directory: directory.into(),
            writer: Some(writer),
            buffer,
            records_in_file: 0,
            finished_files: Vec::new(),
        })
    }

    /// Write a batch, rolling files as they reach the target size.
    pub fn write_batch(&mut self, batch: &RecordBatch) -> Result<(), ParquetError> {
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = WRITE_SLICE_ROWS.min(batch.num_rows() - offset);
            let slice = batch.slice(offset, len);
            let writer = self.writer.as_mut().context(WriterUnavailableSnafu)?;
            writer.write(&slice).context(WriteSnafu)?;
            self.records_in_file += len;
            offset += len;

            if self.current_file_size() >= self.config.target_file_size {
                debug!(
                    "Rolling file at {} bytes, {} records",
                    self.current_file_size(),
                    self.records_in_file
                );
                self.finish_file()?;
                self.writer = Some(create_writer(&self.schema, &self.config, self.buffer.clone())?);
            }
        }
        Ok(())
    }

    /// Close the writer and return every file written.
    pub fn close(mut self) -> Result<Vec<FinishedFile>, ParquetError> {
        if self.records_in_file > 0 {
            self.finish_file()?;
        }
        Ok(self.finished_files)
    }

    /// Current file size in bytes, including data not yet flushed to a row group.
    pub fn current_file_size(&self) -> usize {
        let buffered = self.buffer.len().unwrap_or(0);
        let in_progress = self
            .writer
            .as_ref()
            .map(|w| w.in_progress_size())
            .unwrap_or(0);
        buffered + in_progress
    }

    fn finish_file(&mut self) -> Result<(), ParquetError> {
        let start = Instant::now();
        let writer = self.writer.take().context(WriterUnavailableSnafu)?;
        writer.close().context(WriteSnafu)?;

        let bytes = std::mem::replace(&mut self.buffer, SharedBuffer::new())
            .into_inner()?
            .freeze();

        emit!(ParquetWriteCompleted {
            duration: start.elapsed()
        });
        emit!(BytesWritten {
            bytes: bytes.len() as u64
        });

        self.finished_files.push(FinishedFile {
            filename: format!("{}/part-{}.parquet", self.directory, Uuid::now_v7()),
            size: bytes.len(),
            record_count: self.records_in_file,
            bytes,
        });
        self.records_in_file = 0;
        Ok(())
    }
}

fn create_writer(
    schema: &SchemaRef,
    config: &ParquetWriterConfig,
    buffer: SharedBuffer,
) -> Result<ArrowWriter<SharedBuffer>, ParquetError> {
    let properties = WriterProperties::builder()
        .set_compression(match config.compression {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
        })
        .build();

    ArrowWriter::try_new(buffer, schema.clone(), Some(properties)).context(WriterCreateSnafu)
}
