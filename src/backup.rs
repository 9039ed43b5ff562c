//! Backup codec: stream the full document population to and from disk.
//!
//! The writer serializes documents into a bounded sequence of numbered
//! files (`<prefix>-<index>`, index from 0), rolling to the next file after
//! a configured document count; compression (zstd, `.zst` suffix) is
//! uniform per writer. The reader walks the same sequence transparently
//! across file boundaries and detects compression per file from the suffix.
//! I/O failures never abort the stream: they are recorded into a shared
//! `Problems` sink so a caller can distinguish a clean run from a damaged
//! one after the fact. Backup and restore walk the store directly and
//! bypass the session layer entirely.

use crate::document::Document;
use crate::error::StorageError;
use crate::store::DocumentStore;
use crate::types::NodeKey;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffix appended to compressed backup files.
pub const COMPRESSED_EXTENSION: &str = ".zst";

/// File name prefix used by whole-repository backups.
pub const DOCUMENTS_PREFIX: &str = "documents";

/// Non-fatal problem sink for backup and restore runs.
#[derive(Debug, Default)]
pub struct Problems {
    messages: Mutex<Vec<String>>,
}

impl Problems {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(problem = %message, "Recorded backup problem");
        self.messages.lock().push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

/// Knobs for one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Documents per file before rolling to the next one.
    pub documents_per_file: usize,
    /// Compress every file this writer produces.
    pub compress: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            documents_per_file: 100_000,
            compress: true,
        }
    }
}

enum FileSink {
    Plain(BufWriter<File>),
    Compressed(zstd::Encoder<'static, BufWriter<File>>),
}

impl FileSink {
    fn finish(self) -> io::Result<()> {
        match self {
            FileSink::Plain(mut writer) => writer.flush(),
            FileSink::Compressed(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            FileSink::Plain(w) => w.write(buf),
            FileSink::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            FileSink::Plain(w) => w.flush(),
            FileSink::Compressed(w) => w.flush(),
        }
    }
}

fn file_path(directory: &Path, prefix: &str, index: usize, compressed: bool) -> PathBuf {
    let name = if compressed {
        format!("{}-{}{}", prefix, index, COMPRESSED_EXTENSION)
    } else {
        format!("{}-{}", prefix, index)
    };
    directory.join(name)
}

/// Streams documents into a numbered file sequence.
pub struct BackupDocumentWriter {
    directory: PathBuf,
    prefix: String,
    options: BackupOptions,
    problems: Arc<Problems>,
    current: Option<FileSink>,
    docs_in_current: usize,
    file_index: usize,
    total_written: u64,
    closed: bool,
}

impl BackupDocumentWriter {
    pub fn new(
        directory: &Path,
        prefix: &str,
        options: BackupOptions,
        problems: Arc<Problems>,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(directory)?;
        Ok(BackupDocumentWriter {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            options,
            problems,
            current: None,
            docs_in_current: 0,
            file_index: 0,
            total_written: 0,
            closed: false,
        })
    }

    /// Append one document. I/O and serialization failures are recorded
    /// into the problem sink and the stream continues; only writing after
    /// `close` is a hard error.
    pub fn write(&mut self, key: &NodeKey, document: &Document) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Backend(
                "backup writer is already closed".to_string(),
            ));
        }
        let payload = match bincode::serialize(&(key, document)) {
            Ok(payload) => payload,
            Err(err) => {
                self.problems
                    .record(format!("failed to serialize document {}: {}", key, err));
                return Ok(());
            }
        };

        if self.current.is_none() {
            self.open_next_file();
        }
        let Some(sink) = self.current.as_mut() else {
            // The file could not be opened; the problem is already recorded.
            return Ok(());
        };
        let len = (payload.len() as u32).to_le_bytes();
        if let Err(err) = sink.write_all(&len).and_then(|_| sink.write_all(&payload)) {
            self.problems
                .record(format!("failed to write document {}: {}", key, err));
            return Ok(());
        }

        self.docs_in_current += 1;
        self.total_written += 1;
        if self.docs_in_current >= self.options.documents_per_file {
            self.seal_current_file();
        }
        Ok(())
    }

    /// Flush and finalize the last (possibly partial) file. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.seal_current_file();
        self.closed = true;
        debug!(
            files = self.file_index,
            documents = self.total_written,
            "Closed backup writer"
        );
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    fn open_next_file(&mut self) {
        let path = file_path(
            &self.directory,
            &self.prefix,
            self.file_index,
            self.options.compress,
        );
        match File::create(&path) {
            Ok(file) => {
                let buffered = BufWriter::new(file);
                let sink = if self.options.compress {
                    match zstd::Encoder::new(buffered, 0) {
                        Ok(encoder) => FileSink::Compressed(encoder),
                        Err(err) => {
                            self.problems.record(format!(
                                "failed to start compression for {}: {}",
                                path.display(),
                                err
                            ));
                            return;
                        }
                    }
                } else {
                    FileSink::Plain(buffered)
                };
                self.current = Some(sink);
                self.docs_in_current = 0;
            }
            Err(err) => {
                self.problems.record(format!(
                    "failed to create backup file {}: {}",
                    path.display(),
                    err
                ));
            }
        }
    }

    fn seal_current_file(&mut self) {
        if let Some(sink) = self.current.take() {
            if let Err(err) = sink.finish() {
                self.problems
                    .record(format!("failed to finalize backup file: {}", err));
            }
            self.file_index += 1;
            self.docs_in_current = 0;
        }
    }
}

impl Drop for BackupDocumentWriter {
    fn drop(&mut self) {
        self.close();
    }
}

enum FileSource {
    Plain(BufReader<File>),
    Compressed(zstd::Decoder<'static, BufReader<File>>),
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileSource::Plain(r) => r.read(buf),
            FileSource::Compressed(r) => r.read(buf),
        }
    }
}

/// Reads a numbered file sequence back, crossing file boundaries
/// transparently and detecting compression per file from the suffix.
pub struct BackupDocumentReader {
    directory: PathBuf,
    prefix: String,
    problems: Arc<Problems>,
    current: Option<FileSource>,
    file_index: usize,
    exhausted: bool,
}

impl BackupDocumentReader {
    pub fn new(directory: &Path, prefix: &str, problems: Arc<Problems>) -> Self {
        BackupDocumentReader {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            problems,
            current: None,
            file_index: 0,
            exhausted: false,
        }
    }

    /// Next document in write order, or None once every file is exhausted.
    /// Damaged entries or files record a problem and reading skips to the
    /// next file.
    pub fn read(&mut self) -> Option<(NodeKey, Document)> {
        loop {
            if self.exhausted {
                return None;
            }
            if self.current.is_none() && !self.open_current_file() {
                return None;
            }
            let source = self.current.as_mut()?;

            let mut len_bytes = [0u8; 4];
            match source.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    // Clean end of this file; move on to the next.
                    self.advance_file();
                    continue;
                }
                Err(err) => {
                    self.problems
                        .record(format!("failed to read backup entry length: {}", err));
                    self.advance_file();
                    continue;
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            if let Err(err) = source.read_exact(&mut payload) {
                self.problems
                    .record(format!("truncated backup entry: {}", err));
                self.advance_file();
                continue;
            }
            match bincode::deserialize::<(NodeKey, Document)>(&payload) {
                Ok(entry) => return Some(entry),
                Err(err) => {
                    self.problems
                        .record(format!("corrupt backup entry: {}", err));
                    self.advance_file();
                    continue;
                }
            }
        }
    }

    fn advance_file(&mut self) {
        self.current = None;
        self.file_index += 1;
    }

    /// Open the file at the current index, detecting compression from which
    /// suffix exists on disk. Returns false when the sequence has ended.
    fn open_current_file(&mut self) -> bool {
        let plain = file_path(&self.directory, &self.prefix, self.file_index, false);
        let compressed = file_path(&self.directory, &self.prefix, self.file_index, true);

        let (path, is_compressed) = if plain.exists() {
            (plain, false)
        } else if compressed.exists() {
            (compressed, true)
        } else {
            self.exhausted = true;
            return false;
        };

        match File::open(&path) {
            Ok(file) => {
                let buffered = BufReader::new(file);
                let source = if is_compressed {
                    match zstd::Decoder::with_buffer(buffered) {
                        Ok(decoder) => FileSource::Compressed(decoder),
                        Err(err) => {
                            self.problems.record(format!(
                                "failed to open compressed backup file {}: {}",
                                path.display(),
                                err
                            ));
                            self.advance_file();
                            return !self.exhausted;
                        }
                    }
                } else {
                    FileSource::Plain(buffered)
                };
                self.current = Some(source);
                true
            }
            Err(err) => {
                self.problems.record(format!(
                    "failed to open backup file {}: {}",
                    path.display(),
                    err
                ));
                self.advance_file();
                true
            }
        }
    }
}

/// Write the store's entire document population into `directory`.
pub fn backup_repository(
    store: &dyn DocumentStore,
    directory: &Path,
    options: &BackupOptions,
) -> Arc<Problems> {
    let problems = Problems::new();
    let writer = BackupDocumentWriter::new(
        directory,
        DOCUMENTS_PREFIX,
        options.clone(),
        problems.clone(),
    );
    let mut writer = match writer {
        Ok(writer) => writer,
        Err(err) => {
            problems.record(format!("failed to start backup: {}", err));
            return problems;
        }
    };
    match store.entries() {
        Ok(entries) => {
            for (key, document, _) in entries {
                // Writer-closed is impossible here; problems carry the rest.
                let _ = writer.write(&key, &document);
            }
        }
        Err(err) => problems.record(format!("failed to enumerate documents: {}", err)),
    }
    writer.close();
    info!(
        directory = %directory.display(),
        documents = writer.total_written(),
        problems = problems.len(),
        "Repository backup finished"
    );
    problems
}

/// Replace the store's content with the population read from `directory`.
pub fn restore_repository(store: &dyn DocumentStore, directory: &Path) -> Arc<Problems> {
    let problems = Problems::new();
    if let Err(err) = store.clear() {
        problems.record(format!("failed to clear existing documents: {}", err));
        return problems;
    }
    let mut reader = BackupDocumentReader::new(directory, DOCUMENTS_PREFIX, problems.clone());
    let mut restored = 0u64;
    while let Some((key, document)) = reader.read() {
        match store.compare_and_put(&key, None, document) {
            Ok(true) => restored += 1,
            Ok(false) => problems.record(format!("document {} already restored; skipped", key)),
            Err(err) => problems.record(format!("failed to restore document {}: {}", key, err)),
        }
    }
    info!(
        directory = %directory.display(),
        documents = restored,
        problems = problems.len(),
        "Repository restore finished"
    );
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PropertyValue;

    fn sample_documents() -> Vec<(NodeKey, Document)> {
        let mut small = Document::new("nt:file", None);
        small.set_property("title", PropertyValue::from("small"));

        let mut medium = Document::new("nt:folder", Some(NodeKey::root("ws")));
        for i in 0..20 {
            medium.add_child(&format!("child-{}", i), NodeKey::new("ws", &format!("c{}", i)));
        }

        let mut large = Document::new("nt:unstructured", None);
        for i in 0..200 {
            large.set_property(
                &format!("prop-{}", i),
                PropertyValue::String("x".repeat(50)),
            );
        }

        vec![
            (NodeKey::new("ws", "small"), small),
            (NodeKey::new("ws", "medium"), medium),
            (NodeKey::new("ws", "large"), large),
        ]
    }

    fn round_trip(documents_per_file: usize, compress: bool) {
        let dir = tempfile::tempdir().unwrap();
        let problems = Problems::new();
        let options = BackupOptions {
            documents_per_file,
            compress,
        };
        let docs = sample_documents();

        let mut writer =
            BackupDocumentWriter::new(dir.path(), "backup", options, problems.clone()).unwrap();
        for (key, doc) in &docs {
            writer.write(key, doc).unwrap();
        }
        writer.close();

        let mut reader = BackupDocumentReader::new(dir.path(), "backup", problems.clone());
        let mut read_back = Vec::new();
        while let Some(entry) = reader.read() {
            read_back.push(entry);
        }
        // Exhausted readers keep returning None.
        assert!(reader.read().is_none());
        assert!(reader.read().is_none());

        assert_eq!(read_back, docs);
        assert!(problems.is_empty(), "problems: {:?}", problems.messages());
    }

    #[test]
    fn test_round_trip_plain_single_file() {
        round_trip(usize::MAX, false);
    }

    #[test]
    fn test_round_trip_plain_one_document_per_file() {
        round_trip(1, false);
    }

    #[test]
    fn test_round_trip_compressed_single_file() {
        round_trip(usize::MAX, true);
    }

    #[test]
    fn test_round_trip_compressed_one_document_per_file() {
        round_trip(1, true);
    }

    #[test]
    fn test_rollover_uses_sequential_indices() {
        let dir = tempfile::tempdir().unwrap();
        let problems = Problems::new();
        let options = BackupOptions {
            documents_per_file: 1,
            compress: false,
        };
        let mut writer =
            BackupDocumentWriter::new(dir.path(), "backup", options, problems.clone()).unwrap();
        for (key, doc) in sample_documents() {
            writer.write(&key, &doc).unwrap();
        }
        writer.close();

        for index in 0..3 {
            assert!(dir.path().join(format!("backup-{}", index)).exists());
        }
        assert!(!dir.path().join("backup-3").exists());
    }

    #[test]
    fn test_write_after_close_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let problems = Problems::new();
        let mut writer = BackupDocumentWriter::new(
            dir.path(),
            "backup",
            BackupOptions::default(),
            problems,
        )
        .unwrap();
        writer.close();
        writer.close(); // idempotent

        let (key, doc) = &sample_documents()[0];
        assert!(writer.write(key, doc).is_err());
    }

    #[test]
    fn test_reader_skips_corrupt_file_and_records_problem() {
        let dir = tempfile::tempdir().unwrap();
        let problems = Problems::new();
        let options = BackupOptions {
            documents_per_file: 1,
            compress: false,
        };
        let docs = sample_documents();
        let mut writer =
            BackupDocumentWriter::new(dir.path(), "backup", options, problems.clone()).unwrap();
        for (key, doc) in &docs {
            writer.write(key, doc).unwrap();
        }
        writer.close();

        // Truncate the middle file: the length prefix claims 9 bytes but
        // no payload follows.
        std::fs::write(dir.path().join("backup-1"), [9, 0, 0, 0]).unwrap();

        let mut reader = BackupDocumentReader::new(dir.path(), "backup", problems.clone());
        let mut read_back = Vec::new();
        while let Some(entry) = reader.read() {
            read_back.push(entry);
        }
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0], docs[0]);
        assert_eq!(read_back[1], docs[2]);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn test_empty_directory_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let problems = Problems::new();
        let mut reader = BackupDocumentReader::new(dir.path(), "backup", problems.clone());
        assert!(reader.read().is_none());
        assert!(problems.is_empty());
    }
}
