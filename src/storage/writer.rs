//! Output writer
//!
//! Single consumer of verified pieces. Creates every output file up front and
//! then performs positioned writes in whatever order pieces arrive.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TorrentError};
use crate::storage::layout::FileLayout;
use crate::torrent::TorrentInfo;

/// A hash-checked piece on its way to disk
#[derive(Debug, Clone)]
pub struct VerifiedPiece {
    pub index: u32,
    pub data: Bytes,
}

/// Writes verified pieces into the output files
#[derive(Debug)]
pub struct OutputWriter {
    layout: FileLayout,
    handles: Vec<File>,
    piece_length: u64,
    piece_count: usize,
}

impl OutputWriter {
    /// Create parent directories and every output file, pre-sized
    pub async fn create(root: &Path, info: &TorrentInfo) -> Result<Self> {
        let layout = FileLayout::new(root, info);
        info!(
            "Creating {} output file(s) below {}",
            layout.files().len(),
            root.display()
        );

        let mut handles = Vec::with_capacity(layout.files().len());
        for entry in layout.files() {
            if let Some(parent) = entry.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", path_str(parent), e.to_string())
                })?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&entry.path)
                .await
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", entry.path.display(), e);
                    TorrentError::storage_error_full("Failed to create file", path_str(&entry.path), e.to_string())
                })?;
            file.set_len(entry.length).await.map_err(|e| {
                error!("Failed to set file length for '{}': {}", entry.path.display(), e);
                TorrentError::storage_error_full("Failed to set file length", path_str(&entry.path), e.to_string())
            })?;
            debug!("Created {} ({} bytes)", entry.path.display(), entry.length);
            handles.push(file);
        }

        Ok(Self {
            layout,
            handles,
            piece_length: info.piece_length,
            piece_count: info.piece_count(),
        })
    }

    /// Paths of every output file, in layout order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.layout.files().iter().map(|f| f.path.clone()).collect()
    }

    /// Consume pieces until all of them are written or the channel closes.
    ///
    /// Returns the number of distinct pieces written.
    pub async fn run(mut self, mut rx: mpsc::Receiver<VerifiedPiece>) -> Result<usize> {
        let mut written = HashSet::with_capacity(self.piece_count);

        while written.len() < self.piece_count {
            let Some(piece) = rx.recv().await else {
                debug!("Piece channel closed after {} pieces", written.len());
                break;
            };
            if written.contains(&piece.index) {
                warn!("Ignoring duplicate piece {}", piece.index);
                continue;
            }
            self.write_piece(&piece).await?;
            written.insert(piece.index);
            debug!("Wrote piece {} ({}/{})", piece.index, written.len(), self.piece_count);
        }

        self.sync_all().await?;
        info!("Output writer finished: {}/{} pieces", written.len(), self.piece_count);
        Ok(written.len())
    }

    async fn write_piece(&mut self, piece: &VerifiedPiece) -> Result<()> {
        let offset = piece.index as u64 * self.piece_length;
        let segments = self.layout.segments(offset, piece.data.len());
        if offset + piece.data.len() as u64 > self.layout.total_length() {
            return Err(TorrentError::storage_error(format!(
                "piece {} extends past the end of the content",
                piece.index
            )));
        }

        for segment in segments {
            let path = &self.layout.files()[segment.file_index].path;
            let file = &mut self.handles[segment.file_index];
            file.seek(SeekFrom::Start(segment.file_offset)).await.map_err(|e| {
                error!("Failed to seek in '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to seek", path_str(path), e.to_string())
            })?;
            file.write_all(&piece.data[segment.buffer_range]).await.map_err(|e| {
                error!("Failed to write to '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to write data", path_str(path), e.to_string())
            })?;
        }
        Ok(())
    }

    async fn sync_all(&mut self) -> Result<()> {
        for (file, entry) in self.handles.iter_mut().zip(self.layout.files()) {
            file.flush().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to flush file", path_str(&entry.path), e.to_string())
            })?;
            file.sync_all().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to sync file", path_str(&entry.path), e.to_string())
            })?;
        }
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn multi_file_info(content: &[u8]) -> TorrentInfo {
        let mut info = TorrentInfo::from_content("bundle", content, 80);
        info.files = Some(vec![
            TorrentFile { path: vec!["a".into()], length: 100 },
            TorrentFile { path: vec!["b".into()], length: 50 },
            TorrentFile { path: vec!["sub".into(), "c".into()], length: 200 },
        ]);
        info
    }

    #[tokio::test]
    async fn test_out_of_order_multi_file_write() {
        let content: Vec<u8> = (0..350u32).map(|i| (i % 251) as u8).collect();
        let info = multi_file_info(&content);
        let dir = tempfile::tempdir().unwrap();

        let writer = OutputWriter::create(dir.path(), &info).await.unwrap();
        assert!(dir.path().join("bundle/sub/c").exists());

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(writer.run(rx));
        for index in [4u32, 1, 3, 1, 0, 2] {
            let (start, end) = info.piece_range(index as usize).unwrap();
            let data = Bytes::copy_from_slice(&content[start as usize..end as usize]);
            tx.send(VerifiedPiece { index, data }).await.unwrap();
        }
        assert_eq!(handle.await.unwrap().unwrap(), 5);

        let a = std::fs::read(dir.path().join("bundle/a")).unwrap();
        let b = std::fs::read(dir.path().join("bundle/b")).unwrap();
        let c = std::fs::read(dir.path().join("bundle/sub/c")).unwrap();
        assert_eq!(a, &content[..100]);
        assert_eq!(b, &content[100..150]);
        assert_eq!(c, &content[150..]);
    }

    #[tokio::test]
    async fn test_stops_when_channel_closes() {
        let info = TorrentInfo::from_content("data.bin", b"0123456789", 4);
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::create(dir.path(), &info).await.unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("data.bin")).unwrap().len(), 10);

        let (tx, rx) = mpsc::channel(2);
        tx.send(VerifiedPiece { index: 2, data: Bytes::from_static(b"89") }).await.unwrap();
        drop(tx);

        assert_eq!(writer.run(rx).await.unwrap(), 1);
        let data = std::fs::read(dir.path().join("data.bin")).unwrap();
        assert_eq!(&data[8..], b"89");
    }

    #[tokio::test]
    async fn test_create_fails_on_unwritable_root() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let info = multi_file_info(&[0u8; 350]);
        let err = OutputWriter::create(&blocker, &info).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
