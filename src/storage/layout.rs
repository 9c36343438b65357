//! File layout
//!
//! Maps global content offsets onto the files of a torrent.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::torrent::TorrentInfo;

/// One output file and its place in the content stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Global offset of the first byte
    pub offset: u64,
    pub length: u64,
}

/// A contiguous run of bytes that lands in a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Index into [`FileLayout::files`]
    pub file_index: usize,
    pub file_offset: u64,
    /// Range within the source buffer
    pub buffer_range: Range<usize>,
}

/// Ordered file entries covering the whole content
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileEntry>,
    total_length: u64,
}

impl FileLayout {
    /// Lay out a torrent below `root`.
    ///
    /// Single-file torrents write `root/<name>`; multi-file torrents write
    /// `root/<name>/<path...>`.
    pub fn new(root: &Path, info: &TorrentInfo) -> Self {
        let lengths: Vec<(PathBuf, u64)> = match &info.files {
            Some(files) => {
                let dir = root.join(&info.name);
                files.iter().map(|f| (dir.join(f.relative_path()), f.length)).collect()
            }
            None => vec![(root.join(&info.name), info.length)],
        };
        Self::from_lengths(lengths)
    }

    /// Build a layout from ordered `(path, length)` pairs
    pub fn from_lengths(lengths: impl IntoIterator<Item = (PathBuf, u64)>) -> Self {
        let mut offset = 0u64;
        let files = lengths
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry { path, offset, length };
                offset += length;
                entry
            })
            .collect();
        Self { files, total_length: offset }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Split the global byte range `[offset, offset + len)` at file boundaries.
    ///
    /// Zero-length files never receive a segment. Bytes past the end of the
    /// content are not covered.
    pub fn segments(&self, offset: u64, len: usize) -> Vec<Segment> {
        let end = offset + len as u64;
        let first = self.files.partition_point(|f| f.offset + f.length <= offset);

        self.files[first..]
            .iter()
            .enumerate()
            .take_while(|(_, f)| f.offset < end)
            .filter(|(_, f)| f.length > 0)
            .map(|(i, f)| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                Segment {
                    file_index: first + i,
                    file_offset: start - f.offset,
                    buffer_range: (start - offset) as usize..(stop - offset) as usize,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn layout() -> FileLayout {
        FileLayout::from_lengths(vec![
            (PathBuf::from("a"), 100),
            (PathBuf::from("b"), 50),
            (PathBuf::from("c"), 200),
        ])
    }

    fn seg(file_index: usize, file_offset: u64, buffer_range: Range<usize>) -> Segment {
        Segment { file_index, file_offset, buffer_range }
    }

    #[test]
    fn test_piece_inside_one_file() {
        assert_eq!(layout().segments(0, 80), vec![seg(0, 0, 0..80)]);
    }

    #[test]
    fn test_piece_spanning_two_files() {
        // piece 1: [80, 160)
        assert_eq!(
            layout().segments(80, 80),
            vec![seg(0, 80, 0..20), seg(1, 0, 20..70), seg(2, 0, 70..80)]
        );
    }

    #[test]
    fn test_piece_inside_last_file() {
        // piece 2: [160, 240)
        assert_eq!(layout().segments(160, 80), vec![seg(2, 10, 0..80)]);
    }

    #[test]
    fn test_short_final_piece() {
        // piece 4: [320, 350)
        assert_eq!(layout().segments(320, 30), vec![seg(2, 170, 0..30)]);
    }

    #[test]
    fn test_zero_length_files_skipped() {
        let layout = FileLayout::from_lengths(vec![
            (PathBuf::from("a"), 4),
            (PathBuf::from("empty"), 0),
            (PathBuf::from("b"), 4),
        ]);
        assert_eq!(layout.segments(2, 4), vec![seg(0, 2, 0..2), seg(2, 0, 2..4)]);
    }

    #[test]
    fn test_paths_from_torrent() {
        let mut info = TorrentInfo::single_file("bundle", [0u8; 20], 80, vec![[0u8; 20]; 5], 350);
        info.files = Some(vec![
            TorrentFile { path: vec!["a".into()], length: 100 },
            TorrentFile { path: vec!["b".into()], length: 50 },
            TorrentFile { path: vec!["sub".into(), "c".into()], length: 200 },
        ]);
        let layout = FileLayout::new(Path::new("/out"), &info);
        assert_eq!(layout.files()[2].path, PathBuf::from("/out/bundle/sub/c"));
        assert_eq!(layout.files()[2].offset, 150);
        assert_eq!(layout.total_length(), 350);

        let single = TorrentInfo::from_content("data.bin", b"0123456789", 4);
        let layout = FileLayout::new(Path::new("/out"), &single);
        assert_eq!(layout.files()[0].path, PathBuf::from("/out/data.bin"));
    }
}
