//! Resolving overlapping chunks into the bytes a reader sees
//!
//! Chunks are applied in version order. A later chunk hides whatever older
//! chunks it overlaps; ranges no chunk covers read as zeros.

use crate::filer::entry::FileChunk;
use std::collections::HashSet;

/// A range of the file served by one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibleInterval {
    pub start: u64,
    pub stop: u64,
    pub fid: String,
    /// Logical offset of the chunk the bytes come from
    pub chunk_offset: u64,
}

/// One read against one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkView {
    pub fid: String,
    pub offset_in_chunk: u64,
    pub size: u64,
    pub logical_offset: u64,
}

pub fn visible_intervals(chunks: &[FileChunk]) -> Vec<VisibleInterval> {
    let mut ordered: Vec<&FileChunk> = chunks.iter().collect();
    // Stable: chunks with equal versions keep list order
    ordered.sort_by_key(|c| c.version);

    let mut visible: Vec<VisibleInterval> = Vec::new();
    for chunk in ordered {
        if chunk.size == 0 {
            continue;
        }
        let (start, stop) = (chunk.offset, chunk.end());
        let mut next = Vec::with_capacity(visible.len() + 2);
        for v in visible.drain(..) {
            if v.stop <= start || v.start >= stop {
                next.push(v);
                continue;
            }
            if v.start < start {
                next.push(VisibleInterval {
                    stop: start,
                    ..v.clone()
                });
            }
            if v.stop > stop {
                next.push(VisibleInterval { start: stop, ..v });
            }
        }
        next.push(VisibleInterval {
            start,
            stop,
            fid: chunk.fid.clone(),
            chunk_offset: chunk.offset,
        });
        next.sort_by_key(|v| v.start);
        visible = next;
    }
    visible
}

/// Chunk reads covering `[offset, offset + len)`, in file order
pub fn read_plan(chunks: &[FileChunk], offset: u64, len: u64) -> Vec<ChunkView> {
    let end = offset.saturating_add(len);
    visible_intervals(chunks)
        .into_iter()
        .filter_map(|v| {
            let start = v.start.max(offset);
            let stop = v.stop.min(end);
            (start < stop).then(|| ChunkView {
                offset_in_chunk: start - v.chunk_offset,
                size: stop - start,
                logical_offset: start,
                fid: v.fid,
            })
        })
        .collect()
}

/// Split chunks into those still visible somewhere and those fully hidden.
pub fn compact_chunks(chunks: Vec<FileChunk>) -> (Vec<FileChunk>, Vec<FileChunk>) {
    let live: HashSet<String> = visible_intervals(&chunks)
        .into_iter()
        .map(|v| v.fid)
        .collect();
    chunks.into_iter().partition(|c| live.contains(&c.fid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(fid: &str, offset: u64, size: u64, version: i64) -> FileChunk {
        FileChunk {
            fid: fid.into(),
            offset,
            size,
            version,
            etag: String::new(),
        }
    }

    #[test]
    fn test_sequential_chunks() {
        let chunks = vec![chunk("a", 0, 4, 1), chunk("b", 4, 4, 2)];
        let views = read_plan(&chunks, 2, 4);
        assert_eq!(
            views,
            vec![
                ChunkView {
                    fid: "a".into(),
                    offset_in_chunk: 2,
                    size: 2,
                    logical_offset: 2
                },
                ChunkView {
                    fid: "b".into(),
                    offset_in_chunk: 0,
                    size: 2,
                    logical_offset: 4
                },
            ]
        );
    }

    #[test]
    fn test_later_chunk_shadows_middle() {
        // a covers [0,10), b overwrites [3,6)
        let chunks = vec![chunk("a", 0, 10, 1), chunk("b", 3, 3, 2)];
        let visible = visible_intervals(&chunks);
        let spans: Vec<(u64, u64, &str)> = visible
            .iter()
            .map(|v| (v.start, v.stop, v.fid.as_str()))
            .collect();
        assert_eq!(spans, vec![(0, 3, "a"), (3, 6, "b"), (6, 10, "a")]);

        let views = read_plan(&chunks, 5, 3);
        assert_eq!(views[0].fid, "b");
        assert_eq!(views[0].offset_in_chunk, 2);
        assert_eq!(views[1].fid, "a");
        assert_eq!(views[1].offset_in_chunk, 6);
    }

    #[test]
    fn test_version_order_not_list_order() {
        // Listed first but newer
        let chunks = vec![chunk("new", 0, 4, 9), chunk("old", 0, 8, 1)];
        let spans: Vec<(u64, u64, String)> = visible_intervals(&chunks)
            .into_iter()
            .map(|v| (v.start, v.stop, v.fid))
            .collect();
        assert_eq!(spans, vec![(0, 4, "new".into()), (4, 8, "old".into())]);
    }

    #[test]
    fn test_holes_are_skipped() {
        let chunks = vec![chunk("a", 0, 2, 1), chunk("b", 6, 2, 1)];
        let views = read_plan(&chunks, 0, 8);
        assert_eq!(views.len(), 2);
        assert_eq!(views[1].logical_offset, 6);
    }

    #[test]
    fn test_compact_drops_hidden_chunks() {
        let chunks = vec![
            chunk("a", 0, 4, 1),
            chunk("b", 0, 8, 2),
            chunk("c", 6, 4, 3),
        ];
        let (live, garbage) = compact_chunks(chunks);
        let live: Vec<&str> = live.iter().map(|c| c.fid.as_str()).collect();
        assert_eq!(live, vec!["b", "c"]);
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].fid, "a");
    }
}
